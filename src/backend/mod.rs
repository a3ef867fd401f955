// Backend module - Vulkan abstraction layer
//
// Design: swapchain, semaphores and buffers are written against the RhiDevice
// trait; VulkanDevice is the ash implementation of it.

pub mod buffer;
pub mod command;
pub mod deletion;
pub mod device;
pub mod rhi;
pub mod slots;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use buffer::{Buffer, BufferKind, IndexBuffer, VertexBuffer};
pub use command::{CommandList, CommandListState, CommandPool, SwapchainId};
pub use deletion::{DeletionQueue, RhiResource};
pub use device::VulkanDevice;
pub use rhi::{DeviceRef, RhiDevice, WindowHandle};
pub use slots::{ImageIndex, SyncIndex, MAX_BUFFER_COUNT};
pub use swapchain::SwapChain;
pub use sync::{Semaphore, SyncState};
pub use types::{Format, GpuVendor, ImageLayout, PresentMode};
