// rhi-core - swapchain, semaphores and staged buffers on top of Vulkan
//
// The backend is written against the `RhiDevice` service trait; `VulkanDevice`
// implements it with ash and gpu-allocator.

pub mod backend;
pub mod config;
pub mod display;
