// Device service interface
//
// Everything the swapchain, semaphores and buffers need from the GPU goes
// through `RhiDevice`: handle creation, command recording and submission,
// presentation, and deferred deletion. `VulkanDevice` is the real
// implementation; tests drive the same code through a mock.

use anyhow::Result;
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ptr::NonNull;
use std::sync::Arc;

use super::deletion::{DeletionQueue, RhiResource};
use super::types::{GpuVendor, ImageLayout};

pub use gpu_allocator::MemoryLocation;

/// Shared reference to the device service
pub type DeviceRef = Arc<dyn RhiDevice>;

/// Raw handles of the window a swapchain presents to. The window itself is
/// owned by the application and must outlive the swapchain.
#[derive(Debug, Clone, Copy)]
pub struct WindowHandle {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

impl WindowHandle {
    pub fn from_window<W: HasRawWindowHandle + HasRawDisplayHandle>(window: &W) -> Self {
        Self {
            display: window.raw_display_handle(),
            window: window.raw_window_handle(),
        }
    }
}

/// Parameters for `RhiDevice::create_buffer`
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Written through the mapping right after creation; requires a host-visible location
    pub data: Option<&'a [u8]>,
    pub name: &'a str,
}

/// A buffer created by the device. Memory stays owned by the device and is
/// released by `destroy_buffer`.
#[derive(Debug, Clone, Copy)]
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    /// Persistent host mapping, present for host-visible memory only
    pub mapped: Option<NonNull<u8>>,
}

/// Parameters for `RhiDevice::create_swapchain`
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc<'a> {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub name: &'a str,
}

/// Outcome of acquiring a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    /// The surface changed underneath the swapchain; nothing was acquired
    OutOfDate,
}

/// Outcome of presenting a swapchain image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
    OutOfDate,
}

pub trait RhiDevice: Send + Sync {
    // ---- capabilities ----------------------------------------------------

    fn vendor(&self) -> GpuVendor;

    /// Whether a render target of this size can be created
    fn is_valid_resolution(&self, width: u32, height: u32) -> bool;

    /// Block until every queue is idle
    fn queue_wait_all(&self) -> Result<()>;

    // ---- semaphores -------------------------------------------------------

    fn create_semaphore(&self, is_timeline: bool, name: Option<&str>) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Wait for a timeline semaphore to reach `value`. Ok(false) on timeout.
    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> Result<bool>;
    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()>;
    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64>;

    // ---- resources --------------------------------------------------------

    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image_view(&self, image: vk::Image, format: vk::Format, name: &str) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_image(&self, image: vk::Image);

    // ---- commands ---------------------------------------------------------

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, cmd: vk::CommandBuffer);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize);
    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, image: vk::Image, old: ImageLayout, new: ImageLayout);
    fn cmd_clear_color(&self, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]);

    /// Submit `cmd` to the graphics queue. Returns the submission value the
    /// device timeline reaches once the work has completed.
    fn queue_submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: &[vk::Semaphore],
        signal: &[vk::Semaphore],
    ) -> Result<u64>;

    // ---- submission timeline ---------------------------------------------

    /// Highest submission value the GPU has finished
    fn completed_submission(&self) -> Result<u64>;
    /// Highest submission value handed out so far
    fn last_submission(&self) -> u64;
    fn wait_for_submission(&self, submission: u64) -> Result<()>;

    // ---- presentation -----------------------------------------------------

    fn create_surface(&self, window: &WindowHandle) -> Result<vk::SurfaceKHR>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);
    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<bool>;
    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> Result<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::PresentModeKHR>>;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<Acquired>;
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &[vk::Semaphore],
    ) -> Result<PresentStatus>;

    // ---- deferred deletion ------------------------------------------------

    fn deletion_queue(&self) -> &DeletionQueue;

    /// Record and begin a one-shot command buffer
    fn immediate_begin(&self) -> Result<vk::CommandBuffer> {
        let cmd = self.allocate_command_buffer()?;
        self.begin_command_buffer(cmd)?;
        Ok(cmd)
    }

    /// Submit a one-shot command buffer and block until the GPU has run it.
    /// The command buffer is freed whether or not this succeeds.
    fn immediate_submit(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let result = self
            .end_command_buffer(cmd)
            .and_then(|()| self.queue_submit(cmd, &[], &[]))
            .and_then(|submission| self.wait_for_submission(submission));

        // A failed wait leaves the buffer pending, drain the queue before freeing it
        if result.is_err() {
            if let Err(e) = self.queue_wait_all() {
                log::error!("Failed to wait for idle after a failed immediate submit: {:?}", e);
            }
        }
        self.free_command_buffer(cmd);

        result
    }

    /// Hand `resource` over for destruction once in-flight work is done
    fn retire(&self, resource: RhiResource) {
        self.deletion_queue().push(resource, self.last_submission());
    }

    /// Destroy every retired resource whose submission has completed
    fn process_deletion_queue(&self) -> Result<usize> {
        let completed = self.completed_submission()?;
        let ready = self.deletion_queue().drain_completed(completed);
        for &resource in &ready {
            self.destroy_resource(resource);
        }
        Ok(ready.len())
    }

    fn destroy_resource(&self, resource: RhiResource) {
        match resource {
            RhiResource::Buffer(buffer) => self.destroy_buffer(buffer),
            RhiResource::Texture(image) => self.destroy_image(image),
            RhiResource::TextureView(view) => self.destroy_image_view(view),
        }
    }
}
