// Swapchain - Window presentation
//
// Owns the surface, the chain of images we render to and present, and one
// acquire semaphore per buffer slot. The swapchain always holds an acquired
// image between frames: construction, present and resize all end by
// acquiring the next one.

use anyhow::{bail, Context, Result};
use ash::vk;

use super::command::{CommandPool, SwapchainId};
use super::deletion::RhiResource;
use super::rhi::{Acquired, DeviceRef, PresentStatus, SwapchainDesc, WindowHandle};
use super::slots::{ImageIndex, Slots, SyncIndex, MAX_BUFFER_COUNT};
use super::sync::{Semaphore, SyncState};
use super::types::{color_space, Format, GpuVendor, ImageLayout, PresentMode};
use crate::display::Display;

struct Backbuffer {
    image: vk::Image,
    view: vk::ImageView,
    layout: ImageLayout,
}

pub struct SwapChain {
    id: SwapchainId,
    name: String,
    window: WindowHandle,
    width: u32,
    height: u32,
    format: Format,
    buffer_count: u32,
    present_mode: PresentMode,
    present_mode_resolved: vk::PresentModeKHR,
    present_enabled: bool,

    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    backbuffers: Slots<Backbuffer, ImageIndex>,
    acquire_semaphores: Slots<Semaphore, SyncIndex>,

    image_index: Option<ImageIndex>,
    image_index_previous: Option<ImageIndex>,
    sync_index: SyncIndex,

    // Reused every present to avoid a per-frame allocation
    wait_semaphores: Vec<vk::Semaphore>,
    device: DeviceRef,
}

impl SwapChain {
    /// Create a swapchain for `window` and acquire its first image.
    ///
    /// An invalid resolution is not an error: the swapchain is returned with
    /// presenting disabled and no GPU resources, and a later `resize` with a
    /// valid size brings it to life.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: DeviceRef,
        window: WindowHandle,
        width: u32,
        height: u32,
        format: Format,
        buffer_count: u32,
        present_mode: PresentMode,
        name: &str,
    ) -> Result<Self> {
        assert!(
            buffer_count >= 1 && buffer_count as usize <= MAX_BUFFER_COUNT,
            "Buffer count must be between 1 and {}",
            MAX_BUFFER_COUNT
        );

        let mut swapchain = Self {
            id: SwapchainId::next(),
            name: name.to_owned(),
            window,
            width,
            height,
            format,
            buffer_count,
            present_mode,
            present_mode_resolved: vk::PresentModeKHR::FIFO,
            present_enabled: false,
            surface: vk::SurfaceKHR::null(),
            swapchain: vk::SwapchainKHR::null(),
            backbuffers: Slots::empty(),
            acquire_semaphores: Slots::empty(),
            image_index: None,
            image_index_previous: None,
            sync_index: SyncIndex::default(),
            wait_semaphores: Vec::with_capacity(MAX_BUFFER_COUNT + 1),
            device,
        };

        if !swapchain.device.is_valid_resolution(width, height) {
            log::warn!("{}x{} is an invalid resolution", width, height);
            return Ok(swapchain);
        }

        swapchain.create()?;
        swapchain.present_enabled = true;
        swapchain.acquire_next_image()?;

        Ok(swapchain)
    }

    fn create(&mut self) -> Result<()> {
        let device = self.device.clone();

        // Surface
        let surface = device
            .create_surface(&self.window)
            .context("Failed to create window surface")?;
        self.surface = surface;

        if !device.surface_support(surface)? {
            bail!("The device does not support this kind of surface");
        }

        // Extent
        let capabilities = device
            .surface_capabilities(surface)
            .context("Failed to get surface capabilities")?;
        self.width = self
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width);
        self.height = self
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height);
        let extent = vk::Extent2D {
            width: self.width,
            height: self.height,
        };

        // Format
        let color_space = color_space(self.is_hdr());
        let supported_formats = device
            .surface_formats(surface)
            .context("Failed to get surface formats")?;
        self.format = match resolve_format(device.vendor(), self.format, color_space, &supported_formats) {
            Some(format) => format,
            None => bail!("The surface doesn't support {:?} with {:?}", self.format, color_space),
        };

        // Present mode
        let present_modes = device
            .surface_present_modes(surface)
            .context("Failed to get surface present modes")?;
        self.present_mode_resolved = self.present_mode.resolve(&present_modes);

        let mut min_image_count = self.buffer_count.max(capabilities.min_image_count);
        if capabilities.max_image_count > 0 {
            min_image_count = min_image_count.min(capabilities.max_image_count);
        }

        log::info!(
            "Creating swapchain {}: {}x{}, {:?}, {:?}",
            self.name,
            self.width,
            self.height,
            self.format,
            self.present_mode_resolved
        );

        self.swapchain = device
            .create_swapchain(&SwapchainDesc {
                surface,
                min_image_count,
                format: self.format.to_vk(),
                color_space,
                extent,
                pre_transform: capabilities.current_transform,
                present_mode: self.present_mode_resolved,
                name: &self.name,
            })
            .context("Failed to create swapchain")?;

        let images = device
            .swapchain_images(self.swapchain)
            .context("Failed to get swapchain images")?;

        // Images start out undefined, move them to something we can render into
        let cmd = device.immediate_begin()?;
        for &image in &images {
            device.cmd_image_barrier(cmd, image, ImageLayout::Undefined, ImageLayout::ColorAttachment);
        }
        device.immediate_submit(cmd)?;

        let backbuffers = images
            .iter()
            .enumerate()
            .map(|(i, &image)| {
                let view = device
                    .create_image_view(image, self.format.to_vk(), &format!("swapchain_image_{}", i))
                    .context("Failed to create swapchain image view")?;
                Ok(Backbuffer {
                    image,
                    view,
                    layout: ImageLayout::ColorAttachment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.backbuffers = Slots::new(backbuffers);

        let semaphores = (0..self.buffer_count)
            .map(|i| Semaphore::new(device.clone(), false, Some(&format!("swapchain_image_acquired_{}", i))))
            .collect::<Result<Vec<_>>>()?;
        self.acquire_semaphores = Slots::new(semaphores);

        log::info!("Created swapchain {} with {} images", self.name, images.len());

        Ok(())
    }

    fn destroy(&mut self) {
        // Each semaphore waits for idle before it goes away
        drop(self.acquire_semaphores.take());

        for backbuffer in self.backbuffers.take() {
            self.device.retire(RhiResource::TextureView(backbuffer.view));
        }

        if let Err(e) = self.device.queue_wait_all() {
            log::error!("Failed to wait for idle before destroying swapchain {}: {:?}", self.name, e);
        }

        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }

        if self.surface != vk::SurfaceKHR::null() {
            self.device.destroy_surface(self.surface);
            self.surface = vk::SurfaceKHR::null();
        }
    }

    /// Tear everything down and build it again at the current size and format.
    /// On failure presenting is disabled until a resize manages to recreate it.
    fn recreate(&mut self) -> Result<()> {
        self.destroy();
        self.image_index = None;
        self.image_index_previous = None;

        if let Err(e) = self.create() {
            // Release whatever was built before the failure
            self.destroy();
            self.present_enabled = false;
            return Err(e);
        }

        Ok(())
    }

    /// Recreate the swapchain at a new size.
    ///
    /// Returns false without touching anything if the size is unchanged and
    /// `force` is not set, or if the size is invalid (e.g. a minimized window),
    /// in which case presenting stays disabled until a valid size arrives.
    /// A swapchain lost to a failed recreation is always rebuilt.
    pub fn resize(&mut self, width: u32, height: u32, force: bool) -> Result<bool> {
        if !self.device.is_valid_resolution(width, height) {
            self.present_enabled = false;
            return Ok(false);
        }

        // A chain lost to a failed recreation is rebuilt even at the same size
        let initialised = self.swapchain != vk::SwapchainKHR::null();
        if initialised && !force && self.width == width && self.height == height {
            self.present_enabled = true;
            return Ok(false);
        }

        self.width = width;
        self.height = height;

        self.recreate()?;
        self.present_enabled = true;
        self.acquire_next_image()?;

        log::info!("Resized swapchain {} to {}x{}", self.name, self.width, self.height);

        Ok(true)
    }

    /// Acquire the next image, arming the next acquire semaphore.
    ///
    /// An out of date surface triggers one recreation and retry.
    pub fn acquire_next_image(&mut self) -> Result<()> {
        assert!(self.present_enabled, "No need to acquire next image when presenting is disabled");

        // A single buffer is acquired once and kept
        if self.buffer_count == 1 && self.image_index.is_some() {
            return Ok(());
        }

        if let Acquired::Image { .. } = self.try_acquire()? {
            return Ok(());
        }

        log::warn!("Swapchain {} is out of date, recreating", self.name);
        self.recreate()?;

        match self.try_acquire()? {
            Acquired::Image { .. } => Ok(()),
            Acquired::OutOfDate => bail!("Swapchain {} is still out of date after recreation", self.name),
        }
    }

    fn try_acquire(&mut self) -> Result<Acquired> {
        self.sync_index = self.sync_index.next(self.buffer_count as usize);
        let semaphore = &mut self.acquire_semaphores[self.sync_index];

        assert!(
            semaphore.cpu_state() != SyncState::Submitted,
            "The semaphore is already signaled"
        );

        self.image_index_previous = self.image_index;

        let acquired = self
            .device
            .acquire_next_image(self.swapchain, semaphore.handle(), u64::MAX)
            .context("Failed to acquire next image")?;

        if let Acquired::Image { index, suboptimal } = acquired {
            self.image_index = Some(ImageIndex(index));
            semaphore.set_cpu_state(SyncState::Submitted);

            if suboptimal {
                log::debug!("Swapchain {} acquired a suboptimal image", self.name);
            }
        }

        Ok(acquired)
    }

    /// Present the acquired image, then acquire the next one.
    ///
    /// Waits on the acquire semaphore and on the processed semaphore of every
    /// command pool rendering to this swapchain that actually submitted.
    pub fn present(&mut self, command_pools: &mut [CommandPool]) -> Result<()> {
        assert!(self.swapchain != vk::SwapchainKHR::null(), "The swapchain has not been initialised");
        assert!(self.present_enabled, "Presenting is disabled");

        let image_index = match self.image_index {
            Some(index) if self.image_index != self.image_index_previous => index,
            _ => panic!("No image was acquired"),
        };
        assert!(
            self.backbuffers[image_index].layout == ImageLayout::PresentSrc,
            "The layout must be PresentSrc"
        );

        self.wait_semaphores.clear();
        {
            let acquire_semaphore = &self.acquire_semaphores[self.sync_index];
            if acquire_semaphore.cpu_state() == SyncState::Submitted {
                self.wait_semaphores.push(acquire_semaphore.handle());
            }

            for pool in command_pools.iter().filter(|pool| pool.swapchain_id() == self.id) {
                let semaphore = pool.current_command_list().semaphore_processed();

                // Discarded command lists were never submitted, nothing will signal them
                if semaphore.cpu_state() == SyncState::Submitted {
                    self.wait_semaphores.push(semaphore.handle());
                }
            }
        }

        assert!(!self.wait_semaphores.is_empty(), "Present should wait on at least one semaphore");

        let status = self
            .device
            .queue_present(self.swapchain, image_index.0, &self.wait_semaphores)
            .context("Failed to present")?;

        // Present consumed every signal it waited on
        self.acquire_semaphores[self.sync_index].set_cpu_state(SyncState::Idle);
        for pool in command_pools.iter_mut().filter(|pool| pool.swapchain_id() == self.id) {
            pool.current_command_list_mut()
                .semaphore_processed_mut()
                .set_cpu_state(SyncState::Idle);
        }

        match status {
            PresentStatus::Optimal => {}
            PresentStatus::Suboptimal => log::debug!("Swapchain {} presented suboptimally", self.name),
            PresentStatus::OutOfDate => {
                log::warn!("Swapchain {} went out of date while presenting, recreating", self.name);
                self.recreate()?;
            }
        }

        self.acquire_next_image()
    }

    /// Record a transition of the acquired image into `layout`
    pub fn set_layout(&mut self, layout: ImageLayout, cmd: vk::CommandBuffer) {
        let Some(image_index) = self.image_index else {
            panic!("No image was acquired");
        };
        let backbuffer = &mut self.backbuffers[image_index];

        if backbuffer.layout == layout {
            return;
        }

        self.device
            .cmd_image_barrier(cmd, backbuffer.image, backbuffer.layout, layout);
        backbuffer.layout = layout;
    }

    /// Switch between SDR and HDR output, recreating the swapchain if the format changes.
    /// Returns whether anything changed.
    pub fn set_hdr(&mut self, enabled: bool, display: &Display) -> Result<bool> {
        if enabled {
            assert!(display.hdr(), "This display doesn't support HDR");
        }

        if enabled == self.is_hdr() {
            return Ok(false);
        }

        let previous = self.format;
        self.format = Format::for_hdr(enabled);
        if let Err(e) = self.resize(self.width, self.height, true) {
            if self.swapchain == vk::SwapchainKHR::null() {
                self.format = previous;
            }
            return Err(e);
        }
        log::info!("HDR has been {}", if enabled { "enabled" } else { "disabled" });

        Ok(true)
    }

    pub fn id(&self) -> SwapchainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_hdr(&self) -> bool {
        self.format.is_hdr()
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode_resolved
    }

    pub fn present_enabled(&self) -> bool {
        self.present_enabled
    }

    pub fn image_index(&self) -> Option<ImageIndex> {
        self.image_index
    }

    pub fn image_index_previous(&self) -> Option<ImageIndex> {
        self.image_index_previous
    }

    pub fn sync_index(&self) -> SyncIndex {
        self.sync_index
    }

    /// Whether an image is held that hasn't been presented yet
    pub fn has_acquired_image(&self) -> bool {
        self.image_index.is_some() && self.image_index != self.image_index_previous
    }

    /// Semaphore the last acquire signals. Hand it to
    /// `CommandPool::submit_after` so rendering waits for the image.
    pub fn acquire_semaphore_mut(&mut self) -> &mut Semaphore {
        &mut self.acquire_semaphores[self.sync_index]
    }

    /// The acquired image
    pub fn image(&self) -> Option<vk::Image> {
        self.image_index
            .and_then(|index| self.backbuffers.get(index))
            .map(|backbuffer| backbuffer.image)
    }

    /// View of the acquired image
    pub fn image_view(&self) -> Option<vk::ImageView> {
        self.image_index
            .and_then(|index| self.backbuffers.get(index))
            .map(|backbuffer| backbuffer.view)
    }

    /// Recorded layout of the acquired image
    pub fn layout(&self) -> Option<ImageLayout> {
        self.image_index
            .and_then(|index| self.backbuffers.get(index))
            .map(|backbuffer| backbuffer.layout)
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Pick the format to create the swapchain with.
///
/// NVIDIA exposes B8G8R8A8 rather than R8G8B8A8 for SDR output; other
/// vendors get the channel-swapped variant only if the requested one is missing.
fn resolve_format(
    vendor: GpuVendor,
    requested: Format,
    color_space: vk::ColorSpaceKHR,
    supported: &[vk::SurfaceFormatKHR],
) -> Option<Format> {
    let preferred = if requested == Format::R8G8B8A8Unorm && vendor == GpuVendor::Nvidia {
        Format::B8G8R8A8Unorm
    } else {
        requested
    };

    let is_supported = |format: Format| {
        supported
            .iter()
            .any(|s| s.format == format.to_vk() && s.color_space == color_space)
    };

    std::iter::once(preferred)
        .chain(preferred.channel_swapped())
        .find(|&format| is_supported(format))
}
