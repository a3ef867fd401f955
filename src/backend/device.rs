// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU, timeline semaphores required)
// - Logical device + graphics queue
// - Memory allocator, command pool and submission timeline
// - The RhiDevice implementation everything above the backend talks to

use anyhow::{bail, Context, Result};
use ash::extensions::{ext, khr};
use ash::vk::{self, Handle};
use ash::Entry;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::deletion::DeletionQueue;
use super::rhi::{
    Acquired, BufferDesc, GpuBuffer, PresentStatus, RhiDevice, SwapchainDesc, WindowHandle,
};
use super::surface;
use super::types::{GpuVendor, ImageLayout};

const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device goes away
    allocator: ManuallyDrop<Mutex<Allocator>>,
    buffers: Mutex<HashMap<vk::Buffer, Allocation>>,
    deletion_queue: DeletionQueue,

    // Commands and submission
    command_pool: Mutex<vk::CommandPool>,
    graphics_queue: Mutex<vk::Queue>,
    graphics_queue_family: u32,
    submission_timeline: vk::Semaphore,
    last_submission: AtomicU64,

    // Extension loaders
    surface_loader: khr::Surface,
    swapchain_loader: khr::Swapchain,
    debug_utils: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    properties: vk::PhysicalDeviceProperties,
    vendor: GpuVendor,

    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    instance: ash::Instance,
    entry: Entry,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers (debug only)
    /// * `display` - Display the surfaces will be created for, selects the surface extensions
    pub fn new(app_name: &str, enable_validation: bool, display: RawDisplayHandle) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Pick physical device (GPU)
        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;

        // Step 5: Create logical device
        let (device, graphics_queue) =
            Self::create_logical_device(&instance, physical_device, graphics_queue_family)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let vendor = GpuVendor::from_id(properties.vendor_id);

        log::info!(
            "Selected GPU: {} ({:?})",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
            vendor
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 6: Memory allocator
        let allocator = Self::create_allocator(&instance, physical_device, &device)?;

        // Step 7: Command pool and the timeline every submission signals
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let submission_timeline = unsafe { device.create_semaphore(&semaphore_info, None) }
            .context("Failed to create submission timeline")?;

        let surface_loader = khr::Surface::new(&entry, &instance);
        let swapchain_loader = khr::Swapchain::new(&instance, &device);

        let vulkan_device = Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            buffers: Mutex::new(HashMap::new()),
            deletion_queue: DeletionQueue::new(),
            command_pool: Mutex::new(command_pool),
            graphics_queue: Mutex::new(graphics_queue),
            graphics_queue_family,
            submission_timeline,
            last_submission: AtomicU64::new(0),
            surface_loader,
            swapchain_loader,
            debug_utils,
            properties,
            vendor,
            device,
            physical_device,
            instance,
            entry,
        };
        vulkan_device.set_object_name(submission_timeline, "submission_timeline");

        Ok(Arc::new(vulkan_device))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;
        let engine_name = CString::new("rhi-core")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions: Vec<*const c_char> = surface::required_extensions(display)?.to_vec();

        if enable_validation {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        // Needed for HDR10 color spaces, not every driver has it
        let colorspace = c"VK_EXT_swapchain_colorspace";
        let available = entry
            .enumerate_instance_extension_properties(None)
            .context("Failed to enumerate instance extensions")?;
        if available
            .iter()
            .any(|props| unsafe { CStr::from_ptr(props.extension_name.as_ptr()) } == colorspace)
        {
            extensions.push(colorspace.as_ptr());
        } else {
            log::warn!("VK_EXT_swapchain_colorspace is not available, HDR output won't work");
        }

        // Validation layers
        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(instance: &ash::Instance) -> Result<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            bail!("No Vulkan-capable GPU found");
        }

        // Score each device
        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };

            if props.api_version < vk::API_VERSION_1_2 || !Self::supports_timeline_semaphores(instance, device) {
                continue;
            }

            // Find graphics queue family
            let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .enumerate()
                .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|(i, _)| i as u32);

            if let Some(graphics_family) = graphics_family {
                // Score device (prefer discrete GPU)
                let score = match props.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                    _ => 1,
                };

                if score > best_score {
                    best_score = score;
                    best_device = Some((device, graphics_family));
                }
            }
        }

        best_device.ok_or_else(|| anyhow::anyhow!("No suitable GPU found"))
    }

    fn supports_timeline_semaphores(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder().push_next(&mut vulkan_12);
        unsafe { instance.get_physical_device_features2(device, &mut features) };

        vulkan_12.timeline_semaphore == vk::TRUE
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
    ) -> Result<(ash::Device, vk::Queue)> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let extensions = [khr::Swapchain::name().as_ptr()];

        let mut vulkan_12 = vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .push_next(&mut vulkan_12);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    fn create_allocator(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Allocator> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create memory allocator")?;

        Ok(allocator)
    }

    /// Attach a debug name to a Vulkan object, visible in validation messages and captures
    fn set_object_name<H: Handle>(&self, handle: H, name: &str) {
        let Some((debug_utils, _)) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };

        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);

        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &name_info) } {
            log::debug!("Failed to name {:?}: {:?}", H::TYPE, e);
        }
    }

    /// Create a buffer and bind freshly allocated memory to it
    fn allocate_buffer(&self, buffer: vk::Buffer, desc: &BufferDesc) -> Result<Allocation> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let mut allocation = self
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: desc.name,
                requirements,
                location: desc.location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for {}", desc.name))?;

        let result = (|| -> Result<()> {
            unsafe {
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            }
            .context("Failed to bind buffer memory")?;

            if let Some(data) = desc.data {
                let mapped = allocation
                    .mapped_slice_mut()
                    .with_context(|| format!("Initial data for {} needs host-visible memory", desc.name))?;
                mapped[..data.len()].copy_from_slice(data);
            }

            Ok(())
        })();

        match result {
            Ok(()) => Ok(allocation),
            Err(e) => {
                if let Err(free_error) = self.allocator.lock().free(allocation) {
                    log::error!("Failed to free allocation of {}: {:?}", desc.name, free_error);
                }
                Err(e)
            }
        }
    }
}

impl RhiDevice for VulkanDevice {
    fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    fn is_valid_resolution(&self, width: u32, height: u32) -> bool {
        let max = self.properties.limits.max_image_dimension2_d;
        width > 0 && height > 0 && width <= max && height <= max
    }

    fn queue_wait_all(&self) -> Result<()> {
        let queue = self.graphics_queue.lock();
        unsafe { self.device.queue_wait_idle(*queue) }.context("Failed to wait for the graphics queue")
    }

    fn create_semaphore(&self, is_timeline: bool, name: Option<&str>) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let mut create_info = vk::SemaphoreCreateInfo::builder();
        if is_timeline {
            create_info = create_info.push_next(&mut type_info);
        }

        let semaphore = unsafe { self.device.create_semaphore(&create_info, None) }
            .with_context(|| format!("Failed to create semaphore {:?}", name))?;
        if let Some(name) = name {
            self.set_object_name(semaphore, name);
        }

        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> Result<bool> {
        let semaphores = [semaphore];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e).context("Failed to wait for timeline semaphore"),
        }
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        let signal_info = vk::SemaphoreSignalInfo::builder()
            .semaphore(semaphore)
            .value(value);

        unsafe { self.device.signal_semaphore(&signal_info) }.context("Failed to signal timeline semaphore")
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        unsafe { self.device.get_semaphore_counter_value(semaphore) }.context("Failed to read timeline semaphore")
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer> {
        if let Some(data) = desc.data {
            assert!(data.len() as vk::DeviceSize <= desc.size, "Initial data is larger than the buffer");
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer {}", desc.name))?;

        let allocation = match self.allocate_buffer(buffer, desc) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mapped = allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>());
        self.buffers.lock().insert(buffer, allocation);
        self.set_object_name(buffer, desc.name);

        Ok(GpuBuffer {
            handle: buffer,
            size: desc.size,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };

        match self.buffers.lock().remove(&buffer) {
            Some(allocation) => {
                if let Err(e) = self.allocator.lock().free(allocation) {
                    log::error!("Failed to free memory of {:?}: {:?}", buffer, e);
                }
            }
            None => log::warn!("Destroyed {:?} which has no allocation", buffer),
        }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format, name: &str) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(COLOR_SUBRESOURCE_RANGE);

        let view = unsafe { self.device.create_image_view(&create_info, None) }
            .with_context(|| format!("Failed to create image view {}", name))?;
        self.set_object_name(view, name);

        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")?;

        command_buffers
            .into_iter()
            .next()
            .context("Driver returned no command buffer")
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe { self.device.free_command_buffers(*pool, &[cmd]) };
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        let _pool = self.command_pool.lock();
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }.context("Failed to begin command buffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let _pool = self.command_pool.lock();
        unsafe { self.device.end_command_buffer(cmd) }.context("Failed to end command buffer")
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, image: vk::Image, old: ImageLayout, new: ImageLayout) {
        let (src_access, src_stage) = old.access_and_stage();
        let (dst_access, dst_stage) = new.access_and_stage();

        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .old_layout(old.to_vk())
            .new_layout(new.to_vk())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_SUBRESOURCE_RANGE)
            .build();

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        };
    }

    fn cmd_clear_color(&self, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]) {
        let clear_color = vk::ClearColorValue { float32: color };
        unsafe {
            self.device.cmd_clear_color_image(
                cmd,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_color,
                &[COLOR_SUBRESOURCE_RANGE],
            )
        };
    }

    fn queue_submit(&self, cmd: vk::CommandBuffer, wait: &[vk::Semaphore], signal: &[vk::Semaphore]) -> Result<u64> {
        // Held across the increment so submission values reach the queue in order
        let queue = self.graphics_queue.lock();
        let submission = self.last_submission.load(Ordering::Acquire) + 1;

        let wait_values = vec![0; wait.len()];
        let wait_stages = vec![vk::PipelineStageFlags::ALL_COMMANDS; wait.len()];

        let mut signal_semaphores = signal.to_vec();
        signal_semaphores.push(self.submission_timeline);
        let mut signal_values = vec![0; signal.len()];
        signal_values.push(submission);

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(wait)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        unsafe { self.device.queue_submit(*queue, &[submit_info], vk::Fence::null()) }
            .context("Failed to submit to the graphics queue")?;
        self.last_submission.store(submission, Ordering::Release);

        Ok(submission)
    }

    fn completed_submission(&self) -> Result<u64> {
        self.semaphore_value(self.submission_timeline)
    }

    fn last_submission(&self) -> u64 {
        self.last_submission.load(Ordering::Acquire)
    }

    fn wait_for_submission(&self, submission: u64) -> Result<()> {
        if submission == 0 || self.completed_submission()? >= submission {
            return Ok(());
        }

        if !self.wait_semaphore(self.submission_timeline, submission, u64::MAX)? {
            bail!("Timed out waiting for submission {}", submission);
        }

        Ok(())
    }

    fn create_surface(&self, window: &WindowHandle) -> Result<vk::SurfaceKHR> {
        surface::create_surface(&self.entry, &self.instance, window)
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> Result<bool> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_support(self.physical_device, self.graphics_queue_family, surface)
        }
        .context("Failed to query surface support")
    }

    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }
        .context("Failed to query surface capabilities")
    }

    fn surface_formats(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)
        }
        .context("Failed to query surface formats")
    }

    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> Result<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)
        }
        .context("Failed to query surface present modes")
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format)
            .image_color_space(desc.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .with_context(|| format!("Failed to create swapchain {}", desc.name))?;
        self.set_object_name(swapchain, desc.name);

        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }.context("Failed to get swapchain images")
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore, timeout_ns: u64) -> Result<Acquired> {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    fn queue_present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentStatus> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.graphics_queue.lock();
        match unsafe { self.swapchain_loader.queue_present(*queue, &present_info) } {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }

    fn deletion_queue(&self) -> &DeletionQueue {
        &self.deletion_queue
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("Failed to wait for device idle: {:?}", e);
        }

        // Everything retired is safe to destroy now
        for resource in self.deletion_queue.drain_all() {
            self.destroy_resource(resource);
        }

        let leaked: Vec<vk::Buffer> = self.buffers.lock().keys().copied().collect();
        if !leaked.is_empty() {
            log::warn!("{} buffers were still alive at device destruction", leaked.len());
        }
        for buffer in leaked {
            self.destroy_buffer(buffer);
        }

        // Cleanup in reverse order, the allocator must go before the device
        unsafe {
            self.device.destroy_semaphore(self.submission_timeline, None);
            self.device.destroy_command_pool(*self.command_pool.get_mut(), None);
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
