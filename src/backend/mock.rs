// In-memory RhiDevice for unit tests
//
// Hands out fake handles, records every call, backs buffers with real host
// memory and lets tests script surface properties and acquire/present results.

use anyhow::{bail, Result};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::Arc;

use super::deletion::DeletionQueue;
use super::rhi::{
    Acquired, BufferDesc, GpuBuffer, MemoryLocation, PresentStatus, RhiDevice, SwapchainDesc, WindowHandle,
};
use super::types::{GpuVendor, ImageLayout};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    QueueWaitAll,
    CreateSemaphore { timeline: bool },
    DestroySemaphore(vk::Semaphore),
    CreateBuffer { size: u64, location: MemoryLocation, with_data: bool },
    DestroyBuffer(vk::Buffer),
    CreateImageView(vk::Image),
    DestroyImageView(vk::ImageView),
    DestroyImage(vk::Image),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, size: u64 },
    ImageBarrier { image: vk::Image, old: ImageLayout, new: ImageLayout },
    ClearColor(vk::Image),
    QueueSubmit { wait: Vec<vk::Semaphore>, signal: Vec<vk::Semaphore> },
    CreateSurface,
    DestroySurface(vk::SurfaceKHR),
    CreateSwapchain { width: u32, height: u32, format: vk::Format, present_mode: vk::PresentModeKHR },
    DestroySwapchain(vk::SwapchainKHR),
    Acquire { semaphore: vk::Semaphore },
    Present { image_index: u32, wait: Vec<vk::Semaphore> },
}

struct MockBuffer {
    // Boxed so the mapped pointer stays put while the map rehashes
    memory: Box<[u8]>,
}

struct State {
    next_handle: u64,
    calls: Vec<Call>,
    semaphores: HashMap<vk::Semaphore, u64>,
    buffers: HashMap<vk::Buffer, MockBuffer>,
    views: HashSet<vk::ImageView>,
    command_buffers: HashSet<vk::CommandBuffer>,
    surfaces: HashSet<vk::SurfaceKHR>,
    swapchains: HashMap<vk::SwapchainKHR, (Vec<vk::Image>, u32)>,
    last_submission: u64,
    completed_submission: u64,
    auto_complete: bool,
    fail_next_semaphore: bool,
    fail_next_submit: bool,

    vendor: GpuVendor,
    max_dimension: u32,
    min_extent: vk::Extent2D,
    max_extent: vk::Extent2D,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    acquire_script: VecDeque<Result<Acquired>>,
    present_script: VecDeque<PresentStatus>,
}

pub struct MockDevice {
    state: Mutex<State>,
    deletion_queue: DeletionQueue,
}

fn surface_format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
    vk::SurfaceFormatKHR { format, color_space }
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_handle: 1,
                calls: Vec::new(),
                semaphores: HashMap::new(),
                buffers: HashMap::new(),
                views: HashSet::new(),
                command_buffers: HashSet::new(),
                surfaces: HashSet::new(),
                swapchains: HashMap::new(),
                last_submission: 0,
                completed_submission: 0,
                auto_complete: true,
                fail_next_semaphore: false,
                fail_next_submit: false,
                vendor: GpuVendor::Amd,
                max_dimension: 16384,
                min_extent: vk::Extent2D { width: 1, height: 1 },
                max_extent: vk::Extent2D { width: 4096, height: 4096 },
                formats: vec![
                    surface_format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                    surface_format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                    surface_format(vk::Format::A2B10G10R10_UNORM_PACK32, vk::ColorSpaceKHR::HDR10_ST2084_EXT),
                ],
                present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
            }),
            deletion_queue: DeletionQueue::new(),
        })
    }

    // ---- scripting --------------------------------------------------------

    pub fn set_vendor(&self, vendor: GpuVendor) {
        self.state.lock().vendor = vendor;
    }

    pub fn set_extent_range(&self, min: (u32, u32), max: (u32, u32)) {
        let mut state = self.state.lock();
        state.min_extent = vk::Extent2D { width: min.0, height: min.1 };
        state.max_extent = vk::Extent2D { width: max.0, height: max.1 };
    }

    pub fn set_formats(&self, formats: Vec<(vk::Format, vk::ColorSpaceKHR)>) {
        self.state.lock().formats = formats
            .into_iter()
            .map(|(format, color_space)| surface_format(format, color_space))
            .collect();
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.state.lock().present_modes = modes;
    }

    /// Results returned by upcoming acquires before falling back to round-robin
    pub fn script_acquire(&self, result: Result<Acquired>) {
        self.state.lock().acquire_script.push_back(result);
    }

    pub fn script_present(&self, status: PresentStatus) {
        self.state.lock().present_script.push_back(status);
    }

    /// When false, submissions stay pending until `complete_submissions`
    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().auto_complete = auto_complete;
    }

    /// Make the next semaphore creation fail
    pub fn fail_next_create_semaphore(&self) {
        self.state.lock().fail_next_semaphore = true;
    }

    /// Make the next queue submission fail
    pub fn fail_next_submit(&self) {
        self.state.lock().fail_next_submit = true;
    }

    pub fn complete_submissions(&self, value: u64) {
        let mut state = self.state.lock();
        state.completed_submission = state.completed_submission.max(value);
    }

    // ---- inspection -------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| matches(call)).count()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_views(&self) -> usize {
        self.state.lock().views.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn live_surfaces(&self) -> usize {
        self.state.lock().surfaces.len()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.memory.to_vec())
    }

    pub fn window() -> WindowHandle {
        use raw_window_handle::{RawDisplayHandle, RawWindowHandle, WebDisplayHandle, WebWindowHandle};

        let mut window = WebWindowHandle::empty();
        window.id = 1;
        WindowHandle {
            display: RawDisplayHandle::Web(WebDisplayHandle::empty()),
            window: RawWindowHandle::Web(window),
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

impl State {
    fn handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }
}

impl RhiDevice for MockDevice {
    fn vendor(&self) -> GpuVendor {
        self.state.lock().vendor
    }

    fn is_valid_resolution(&self, width: u32, height: u32) -> bool {
        let max = self.state.lock().max_dimension;
        width > 0 && height > 0 && width <= max && height <= max
    }

    fn queue_wait_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.completed_submission = state.last_submission;
        state.calls.push(Call::QueueWaitAll);
        Ok(())
    }

    fn create_semaphore(&self, is_timeline: bool, _name: Option<&str>) -> Result<vk::Semaphore> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_semaphore) {
            bail!("out of device memory");
        }
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore, 0);
        state.calls.push(Call::CreateSemaphore { timeline: is_timeline });
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        assert!(state.semaphores.remove(&semaphore).is_some(), "double destroy of {:?}", semaphore);
        state.calls.push(Call::DestroySemaphore(semaphore));
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, _timeout_ns: u64) -> Result<bool> {
        Ok(self.state.lock().semaphores[&semaphore] >= value)
    }

    fn signal_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<()> {
        self.state.lock().semaphores.insert(semaphore, value);
        Ok(())
    }

    fn semaphore_value(&self, semaphore: vk::Semaphore) -> Result<u64> {
        Ok(self.state.lock().semaphores[&semaphore])
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<GpuBuffer> {
        let host_visible = desc.location == MemoryLocation::CpuToGpu;
        if desc.data.is_some() && !host_visible {
            bail!("initial data needs host-visible memory");
        }

        let mut memory = vec![0u8; desc.size as usize].into_boxed_slice();
        if let Some(data) = desc.data {
            memory[..data.len()].copy_from_slice(data);
        }
        let mapped = if host_visible { NonNull::new(memory.as_mut_ptr()) } else { None };

        let mut state = self.state.lock();
        let handle = vk::Buffer::from_raw(state.handle());
        state.buffers.insert(handle, MockBuffer { memory });
        state.calls.push(Call::CreateBuffer {
            size: desc.size,
            location: desc.location,
            with_data: desc.data.is_some(),
        });

        Ok(GpuBuffer {
            handle,
            size: desc.size,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        assert!(state.buffers.remove(&buffer).is_some(), "double destroy of {:?}", buffer);
        state.calls.push(Call::DestroyBuffer(buffer));
    }

    fn create_image_view(&self, image: vk::Image, _format: vk::Format, _name: &str) -> Result<vk::ImageView> {
        let mut state = self.state.lock();
        let view = vk::ImageView::from_raw(state.handle());
        state.views.insert(view);
        state.calls.push(Call::CreateImageView(image));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.lock();
        assert!(state.views.remove(&view), "double destroy of {:?}", view);
        state.calls.push(Call::DestroyImageView(view));
    }

    fn destroy_image(&self, image: vk::Image) {
        self.record(Call::DestroyImage(image));
    }

    fn allocate_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        let cmd = vk::CommandBuffer::from_raw(state.handle());
        state.command_buffers.insert(cmd);
        Ok(cmd)
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.state.lock().command_buffers.remove(&cmd);
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Call::BeginCommandBuffer(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Call::EndCommandBuffer(cmd));
        Ok(())
    }

    fn cmd_copy_buffer(&self, _cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let mut state = self.state.lock();
        let bytes = state.buffers[&src].memory[..size as usize].to_vec();
        state
            .buffers
            .get_mut(&dst)
            .expect("copy into unknown buffer")
            .memory[..size as usize]
            .copy_from_slice(&bytes);
        state.calls.push(Call::CopyBuffer { src, dst, size });
    }

    fn cmd_image_barrier(&self, _cmd: vk::CommandBuffer, image: vk::Image, old: ImageLayout, new: ImageLayout) {
        self.record(Call::ImageBarrier { image, old, new });
    }

    fn cmd_clear_color(&self, _cmd: vk::CommandBuffer, image: vk::Image, _color: [f32; 4]) {
        self.record(Call::ClearColor(image));
    }

    fn queue_submit(&self, _cmd: vk::CommandBuffer, wait: &[vk::Semaphore], signal: &[vk::Semaphore]) -> Result<u64> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_submit) {
            bail!("device lost");
        }
        state.last_submission += 1;
        if state.auto_complete {
            state.completed_submission = state.last_submission;
        }
        state.calls.push(Call::QueueSubmit {
            wait: wait.to_vec(),
            signal: signal.to_vec(),
        });
        Ok(state.last_submission)
    }

    fn completed_submission(&self) -> Result<u64> {
        Ok(self.state.lock().completed_submission)
    }

    fn last_submission(&self) -> u64 {
        self.state.lock().last_submission
    }

    fn wait_for_submission(&self, submission: u64) -> Result<()> {
        self.complete_submissions(submission);
        Ok(())
    }

    fn create_surface(&self, _window: &WindowHandle) -> Result<vk::SurfaceKHR> {
        let mut state = self.state.lock();
        let surface = vk::SurfaceKHR::from_raw(state.handle());
        state.surfaces.insert(surface);
        state.calls.push(Call::CreateSurface);
        Ok(surface)
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        let mut state = self.state.lock();
        assert!(state.surfaces.remove(&surface), "double destroy of {:?}", surface);
        state.calls.push(Call::DestroySurface(surface));
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> Result<bool> {
        Ok(true)
    }

    fn surface_capabilities(&self, _surface: vk::SurfaceKHR) -> Result<vk::SurfaceCapabilitiesKHR> {
        let state = self.state.lock();
        Ok(vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 8,
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: state.min_extent,
            max_image_extent: state.max_extent,
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        })
    }

    fn surface_formats(&self, _surface: vk::SurfaceKHR) -> Result<Vec<vk::SurfaceFormatKHR>> {
        Ok(self.state.lock().formats.clone())
    }

    fn surface_present_modes(&self, _surface: vk::SurfaceKHR) -> Result<Vec<vk::PresentModeKHR>> {
        Ok(self.state.lock().present_modes.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let swapchain = vk::SwapchainKHR::from_raw(state.handle());
        let images = (0..desc.min_image_count)
            .map(|_| vk::Image::from_raw(state.handle()))
            .collect();
        state.swapchains.insert(swapchain, (images, 0));
        state.calls.push(Call::CreateSwapchain {
            width: desc.extent.width,
            height: desc.extent.height,
            format: desc.format,
            present_mode: desc.present_mode,
        });
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        assert!(state.swapchains.remove(&swapchain).is_some(), "double destroy of {:?}", swapchain);
        state.calls.push(Call::DestroySwapchain(swapchain));
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        Ok(self.state.lock().swapchains[&swapchain].0.clone())
    }

    fn acquire_next_image(&self, swapchain: vk::SwapchainKHR, signal: vk::Semaphore, _timeout_ns: u64) -> Result<Acquired> {
        let mut state = self.state.lock();
        state.calls.push(Call::Acquire { semaphore: signal });

        if let Some(scripted) = state.acquire_script.pop_front() {
            return scripted;
        }

        let (images, cursor) = state.swapchains.get_mut(&swapchain).expect("acquire on unknown swapchain");
        let index = *cursor % images.len() as u32;
        *cursor += 1;
        Ok(Acquired::Image { index, suboptimal: false })
    }

    fn queue_present(&self, _swapchain: vk::SwapchainKHR, image_index: u32, wait: &[vk::Semaphore]) -> Result<PresentStatus> {
        let mut state = self.state.lock();
        state.calls.push(Call::Present {
            image_index,
            wait: wait.to_vec(),
        });
        Ok(state.present_script.pop_front().unwrap_or(PresentStatus::Optimal))
    }

    fn deletion_queue(&self) -> &DeletionQueue {
        &self.deletion_queue
    }
}
