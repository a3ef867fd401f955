// =============================================================================
// RHI-CORE DEMO
// =============================================================================
//
// Drives the backend end to end: a swapchain presenting to a winit window,
// a command pool rendering to it, a staged vertex buffer and a mapped
// per-frame buffer.
//
// FRAME FLOW:
// 1. Release retired GPU objects the timeline has passed
// 2. Begin the next command list of the frame pool
// 3. Clear the acquired image (ColorAttachment -> TransferDst -> PresentSrc)
// 4. Submit after the acquire semaphore, signalling the list's processed semaphore
// 5. Present (waits on processed), which acquires the next image
//
// KEYS: F11 fullscreen, H toggle HDR, Escape quit
//
// =============================================================================

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};
use rhi_core::backend::{
    Buffer, BufferKind, CommandPool, DeviceRef, Format, ImageLayout, RhiDevice, SwapChain, VertexBuffer,
    VulkanDevice, WindowHandle,
};
use rhi_core::config::Config;
use rhi_core::display::Display;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: Vec2,
    color: Vec3,
}

/// Per-frame values, rewritten through the persistent mapping every frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct FrameData {
    clear_color: Vec4,
    resolution: Vec2,
    time: f32,
    _padding: f32,
}

const TRIANGLE: [Vertex; 3] = [
    Vertex { position: Vec2::new(0.0, -0.5), color: Vec3::new(1.0, 0.0, 0.0) },
    Vertex { position: Vec2::new(0.5, 0.5), color: Vec3::new(0.0, 1.0, 0.0) },
    Vertex { position: Vec2::new(-0.5, 0.5), color: Vec3::new(0.0, 0.0, 1.0) },
];

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting rhi-core demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== rhi-core log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    display: Display,

    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    // GPU objects, released in `Drop` before the device
    device: Option<Arc<VulkanDevice>>,
    swapchain: Option<SwapChain>,
    command_pools: Vec<CommandPool>,
    vertex_buffer: Option<VertexBuffer>,
    frame_data: Option<Buffer>,

    // FPS tracking
    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;

        let mut display = Display::new();
        display.set_hdr_capabilities(
            config.display.hdr,
            config.display.luminance_min,
            config.display.luminance_max,
        );

        let now = Instant::now();
        Self {
            config,
            display,
            window: None,
            is_fullscreen,
            device: None,
            swapchain: None,
            command_pools: Vec::new(),
            vertex_buffer: None,
            frame_data: None,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let handle = WindowHandle::from_window(window);

        // Validation based on config (and debug build)
        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, handle.display)?;
        let device_ref: DeviceRef = device.clone();

        if let Some(monitor) = window.current_monitor() {
            let display_index = window
                .available_monitors()
                .position(|m| m == monitor)
                .unwrap_or(0);
            self.display
                .detect_display_modes(&monitor, u8::try_from(display_index).unwrap_or(u8::MAX));
        }

        let graphics = &self.config.graphics;
        let mut format = graphics.format();
        if format.is_hdr() && !self.display.hdr() {
            log::warn!("HDR requested but the display doesn't support it, using SDR");
            format = Format::for_hdr(false);
        }

        let size = window.inner_size();
        let swapchain = SwapChain::new(
            device_ref.clone(),
            handle,
            size.width,
            size.height,
            format,
            graphics.buffer_count(),
            graphics.present_mode(),
            "swapchain_main",
        )?;

        let command_pool = CommandPool::new(
            device_ref.clone(),
            "frame",
            swapchain.id(),
            graphics.frames_in_flight(),
        )?;

        let mut vertex_buffer = VertexBuffer::new(device_ref.clone(), "triangle");
        vertex_buffer.create_static(&TRIANGLE)?;

        let mut frame_data = Buffer::new(device_ref, BufferKind::Constant, "frame_data");
        frame_data.create_for::<FrameData>(1)?;

        log::info!(
            "Uploaded {} vertices ({} bytes), frame data mapped: {}",
            vertex_buffer.vertex_count(),
            vertex_buffer.size(),
            frame_data.is_mappable()
        );

        self.device = Some(device);
        self.swapchain = Some(swapchain);
        self.command_pools = vec![command_pool];
        self.vertex_buffer = Some(vertex_buffer);
        self.frame_data = Some(frame_data);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render a single frame. Returns false when nothing was presented.
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(device), Some(swapchain)) = (self.device.as_ref(), self.swapchain.as_mut()) else {
            return Ok(false);
        };

        // Minimized
        if !swapchain.present_enabled() {
            return Ok(false);
        }

        device.process_deletion_queue()?;

        let time = self.start_time.elapsed().as_secs_f32();
        let base = Vec4::from_array(self.config.graphics.clear_color);
        let pulse = 0.8 + 0.2 * (time * 2.0).sin();
        let clear_color = (base.truncate() * pulse).extend(base.w);

        if let Some(frame_data) = self.frame_data.as_mut() {
            frame_data.write(&[FrameData {
                clear_color,
                resolution: Vec2::new(swapchain.width() as f32, swapchain.height() as f32),
                time,
                _padding: 0.0,
            }]);
        }

        // Last frame's acquire or recreation failed, try again before recording
        if !swapchain.has_acquired_image() {
            swapchain.acquire_next_image()?;
        }
        let image = swapchain.image().context("No swapchain image acquired")?;

        let pool = self.command_pools.first_mut().context("No command pool")?;
        let cmd = pool.begin()?;

        swapchain.set_layout(ImageLayout::TransferDst, cmd);
        device.cmd_clear_color(cmd, image, clear_color.to_array());
        swapchain.set_layout(ImageLayout::PresentSrc, cmd);

        // The clear must not start before the image is actually available
        pool.submit_after(swapchain.acquire_semaphore_mut())?;
        swapchain.present(&mut self.command_pools)?;

        Ok(true)
    }

    // =========================================================================
    // FULLSCREEN / HDR TOGGLES
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The swapchain follows through the Resized event
        }
    }

    fn toggle_hdr(&mut self) {
        let Some(swapchain) = self.swapchain.as_mut() else {
            return;
        };

        let enable = !swapchain.is_hdr();
        if enable && !self.display.hdr() {
            log::warn!("This display doesn't support HDR (set [display] hdr = true if it does)");
            return;
        }

        if let Err(e) = swapchain.set_hdr(enable, &self.display) {
            log::error!("Failed to toggle HDR: {:?}", e);
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let (Some(window), Some(swapchain)) = (&self.window, &self.swapchain) {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}, {}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode,
                    if swapchain.is_hdr() { "HDR" } else { "SDR" }
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if let Some(swapchain) = self.swapchain.as_mut() {
                    if let Err(e) = swapchain.resize(size.width, size.height, false) {
                        log::error!("Failed to resize swapchain: {:?}", e);
                    }
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => log::error!("Render error: {:?}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::KeyH => self.toggle_hdr(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Some(device) = self.device.take() {
            if let Err(e) = device.queue_wait_all() {
                log::error!("Failed to wait for idle: {:?}", e);
            }

            // Everything below holds the device and must go before the window
            self.frame_data = None;
            self.vertex_buffer = None;
            self.command_pools.clear();
            self.swapchain = None;

            if let Err(e) = device.process_deletion_queue() {
                log::error!("Failed to flush deletion queue: {:?}", e);
            }
        }

        log::info!("Cleanup complete");
    }
}
