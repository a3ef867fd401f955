// Display - monitor modes and HDR capability
//
// Owned by the application and handed by reference to whoever needs it
// (the swapchain checks it before enabling HDR).

use winit::monitor::MonitorHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub hz: f32,
    pub display_index: u8,
}

#[derive(Debug, Default)]
pub struct Display {
    /// Sorted by width, widest first
    modes: Vec<DisplayMode>,
    hdr: bool,
    luminance_min: f32,
    luminance_max: f32,
    /// 0 means unlimited
    fps_limit: f32,
}

impl Display {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_display_mode(&mut self, width: u32, height: u32, hz: f32, display_index: u8) {
        assert!(width != 0, "width can't be zero");
        assert!(height != 0, "height can't be zero");
        assert!(hz != 0.0, "hz can't be zero");

        let mode = DisplayMode {
            width,
            height,
            hz,
            display_index,
        };
        if self.modes.contains(&mode) {
            return;
        }

        self.modes.push(mode);
        self.modes.sort_by(|a, b| b.width.cmp(&a.width));

        // Widest mode is the one we run at
        if self.modes[0].hz > self.fps_limit {
            self.fps_limit = self.modes[0].hz;
        }
    }

    /// Replace the registered modes with the video modes of `monitor`
    pub fn detect_display_modes(&mut self, monitor: &MonitorHandle, display_index: u8) {
        self.modes.clear();

        for video_mode in monitor.video_modes() {
            let size = video_mode.size();
            let hz = video_mode.refresh_rate_millihertz() as f32 / 1000.0;

            if size.width == 0 || size.height == 0 || hz == 0.0 {
                log::debug!("Skipping degenerate display mode {:?}", video_mode);
                continue;
            }
            self.register_display_mode(size.width, size.height, hz, display_index);
        }

        log::info!(
            "Display {} ({}): {} modes, fps limit {:.0}",
            display_index,
            monitor.name().unwrap_or_else(|| "unknown".to_string()),
            self.modes.len(),
            self.fps_limit
        );
        // Portable HDR detection doesn't exist, capabilities come from config
        log::info!(
            "HDR: {}, Luminance: {}, {} (from configuration)",
            self.hdr,
            self.luminance_min,
            self.luminance_max
        );
    }

    pub fn set_hdr_capabilities(&mut self, hdr: bool, luminance_min: f32, luminance_max: f32) {
        self.hdr = hdr;
        self.luminance_min = luminance_min;
        self.luminance_max = luminance_max;
    }

    pub fn display_modes(&self) -> &[DisplayMode] {
        &self.modes
    }

    pub fn hdr(&self) -> bool {
        self.hdr
    }

    pub fn luminance_min(&self) -> f32 {
        self.luminance_min
    }

    pub fn luminance_max(&self) -> f32 {
        self.luminance_max
    }

    pub fn fps_limit(&self) -> f32 {
        self.fps_limit
    }
}
