// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Provides sensible defaults if the config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::backend::{Format, PresentMode, MAX_BUFFER_COUNT};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub display: DisplayConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "rhi-core".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub buffer_count: u32,
    pub format: String,
    pub hdr: bool,
    pub clear_color: [f32; 4],
    /// Command lists per frame command pool
    pub frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "immediate".to_string(),
            buffer_count: 2,
            format: "r8g8b8a8_unorm".to_string(),
            hdr: false,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            frames_in_flight: 2,
        }
    }
}

/// What the display can do. There is no portable way to ask the OS for HDR
/// support, so it is declared here.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub hdr: bool,
    pub luminance_min: f32,
    pub luminance_max: f32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            hdr: false,
            luminance_min: 0.0,
            luminance_max: 0.0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: true,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

impl GraphicsConfig {
    pub fn present_mode(&self) -> PresentMode {
        PresentMode::from_name(&self.present_mode).unwrap_or_else(|| {
            log::warn!("Unknown present mode '{}', defaulting to immediate", self.present_mode);
            PresentMode::Immediate
        })
    }

    pub fn format(&self) -> Format {
        let format = Format::from_name(&self.format).unwrap_or_else(|| {
            log::warn!("Unknown format '{}', defaulting to r8g8b8a8_unorm", self.format);
            Format::R8G8B8A8Unorm
        });

        // The hdr switch wins over an explicit SDR format
        if self.hdr {
            Format::for_hdr(true)
        } else {
            format
        }
    }

    pub fn buffer_count(&self) -> u32 {
        let clamped = self.buffer_count.clamp(1, MAX_BUFFER_COUNT as u32);
        if clamped != self.buffer_count {
            log::warn!("buffer_count {} is out of range, using {}", self.buffer_count, clamped);
        }
        clamped
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight.max(1)
    }
}
