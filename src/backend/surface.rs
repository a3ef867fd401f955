// Platform surfaces
//
// Thin layer over ash-window: which instance extensions a display needs, and
// VkSurfaceKHR creation from the raw handles of a window.

use anyhow::{Context, Result};
use ash::{vk, Entry, Instance};
use raw_window_handle::RawDisplayHandle;
use std::os::raw::c_char;

use super::rhi::WindowHandle;

/// Instance extensions needed to create surfaces for this display
pub fn required_extensions(display: RawDisplayHandle) -> Result<&'static [*const c_char]> {
    ash_window::enumerate_required_extensions(display)
        .with_context(|| format!("Vulkan can't present to this display: {:?}", display))
}

pub fn create_surface(entry: &Entry, instance: &Instance, window: &WindowHandle) -> Result<vk::SurfaceKHR> {
    // SAFETY: the window outlives every swapchain created on it (see `WindowHandle`)
    unsafe { ash_window::create_surface(entry, instance, window.display, window.window, None) }
        .context("Failed to create surface")
}
