// Backend value types shared by the swapchain, buffers and the device service
//
// Thin enums over the Vulkan values we actually use, so the rest of the
// backend speaks in a small closed vocabulary instead of raw vk constants.

use ash::vk;

/// Pixel formats a swapchain can be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    R10G10B10A2Unorm,
}

impl Format {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Format::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            Format::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
            Format::R10G10B10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        }
    }

    /// Same bits, swapped red/blue channel order
    pub fn channel_swapped(self) -> Option<Format> {
        match self {
            Format::R8G8B8A8Unorm => Some(Format::B8G8R8A8Unorm),
            Format::B8G8R8A8Unorm => Some(Format::R8G8B8A8Unorm),
            Format::R10G10B10A2Unorm => None,
        }
    }

    pub fn is_hdr(self) -> bool {
        self == Format::R10G10B10A2Unorm
    }

    /// Format used for the backbuffer in SDR or HDR mode
    pub fn for_hdr(enabled: bool) -> Format {
        if enabled {
            Format::R10G10B10A2Unorm
        } else {
            Format::R8G8B8A8Unorm
        }
    }

    /// Parse the names used in config.toml
    pub fn from_name(name: &str) -> Option<Format> {
        match name.to_lowercase().as_str() {
            "r8g8b8a8_unorm" | "rgba8" => Some(Format::R8G8B8A8Unorm),
            "b8g8r8a8_unorm" | "bgra8" => Some(Format::B8G8R8A8Unorm),
            "r10g10b10a2_unorm" | "rgb10a2" => Some(Format::R10G10B10A2Unorm),
            _ => None,
        }
    }
}

/// HDR10 (PQ) for HDR output, sRGB non-linear otherwise
pub fn color_space(hdr: bool) -> vk::ColorSpaceKHR {
    if hdr {
        vk::ColorSpaceKHR::HDR10_ST2084_EXT
    } else {
        vk::ColorSpaceKHR::SRGB_NONLINEAR
    }
}

/// Image layouts tracked per backbuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    TransferSrc,
    TransferDst,
    ShaderRead,
    PresentSrc,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::General => vk::ImageLayout::GENERAL,
            ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Access mask and pipeline stage an image in this layout is used with
    pub fn access_and_stage(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            ImageLayout::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
            ImageLayout::General => (
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::ALL_COMMANDS,
            ),
            ImageLayout::ColorAttachment => (
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ),
            ImageLayout::TransferSrc => (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER),
            ImageLayout::TransferDst => (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER),
            ImageLayout::ShaderRead => (
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
            ),
            ImageLayout::PresentSrc => (vk::AccessFlags::empty(), vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        }
    }
}

/// Requested present mode. The swapchain falls back down this list
/// (Immediate -> Mailbox -> FifoRelaxed -> Fifo) until the surface supports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    FifoRelaxed,
    Fifo,
}

impl PresentMode {
    const PREFERENCE: [PresentMode; 4] = [
        PresentMode::Immediate,
        PresentMode::Mailbox,
        PresentMode::FifoRelaxed,
        PresentMode::Fifo,
    ];

    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
            PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        }
    }

    pub fn from_name(name: &str) -> Option<PresentMode> {
        match name.to_lowercase().as_str() {
            "immediate" => Some(PresentMode::Immediate),
            "mailbox" => Some(PresentMode::Mailbox),
            "fifo_relaxed" => Some(PresentMode::FifoRelaxed),
            "fifo" => Some(PresentMode::Fifo),
            _ => None,
        }
    }

    /// Pick the first supported mode at or after `self` in the preference chain.
    /// FIFO is always supported, so it is the final fallback.
    pub fn resolve(self, supported: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
        let start = Self::PREFERENCE
            .iter()
            .position(|&mode| mode == self)
            .unwrap_or(Self::PREFERENCE.len() - 1);

        Self::PREFERENCE[start..]
            .iter()
            .map(|mode| mode.to_vk())
            .find(|mode| supported.contains(mode))
            .unwrap_or(vk::PresentModeKHR::FIFO)
    }
}

/// GPU vendor, from the PCI vendor id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other(u32),
}

impl GpuVendor {
    pub fn from_id(vendor_id: u32) -> Self {
        match vendor_id {
            0x10DE => GpuVendor::Nvidia,
            0x1002 => GpuVendor::Amd,
            0x8086 => GpuVendor::Intel,
            id => GpuVendor::Other(id),
        }
    }
}
