// SPDX-License-Identifier: CEPL-1.0
//! Surface capabilities and the format / present-mode policy.

use ash::khr::surface;
use ash::vk;
use tracing::{debug, warn};

use crate::error::{PresentError, PresentResult, VkResultExt};

/// 8-bit UNORM formats accepted for the color attachment. The surface's own
/// ordering decides among them.
pub const PREFERRED_FORMATS: [vk::Format; 3] = [
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::A8B8G8R8_UNORM_PACK32,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresentModePolicy {
    pub mode: vk::PresentModeKHR,
    /// When false, a missing `mode` falls back to FIFO.
    pub strict: bool,
}

impl Default for PresentModePolicy {
    fn default() -> Self {
        Self {
            mode: vk::PresentModeKHR::MAILBOX,
            strict: true,
        }
    }
}

/// What the surface currently supports for the selected device.
#[derive(Clone, Debug)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub unsafe fn query(
        loader: &surface::Instance,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> PresentResult<Self> {
        let capabilities = unsafe { loader.get_physical_device_surface_capabilities(phys, surface) }
            .call("get_physical_device_surface_capabilities")?;
        let formats = unsafe { loader.get_physical_device_surface_formats(phys, surface) }
            .call("get_physical_device_surface_formats")?;
        let present_modes =
            unsafe { loader.get_physical_device_surface_present_modes(phys, surface) }
                .call("get_physical_device_surface_present_modes")?;
        Self::new(capabilities, formats, present_modes)
    }

    /// Rejects empty format or present-mode sets.
    pub fn new(
        capabilities: vk::SurfaceCapabilitiesKHR,
        formats: Vec<vk::SurfaceFormatKHR>,
        present_modes: Vec<vk::PresentModeKHR>,
    ) -> PresentResult<Self> {
        if formats.is_empty() {
            return Err(PresentError::NoSurfaceFormats);
        }
        if present_modes.is_empty() {
            return Err(PresentError::NoPresentModes);
        }
        debug!(
            "surface: {} formats, modes {:?}, images {}..{}",
            formats.len(),
            present_modes,
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unbounded".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );
        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }
}

/// First reported format in [`PREFERRED_FORMATS`]; otherwise the first
/// reported format. Never fails on a non-empty list.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| PREFERRED_FORMATS.contains(&f.format))
        .unwrap_or_else(|| formats[0])
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    policy: PresentModePolicy,
) -> PresentResult<vk::PresentModeKHR> {
    if modes.contains(&policy.mode) {
        return Ok(policy.mode);
    }
    if policy.strict {
        return Err(PresentError::RequiredPresentModeUnavailable(policy.mode));
    }
    warn!("{:?} unavailable, falling back to FIFO", policy.mode);
    Ok(vk::PresentModeKHR::FIFO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn picks_first_reported_preferred_format() {
        let formats = [
            fmt(vk::Format::B8G8R8A8_SRGB),
            fmt(vk::Format::R8G8B8A8_UNORM),
            fmt(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn falls_back_to_first_reported_format() {
        let formats = [
            fmt(vk::Format::A2B10G10R10_UNORM_PACK32),
            fmt(vk::Format::R16G16B16A16_SFLOAT),
        ];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
    }

    #[test]
    fn strict_policy_requires_the_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let err = choose_present_mode(&modes, PresentModePolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            PresentError::RequiredPresentModeUnavailable(vk::PresentModeKHR::MAILBOX)
        ));
    }

    #[test]
    fn relaxed_policy_falls_back_to_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        let policy = PresentModePolicy {
            strict: false,
            ..Default::default()
        };
        assert_eq!(
            choose_present_mode(&modes, policy).unwrap(),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn requested_mode_wins_when_present() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, PresentModePolicy::default()).unwrap(),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn empty_sets_are_distinct_errors() {
        let caps = vk::SurfaceCapabilitiesKHR::default();
        let no_formats = SurfaceSupport::new(caps, vec![], vec![vk::PresentModeKHR::FIFO]);
        assert!(matches!(no_formats, Err(PresentError::NoSurfaceFormats)));
        let no_modes = SurfaceSupport::new(caps, vec![fmt(vk::Format::B8G8R8A8_UNORM)], vec![]);
        assert!(matches!(no_modes, Err(PresentError::NoPresentModes)));
    }
}
