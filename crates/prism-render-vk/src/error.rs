// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

use crate::device::{DevicePreference, QueueRole};
use crate::frame::SlotError;

/// Every way the presentation pipeline can fail. Stale-swapchain results are
/// not here: they come back as `FrameStatus` values.
#[derive(Error, Debug)]
pub enum PresentError {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("no Vulkan device found")]
    NoDeviceFound,

    #[error("no device matches the {preference:?} preference")]
    NoSuitableDeviceFound { preference: DevicePreference },

    #[error("selected device reports Vulkan {major}.{minor}; 1.3 is required")]
    UnsupportedApiVersion { major: u32, minor: u32 },

    #[error("no queue family supports {0:?}")]
    MissingRequiredQueueFamily(QueueRole),

    #[error("surface reports no formats")]
    NoSurfaceFormats,

    #[error("surface reports no present modes")]
    NoPresentModes,

    #[error("required present mode {0:?} is not supported by the surface")]
    RequiredPresentModeUnavailable(vk::PresentModeKHR),

    #[error("{what} did not complete within the configured timeout")]
    Timeout { what: &'static str },

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("no memory type satisfies {0:?}")]
    NoCompatibleMemoryType(vk::MemoryPropertyFlags),

    #[error("embedded SPIR-V is malformed: {0}")]
    Spirv(#[source] std::io::Error),

    #[error(transparent)]
    Slot(#[from] SlotError),
}

pub type PresentResult<T> = Result<T, PresentError>;

/// Names the failing driver call when lifting a raw `vk::Result`.
pub(crate) trait VkResultExt<T> {
    fn call(self, call: &'static str) -> PresentResult<T>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn call(self, call: &'static str) -> PresentResult<T> {
        self.map_err(|result| PresentError::Vulkan { call, result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_errors_name_the_call() {
        let r: Result<(), vk::Result> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = r.call("queue_submit").unwrap_err();
        assert!(matches!(
            err,
            PresentError::Vulkan {
                call: "queue_submit",
                result: vk::Result::ERROR_DEVICE_LOST
            }
        ));
        assert!(err.to_string().starts_with("queue_submit failed"));
    }

    #[test]
    fn present_mode_and_format_failures_are_distinguishable() {
        let mode = PresentError::RequiredPresentModeUnavailable(vk::PresentModeKHR::MAILBOX);
        let formats = PresentError::NoSurfaceFormats;
        assert_ne!(mode.to_string(), formats.to_string());
        assert!(mode.to_string().contains("MAILBOX"));
    }
}
