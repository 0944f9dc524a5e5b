// SPDX-License-Identifier: CEPL-1.0
//! Pluggable draw step recorded inside the rendering pass.

use ash::vk;

use crate::device::Device;
use crate::error::PresentResult;
use crate::instance::InstanceContext;

/// Everything a scene may touch while the rendering pass is open. Viewport and
/// scissor are already set to `extent`.
pub struct RecordContext<'a> {
    pub device: &'a ash::Device,
    pub cmd: vk::CommandBuffer,
    pub extent: vk::Extent2D,
}

pub trait SceneRenderer {
    fn name(&self) -> &'static str;

    fn record(&mut self, ctx: &RecordContext<'_>) -> PresentResult<()>;

    /// Called after a swapchain rebuild. Device is idle.
    fn color_format_changed(&mut self, _format: vk::Format) -> PresentResult<()> {
        Ok(())
    }
}

/// The clear in the rendering pass is the whole frame.
#[derive(Debug, Default)]
pub struct ClearOnly;

impl SceneRenderer for ClearOnly {
    fn name(&self) -> &'static str {
        "clear"
    }

    fn record(&mut self, _ctx: &RecordContext<'_>) -> PresentResult<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SceneKind {
    #[default]
    Clear,
    Triangle,
}

pub(crate) unsafe fn build_scene(
    kind: SceneKind,
    _ctx: &InstanceContext,
    _device: &Device,
    _format: vk::Format,
) -> PresentResult<Box<dyn SceneRenderer>> {
    match kind {
        SceneKind::Clear => Ok(Box::new(ClearOnly)),
        #[cfg(feature = "triangle")]
        SceneKind::Triangle => Ok(Box::new(unsafe {
            crate::triangle::TriangleScene::new(_ctx, _device, _format)
        }?)),
        #[cfg(not(feature = "triangle"))]
        SceneKind::Triangle => {
            tracing::warn!("built without the `triangle` feature; drawing the clear scene");
            Ok(Box::new(ClearOnly))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_scene_ignores_format_changes() {
        let mut scene = ClearOnly;
        assert!(scene.color_format_changed(vk::Format::R8G8B8A8_UNORM).is_ok());
        assert_eq!(scene.name(), "clear");
    }

    #[test]
    fn default_scene_is_clear() {
        assert_eq!(SceneKind::default(), SceneKind::Clear);
    }
}
