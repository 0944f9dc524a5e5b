// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero dimension; nothing can be presented.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Outcome of one pass through the frame loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// Image presented and the chain matches the surface.
    Presented,
    /// Image presented, but the chain no longer matches the surface exactly.
    Suboptimal,
    /// The chain is stale. The caller must hand the current window size to
    /// [`Renderer::resize`] before the next frame.
    OutOfDate,
    /// Nothing was drawn (zero-sized surface).
    Paused,
}

impl FrameStatus {
    pub fn presented(self) -> bool {
        matches!(self, FrameStatus::Presented | FrameStatus::Suboptimal)
    }
}

pub trait Renderer {
    type Options;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: Self::Options,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn render(&mut self) -> Result<FrameStatus>;
}
