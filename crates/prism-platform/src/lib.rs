// SPDX-License-Identifier: CEPL-1.0
//! Window collaborator. The rest of the workspace reaches winit through here.

pub use winit;

use anyhow::{Context, Result};
use tracing::info;
use winit::dpi::PhysicalSize;
use winit::event_loop::ActiveEventLoop;
use winit::window::Window;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowDesc {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowDesc {
    fn default() -> Self {
        Self {
            title: "prism".to_owned(),
            width: 1920,
            height: 1080,
            resizable: true,
        }
    }
}

impl WindowDesc {
    /// Windows start hidden; the app shows them once a renderer exists, so a
    /// failed initialization never flashes an empty window.
    pub fn attributes(&self) -> winit::window::WindowAttributes {
        Window::default_attributes()
            .with_title(self.title.clone())
            .with_inner_size(PhysicalSize::new(self.width.max(1), self.height.max(1)))
            .with_resizable(self.resizable)
            .with_visible(false)
    }
}

pub fn create_window(event_loop: &ActiveEventLoop, desc: &WindowDesc) -> Result<Window> {
    let window = event_loop
        .create_window(desc.attributes())
        .context("create_window")?;
    let (w, h) = drawable_size(&window);
    info!("window \"{}\" created ({}x{})", desc.title, w, h);
    Ok(window)
}

/// Current drawable size in physical pixels.
pub fn drawable_size(window: &Window) -> (u32, u32) {
    let size = window.inner_size();
    (size.width, size.height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_desc_matches_startup_size() {
        let d = WindowDesc::default();
        assert_eq!((d.width, d.height), (1920, 1080));
        assert!(d.resizable);
    }
}
