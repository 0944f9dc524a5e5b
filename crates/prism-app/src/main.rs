// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use prism_core::{init_tracing, EXIT_FAILURE};
use prism_render::{FrameStatus, RenderSize, Renderer};
use prism_render_vk::VkRenderer;
use tracing::{debug, error, info};

use prism_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

mod config;

use config::{AppCfg, Cli};

/// How often a visible window whose surface has no extent is asked again.
const SURFACE_RETRY: Duration = Duration::from_millis(100);

/// Next wake-up while paused. Minimized windows sleep until a resize; anything
/// else keeps its pending retry, or gets a fresh one once that has passed.
fn paused_wakeup(size: RenderSize, next_retry: Option<Instant>, now: Instant) -> Option<Instant> {
    if size.is_empty() {
        return None;
    }
    match next_retry {
        Some(at) if at > now => Some(at),
        _ => Some(now + SURFACE_RETRY),
    }
}

struct App {
    cfg: AppCfg,
    // The surface borrows the window, so the renderer goes first.
    renderer: Option<VkRenderer>,
    window: Option<Window>,
    failure: Option<anyhow::Error>,
    paused: bool,
    next_retry: Option<Instant>,
    frames: u32,
    last_fps_instant: Instant,
}

impl App {
    fn new(cfg: AppCfg) -> Self {
        Self {
            cfg,
            renderer: None,
            window: None,
            failure: None,
            paused: false,
            next_retry: None,
            frames: 0,
            last_fps_instant: Instant::now(),
        }
    }

    fn current_size(&self) -> RenderSize {
        self.window.as_ref().map_or(RenderSize::new(0, 0), |w| {
            let (width, height) = prism_platform::drawable_size(w);
            RenderSize::new(width, height)
        })
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = prism_platform::create_window(event_loop, &self.cfg.window_desc())?;
        let (width, height) = prism_platform::drawable_size(&window);
        let renderer = VkRenderer::new(
            &window,
            &window,
            RenderSize::new(width, height),
            self.cfg.vk_options(),
        )?;
        window.set_visible(true);
        self.window = Some(window);
        self.renderer = Some(renderer);
        Ok(())
    }

    /// Stops the loop; `main` reports the error and picks the exit code.
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        self.renderer = None;
        self.window = None;
        if self.failure.is_none() {
            self.failure = Some(e);
        }
        event_loop.exit();
    }

    fn draw(&mut self) -> Result<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };
        let status = renderer.render()?;
        self.paused = status == FrameStatus::Paused;
        if status.presented() {
            self.frames = self.frames.saturating_add(1);
        } else if status == FrameStatus::OutOfDate {
            let size = self.current_size();
            debug!("out of date; rebuilding at {}x{}", size.width, size.height);
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.resize(size)?;
            }
        }
        Ok(())
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            self.fail(event_loop, e);
            return;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.renderer = None;
                self.window = None;
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                let size = RenderSize::new(new_size.width, new_size.height);
                debug!("Resized → {}x{}", size.width, size.height);
                self.paused = size.is_empty();
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(e) = renderer.resize(size) {
                        self.fail(event_loop, e);
                        return;
                    }
                }
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.draw() {
                    self.fail(event_loop, e);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            return;
        }

        if self.paused {
            let next = paused_wakeup(self.current_size(), self.next_retry, Instant::now());
            if next.is_some() && next != self.next_retry {
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }
            self.next_retry = next;
            event_loop.set_control_flow(next.map_or(ControlFlow::Wait, ControlFlow::WaitUntil));
            self.frames = 0;
            return;
        }

        self.next_retry = None;
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = AppCfg::resolve(&cli).context("configuration")?;
    let event_loop = EventLoop::new().context("event loop")?;

    let mut app = App::new(cfg);
    event_loop.run_app(&mut app).context("event loop")?;

    match app.failure.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimized_window_sleeps_until_resize() {
        let now = Instant::now();
        assert_eq!(paused_wakeup(RenderSize::new(0, 0), None, now), None);
        assert_eq!(paused_wakeup(RenderSize::new(800, 0), Some(now), now), None);
    }

    #[test]
    fn visible_window_with_no_surface_extent_keeps_retrying() {
        let now = Instant::now();
        let size = RenderSize::new(800, 600);

        let first = paused_wakeup(size, None, now);
        assert_eq!(first, Some(now + SURFACE_RETRY));

        let early = now + SURFACE_RETRY / 2;
        assert_eq!(paused_wakeup(size, first, early), first);

        let late = now + SURFACE_RETRY;
        assert_eq!(paused_wakeup(size, first, late), Some(late + SURFACE_RETRY));
    }
}
