// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan 1.3 presentation pipeline: device selection, surface binding, the
//! swapchain, per-frame synchronization and the acquire/record/submit/present
//! cycle.

use anyhow::{Context, Result};
use ash::khr;
pub use ash::vk;
use prism_render::{FrameStatus, RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};

pub mod device;
pub mod error;
mod executor;
pub mod frame;
mod instance;
pub mod scene;
pub mod surface;
pub mod swapchain;
#[cfg(feature = "triangle")]
mod triangle;

pub use device::{DevicePreference, QueueRole};
pub use error::{PresentError, PresentResult};
pub use frame::FRAMES_IN_FLIGHT;
pub use scene::SceneKind;
pub use surface::PresentModePolicy;

use device::Device;
use error::VkResultExt;
use frame::FrameSync;
use instance::InstanceContext;
use scene::{build_scene, SceneRenderer};
use surface::SurfaceSupport;
use swapchain::{Swapchain, SwapchainPlan};

/// Everything the backend needs to know, already resolved from file and CLI.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VkOptions {
    pub device: DevicePreference,
    pub require_compute: bool,
    pub present: PresentModePolicy,
    pub clear_color: [f32; 4],
    /// Bounds both the slot fence wait and the image acquire. `None` waits
    /// forever.
    pub frame_timeout_ms: Option<u64>,
    pub scene: SceneKind,
}

impl Default for VkOptions {
    fn default() -> Self {
        Self {
            device: DevicePreference::default(),
            require_compute: true,
            present: PresentModePolicy::default(),
            clear_color: [0.125, 0.125, 0.125, 1.0],
            frame_timeout_ms: None,
            scene: SceneKind::default(),
        }
    }
}

fn needs_rebuild(stale: bool, has_chain: bool) -> bool {
    stale || !has_chain
}

fn clear_value(rgba: [f32; 4]) -> vk::ClearValue {
    vk::ClearValue {
        color: vk::ClearColorValue { float32: rgba },
    }
}

// Fields drop top to bottom, which is the reverse of creation order.
pub struct VkRenderer {
    scene: Box<dyn SceneRenderer>,
    frames: FrameSync,
    swapchain: Option<Swapchain>,
    swapchain_loader: khr::swapchain::Device,
    device: Device,
    ctx: InstanceContext,

    options: VkOptions,
    clear: vk::ClearValue,
    hint: RenderSize,
    stale: bool,
    paused: bool,
    warned_suboptimal: bool,
}

impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            self.device.handle().device_wait_idle().ok();
        }
    }
}

impl VkRenderer {
    /// STRICT ORDER:
    /// 1) instance + surface
    /// 2) device selection against that surface
    /// 3) swapchain (deferred while the surface reports no extent)
    /// 4) frame sync sized to the chain
    /// 5) scene for the chain's color format
    unsafe fn build(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: VkOptions,
    ) -> PresentResult<Self> {
        let ctx = unsafe { InstanceContext::new(window, display) }?;
        let device = unsafe {
            Device::select(
                &ctx.instance,
                &ctx.surface_loader,
                ctx.surface,
                options.device,
                options.require_compute,
            )
        }?;
        match device.compute_queue {
            Some(_) => debug!("compute queue on family {:?}", device.families().compute),
            None => debug!("no compute queue"),
        }

        let swapchain_loader = khr::swapchain::Device::new(&ctx.instance, device.handle());

        let support =
            unsafe { SurfaceSupport::query(&ctx.surface_loader, device.phys, ctx.surface) }?;
        let plan = SwapchainPlan::resolve(&support, size, options.present)?;
        let chain = if plan.is_drawable() {
            let chain =
                unsafe { Swapchain::create(&device, &swapchain_loader, ctx.surface, plan, None) }?;
            Some(chain)
        } else {
            info!("surface reports no extent yet; swapchain deferred");
            None
        };

        let image_count = chain.as_ref().map_or(0, Swapchain::image_count);
        let frames = unsafe { FrameSync::new(&device, image_count) }?;
        let format = plan.surface_format.format;
        let scene = unsafe { build_scene(options.scene, &ctx, &device, format) }?;
        info!(
            "renderer ready on {}: scene {}, {} frames in flight",
            device.name(),
            scene.name(),
            FRAMES_IN_FLIGHT
        );

        Ok(Self {
            scene,
            frames,
            paused: size.is_empty(),
            swapchain: chain,
            swapchain_loader,
            device,
            ctx,
            clear: clear_value(options.clear_color),
            options,
            hint: size,
            stale: false,
            warned_suboptimal: false,
        })
    }

    /// Rebuilds the chain for the current surface. Returns false, leaving the
    /// chain stale so the next `render` asks again, when the surface has no
    /// drawable extent.
    unsafe fn rebuild(&mut self) -> PresentResult<bool> {
        // Every slot retires, so slot state survives the rebuild untouched.
        unsafe { self.device.handle().device_wait_idle() }.call("device_wait_idle")?;

        let support = unsafe {
            SurfaceSupport::query(&self.ctx.surface_loader, self.device.phys, self.ctx.surface)
        }?;
        let plan = SwapchainPlan::resolve(&support, self.hint, self.options.present)?;
        if !plan.is_drawable() {
            debug!("surface reports no extent; retrying on the next frame");
            self.stale = true;
            return Ok(false);
        }

        let next = unsafe {
            Swapchain::create(
                &self.device,
                &self.swapchain_loader,
                self.ctx.surface,
                plan,
                self.swapchain.as_ref(),
            )
        }?;
        // The retired chain goes only now that its replacement exists.
        self.swapchain = Some(next);

        unsafe { self.frames.rebuild_present_semaphores(self.image_count()) }?;
        self.scene.color_format_changed(plan.surface_format.format)?;

        self.stale = false;
        self.warned_suboptimal = false;
        Ok(true)
    }

    fn image_count(&self) -> usize {
        self.swapchain.as_ref().map_or(0, Swapchain::image_count)
    }
}

impl Renderer for VkRenderer {
    type Options = VkOptions;

    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        options: VkOptions,
    ) -> Result<Self> {
        unsafe { Self::build(window, display, size, options) }.context("vulkan initialization")
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size.is_empty() {
            if !self.paused {
                debug!("window minimized; rendering paused");
            }
            self.paused = true;
            return Ok(());
        }
        self.hint = size;
        self.paused = false;
        unsafe { self.rebuild() }.context("swapchain rebuild")?;
        Ok(())
    }

    fn render(&mut self) -> Result<FrameStatus> {
        if self.paused {
            return Ok(FrameStatus::Paused);
        }
        if needs_rebuild(self.stale, self.swapchain.is_some()) {
            let rebuilt = unsafe { self.rebuild() }.context("swapchain rebuild")?;
            if !rebuilt {
                return Ok(FrameStatus::Paused);
            }
        }

        let status = unsafe { self.draw_frame() }.context("frame")?;
        match status {
            FrameStatus::OutOfDate => {
                debug!("swapchain out of date");
                self.stale = true;
            }
            FrameStatus::Suboptimal if !self.warned_suboptimal => {
                warn!("swapchain is suboptimal for the surface; continuing");
                self.warned_suboptimal = true;
            }
            _ => {}
        }
        Ok(status)
    }
}
