// SPDX-License-Identifier: CEPL-1.0
//! Swapchain (re)creation: the image chain, its views and the parameters
//! resolved from the surface capabilities.

use ash::khr::swapchain;
use ash::vk;
use prism_render::RenderSize;
use tracing::info;

use crate::device::Device;
use crate::error::{PresentResult, VkResultExt};
use crate::surface::{choose_present_mode, choose_surface_format, PresentModePolicy, SurfaceSupport};

const COMPOSITE_ALPHA_ORDER: [vk::CompositeAlphaFlagsKHR; 4] = [
    vk::CompositeAlphaFlagsKHR::OPAQUE,
    vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    vk::CompositeAlphaFlagsKHR::INHERIT,
];

/// One more than the minimum, capped by the maximum (0 == no maximum).
pub fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let want = caps.min_image_count.saturating_add(1);
    if caps.max_image_count == 0 {
        want
    } else {
        want.min(caps.max_image_count)
    }
}

/// The surface's current extent is authoritative; `u32::MAX` means the
/// surface lets the swapchain decide, so the window size is used.
pub fn resolve_extent(caps: &vk::SurfaceCapabilitiesKHR, hint: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: hint
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: hint
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn resolve_transform(caps: &vk::SurfaceCapabilitiesKHR) -> vk::SurfaceTransformFlagsKHR {
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

pub fn resolve_composite_alpha(caps: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    COMPOSITE_ALPHA_ORDER
        .into_iter()
        .find(|&a| caps.supported_composite_alpha.contains(a))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Everything decided before the driver is asked for a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub min_image_count: u32,
    pub surface_format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

impl SwapchainPlan {
    pub fn resolve(
        support: &SurfaceSupport,
        hint: RenderSize,
        policy: PresentModePolicy,
    ) -> PresentResult<Self> {
        let caps = &support.capabilities;
        Ok(Self {
            min_image_count: image_count(caps),
            surface_format: choose_surface_format(&support.formats),
            extent: resolve_extent(caps, hint),
            pre_transform: resolve_transform(caps),
            composite_alpha: resolve_composite_alpha(caps),
            present_mode: choose_present_mode(&support.present_modes, policy)?,
        })
    }

    pub fn is_drawable(&self) -> bool {
        self.extent.width > 0 && self.extent.height > 0
    }
}

/// The image chain. Images belong to the presentation engine; the views are ours.
pub struct Swapchain {
    device: ash::Device,
    loader: swapchain::Device,
    pub(crate) handle: vk::SwapchainKHR,
    pub(crate) images: Vec<vk::Image>,
    pub(crate) views: Vec<vk::ImageView>,
    pub(crate) plan: SwapchainPlan,
}

// Views are created from the chain's images, so they go first.
impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.device.destroy_image_view(view, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.handle, None);
            }
        }
    }
}

impl Swapchain {
    /// Builds a chain for `plan`. `previous` is handed to the driver for
    /// resource reuse; the caller drops it only after this returns `Ok`.
    pub unsafe fn create(
        device: &Device,
        loader: &swapchain::Device,
        surface: vk::SurfaceKHR,
        plan: SwapchainPlan,
        previous: Option<&Swapchain>,
    ) -> PresentResult<Self> {
        let families = device.families();
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, shared): (vk::SharingMode, &[u32]) =
            if families.graphics != families.present {
                (vk::SharingMode::CONCURRENT, family_indices.as_slice())
            } else {
                (vk::SharingMode::EXCLUSIVE, &[][..])
            };

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: plan.min_image_count,
            image_format: plan.surface_format.format,
            image_color_space: plan.surface_format.color_space,
            image_extent: plan.extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: shared.len() as u32,
            p_queue_family_indices: shared.as_ptr(),
            pre_transform: plan.pre_transform,
            composite_alpha: plan.composite_alpha,
            present_mode: plan.present_mode,
            clipped: vk::TRUE,
            old_swapchain: previous.map_or(vk::SwapchainKHR::null(), |p| p.handle),
            ..Default::default()
        };

        let handle = unsafe { loader.create_swapchain(&swap_info, None) }.call("create_swapchain")?;

        let mut chain = Self {
            device: device.handle().clone(),
            loader: loader.clone(),
            handle,
            images: Vec::new(),
            views: Vec::new(),
            plan,
        };

        // The driver may hand back more images than requested.
        chain.images = unsafe { loader.get_swapchain_images(handle) }.call("get_swapchain_images")?;
        chain.views.reserve(chain.images.len());
        for &image in &chain.images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: plan.surface_format.format,
                components: vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                },
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = unsafe { chain.device.create_image_view(&iv_info, None) }
                .call("create_image_view")?;
            chain.views.push(view);
        }

        info!(
            "swapchain: {}x{}, {:?} / {:?}, {:?}, {} images (requested {})",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.surface_format.color_space,
            plan.present_mode,
            chain.images.len(),
            plan.min_image_count
        );
        Ok(chain)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.plan.extent
    }
}
