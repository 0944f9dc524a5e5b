// SPDX-License-Identifier: CEPL-1.0
//! Device selection: physical device, queue families, logical device.

use std::collections::BTreeSet;
use std::ffi::CStr;

use ash::khr::{surface, swapchain};
use ash::vk;
use tracing::{debug, info};

use crate::error::{PresentError, PresentResult, VkResultExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Only a discrete GPU is acceptable.
    #[default]
    Discrete,
    /// Only an integrated GPU is acceptable.
    Integrated,
    /// Discrete if there is one, otherwise the first device reported.
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Present,
    Compute,
}

/// Picks a device index from the enumerated properties.
pub fn choose_device(
    candidates: &[vk::PhysicalDeviceProperties],
    preference: DevicePreference,
) -> PresentResult<usize> {
    if candidates.is_empty() {
        return Err(PresentError::NoDeviceFound);
    }
    let first_of = |ty: vk::PhysicalDeviceType| candidates.iter().position(|p| p.device_type == ty);
    let found = match preference {
        DevicePreference::Discrete => first_of(vk::PhysicalDeviceType::DISCRETE_GPU),
        DevicePreference::Integrated => first_of(vk::PhysicalDeviceType::INTEGRATED_GPU),
        DevicePreference::Any => first_of(vk::PhysicalDeviceType::DISCRETE_GPU).or(Some(0)),
    };
    found.ok_or(PresentError::NoSuitableDeviceFound { preference })
}

/// Family index per queue role. Indices may coincide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub compute: Option<u32>,
}

impl QueueFamilies {
    /// Scans families in index order and keeps the FIRST match per role.
    /// `supports_present` is asked about every family until a present-capable
    /// one is found.
    pub fn scan(
        families: &[vk::QueueFamilyProperties],
        mut supports_present: impl FnMut(u32) -> PresentResult<bool>,
        require_compute: bool,
    ) -> PresentResult<Self> {
        let mut graphics = None;
        let mut present = None;
        let mut compute = None;

        for (i, family) in families.iter().enumerate() {
            if family.queue_count == 0 {
                continue;
            }
            let i = i as u32;
            if graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                graphics = Some(i);
            }
            if compute.is_none() && family.queue_flags.contains(vk::QueueFlags::COMPUTE) {
                compute = Some(i);
            }
            if present.is_none() && supports_present(i)? {
                present = Some(i);
            }
            if graphics.is_some() && present.is_some() && compute.is_some() {
                break;
            }
        }

        let missing = PresentError::MissingRequiredQueueFamily;
        let graphics = graphics.ok_or(missing(QueueRole::Graphics))?;
        let present = present.ok_or(missing(QueueRole::Present))?;
        if require_compute && compute.is_none() {
            return Err(missing(QueueRole::Compute));
        }
        Ok(Self {
            graphics,
            present,
            compute,
        })
    }

    /// Distinct family indices, ascending. One queue is created per entry.
    pub fn unique(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = [Some(self.graphics), Some(self.present), self.compute]
            .into_iter()
            .flatten()
            .collect();
        set.into_iter().collect()
    }
}

/// Selected physical device plus the logical device created on it.
pub struct Device {
    pub(crate) phys: vk::PhysicalDevice,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) handle: ash::Device,
    pub(crate) families: QueueFamilies,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) present_queue: vk::Queue,
    pub(crate) compute_queue: Option<vk::Queue>,
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            self.handle.device_wait_idle().ok();
            self.handle.destroy_device(None);
        }
    }
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(props.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

impl Device {
    pub fn name(&self) -> String {
        device_name(&self.properties)
    }

    pub fn handle(&self) -> &ash::Device {
        &self.handle
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    /// STRICT ORDER:
    /// 1) pick the physical device by type preference
    /// 2) scan its queue families against the already-created surface
    /// 3) create the logical device with one queue per unique family,
    ///    VK_KHR_swapchain and core 1.3 dynamic rendering + sync2
    pub unsafe fn select(
        instance: &ash::Instance,
        surface_loader: &surface::Instance,
        surface: vk::SurfaceKHR,
        preference: DevicePreference,
        require_compute: bool,
    ) -> PresentResult<Self> {
        let devices =
            unsafe { instance.enumerate_physical_devices() }.call("enumerate_physical_devices")?;
        let props: Vec<_> = devices
            .iter()
            .map(|&d| unsafe { instance.get_physical_device_properties(d) })
            .collect();
        for p in &props {
            info!("device: {} ({:?})", device_name(p), p.device_type);
        }

        let chosen = choose_device(&props, preference)?;
        let phys = devices[chosen];
        let properties = props[chosen];
        info!(
            "selected {} ({:?})",
            device_name(&properties),
            properties.device_type
        );

        let major = vk::api_version_major(properties.api_version);
        let minor = vk::api_version_minor(properties.api_version);
        if major == 1 && minor < 3 {
            return Err(PresentError::UnsupportedApiVersion { major, minor });
        }

        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let families = QueueFamilies::scan(
            &qprops,
            |i| {
                unsafe { surface_loader.get_physical_device_surface_support(phys, i, surface) }
                    .call("get_physical_device_surface_support")
            },
            require_compute,
        )?;
        debug!(
            "queue families: graphics={} present={} compute={:?}",
            families.graphics, families.present, families.compute
        );

        let priorities = [1.0_f32];
        let queue_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| vk::DeviceQueueCreateInfo {
                s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
                queue_family_index: family,
                queue_count: 1,
                p_queue_priorities: priorities.as_ptr(),
                ..Default::default()
            })
            .collect();

        let device_exts = [swapchain::NAME.as_ptr()];

        // pNext chain: features2 -> vulkan13 features
        let mut feats13 = vk::PhysicalDeviceVulkan13Features {
            s_type: vk::StructureType::PHYSICAL_DEVICE_VULKAN_1_3_FEATURES,
            dynamic_rendering: vk::TRUE,
            synchronization2: vk::TRUE,
            ..Default::default()
        };
        let feats2 = vk::PhysicalDeviceFeatures2 {
            s_type: vk::StructureType::PHYSICAL_DEVICE_FEATURES_2,
            p_next: (&mut feats13) as *mut _ as *mut _,
            ..Default::default()
        };

        let dinfo = vk::DeviceCreateInfo {
            s_type: vk::StructureType::DEVICE_CREATE_INFO,
            p_next: (&feats2) as *const _ as *const _,
            queue_create_info_count: queue_infos.len() as u32,
            p_queue_create_infos: queue_infos.as_ptr(),
            enabled_extension_count: device_exts.len() as u32,
            pp_enabled_extension_names: device_exts.as_ptr(),
            ..Default::default()
        };

        let handle = unsafe { instance.create_device(phys, &dinfo, None) }.call("create_device")?;
        let graphics_queue = unsafe { handle.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { handle.get_device_queue(families.present, 0) };
        let compute_queue = families
            .compute
            .map(|family| unsafe { handle.get_device_queue(family, 0) });

        Ok(Self {
            phys,
            properties,
            handle,
            families,
            graphics_queue,
            present_queue,
            compute_queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(ty: vk::PhysicalDeviceType) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            device_type: ty,
            ..Default::default()
        }
    }

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn empty_enumeration_is_no_device_found() {
        let err = choose_device(&[], DevicePreference::Any).unwrap_err();
        assert!(matches!(err, PresentError::NoDeviceFound));
    }

    #[test]
    fn discrete_preference_skips_integrated() {
        let list = [
            props(vk::PhysicalDeviceType::INTEGRATED_GPU),
            props(vk::PhysicalDeviceType::DISCRETE_GPU),
        ];
        assert_eq!(choose_device(&list, DevicePreference::Discrete).unwrap(), 1);
    }

    #[test]
    fn discrete_preference_does_not_degrade() {
        let list = [props(vk::PhysicalDeviceType::INTEGRATED_GPU)];
        let err = choose_device(&list, DevicePreference::Discrete).unwrap_err();
        assert!(matches!(
            err,
            PresentError::NoSuitableDeviceFound {
                preference: DevicePreference::Discrete
            }
        ));
    }

    #[test]
    fn any_preference_falls_back_to_first() {
        let list = [
            props(vk::PhysicalDeviceType::CPU),
            props(vk::PhysicalDeviceType::INTEGRATED_GPU),
        ];
        assert_eq!(choose_device(&list, DevicePreference::Any).unwrap(), 0);
    }

    #[test]
    fn scan_records_first_family_per_role() {
        let families = [
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::COMPUTE),
        ];
        let q = QueueFamilies::scan(&families, |i| Ok(i >= 2), true).unwrap();
        assert_eq!(q.graphics, 1);
        assert_eq!(q.compute, Some(1));
        assert_eq!(q.present, 2);
        assert_eq!(q.unique(), vec![1, 2]);
    }

    #[test]
    fn coinciding_families_collapse_to_one_queue() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let q = QueueFamilies::scan(&families, |_| Ok(true), true).unwrap();
        assert_eq!((q.graphics, q.present, q.compute), (0, 0, Some(0)));
        assert_eq!(q.unique(), vec![0]);
    }

    #[test]
    fn missing_present_is_fatal() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)];
        let err = QueueFamilies::scan(&families, |_| Ok(false), true).unwrap_err();
        assert!(matches!(
            err,
            PresentError::MissingRequiredQueueFamily(QueueRole::Present)
        ));
    }

    #[test]
    fn missing_graphics_is_fatal() {
        let families = [family(vk::QueueFlags::COMPUTE)];
        let err = QueueFamilies::scan(&families, |_| Ok(true), false).unwrap_err();
        assert!(matches!(
            err,
            PresentError::MissingRequiredQueueFamily(QueueRole::Graphics)
        ));
    }

    #[test]
    fn compute_is_optional_only_when_not_required() {
        let families = [vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS,
            queue_count: 1,
            ..Default::default()
        }];
        let strict = QueueFamilies::scan(&families, |_| Ok(true), true).unwrap_err();
        assert!(matches!(
            strict,
            PresentError::MissingRequiredQueueFamily(QueueRole::Compute)
        ));
        let relaxed = QueueFamilies::scan(&families, |_| Ok(true), false).unwrap();
        assert_eq!(relaxed.compute, None);
    }

    #[test]
    fn present_query_errors_propagate() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let err = QueueFamilies::scan(
            &families,
            |_| Err(PresentError::Vulkan {
                call: "get_physical_device_surface_support",
                result: vk::Result::ERROR_SURFACE_LOST_KHR,
            }),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PresentError::Vulkan { .. }));
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            vk::QueueFamilyProperties {
                queue_flags: vk::QueueFlags::GRAPHICS,
                queue_count: 0,
                ..Default::default()
            },
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let q = QueueFamilies::scan(&families, |_| Ok(true), true).unwrap();
        assert_eq!(q.graphics, 1);
        assert_eq!(q.present, 1);
    }
}
