// SPDX-License-Identifier: CEPL-1.0
//! One frame: wait for the slot, acquire, record, submit, present, advance.

use ash::prelude::VkResult;
use ash::vk;
use prism_render::FrameStatus;
use tracing::trace;

use crate::error::{PresentError, PresentResult, VkResultExt};
use crate::frame::{wait_timeout_ns, SlotError, SlotTracker};
use crate::scene::{RecordContext, SceneRenderer};
use crate::VkRenderer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

pub(crate) fn classify_acquire(result: VkResult<(u32, bool)>) -> PresentResult<Acquired> {
    match result {
        Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
        Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(PresentError::Timeout {
            what: "swapchain image acquire",
        }),
        Err(result) => Err(PresentError::Vulkan {
            call: "acquire_next_image",
            result,
        }),
    }
}

pub(crate) fn classify_present(result: VkResult<bool>) -> PresentResult<FrameStatus> {
    match result {
        Ok(false) => Ok(FrameStatus::Presented),
        Ok(true) => Ok(FrameStatus::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(FrameStatus::OutOfDate),
        Err(result) => Err(PresentError::Vulkan {
            call: "queue_present",
            result,
        }),
    }
}

/// What the current slot does after the acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Record { image_index: u32, suboptimal: bool },
    /// Stale chain: the fence was never reset, so the slot stays signaled and
    /// is reused by the next frame.
    Abandoned,
}

pub(crate) fn after_acquire(
    tracker: &mut SlotTracker,
    acquired: Acquired,
) -> Result<Step, SlotError> {
    match acquired {
        Acquired::Image { index, suboptimal } => {
            tracker.begin_recording()?;
            Ok(Step::Record {
                image_index: index,
                suboptimal,
            })
        }
        Acquired::OutOfDate => {
            tracker.abandon()?;
            Ok(Step::Abandoned)
        }
    }
}

/// A clean present of an image acquired as suboptimal still reports
/// `Suboptimal`.
pub(crate) fn frame_status(acquire_suboptimal: bool, present: FrameStatus) -> FrameStatus {
    match present {
        FrameStatus::Presented if acquire_suboptimal => FrameStatus::Suboptimal,
        other => other,
    }
}

/// The submit already happened, so the slot advances whatever the present
/// reported.
pub(crate) fn finish_frame(
    tracker: &mut SlotTracker,
    acquire_suboptimal: bool,
    present: FrameStatus,
) -> FrameStatus {
    tracker.advance();
    frame_status(acquire_suboptimal, present)
}

/// Single mip, single layer, color aspect.
const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// What a frame renders into.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameTarget {
    pub cmd: vk::CommandBuffer,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent2D,
}

// Source stage matches the acquire-semaphore wait stage so the layout change
// happens after the presentation engine released the image.
unsafe fn transition_to_color(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    let barrier = vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags2::empty(),
        dst_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        dst_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        old_layout: vk::ImageLayout::UNDEFINED,
        new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        image,
        subresource_range: COLOR_RANGE,
        ..Default::default()
    };
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &barrier,
        ..Default::default()
    };
    unsafe { device.cmd_pipeline_barrier2(cmd, &dep) };
}

unsafe fn transition_to_present(device: &ash::Device, cmd: vk::CommandBuffer, image: vk::Image) {
    let barrier = vk::ImageMemoryBarrier2 {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER_2,
        src_stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        dst_stage_mask: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        dst_access_mask: vk::AccessFlags2::empty(),
        old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        image,
        subresource_range: COLOR_RANGE,
        ..Default::default()
    };
    let dep = vk::DependencyInfo {
        s_type: vk::StructureType::DEPENDENCY_INFO,
        image_memory_barrier_count: 1,
        p_image_memory_barriers: &barrier,
        ..Default::default()
    };
    unsafe { device.cmd_pipeline_barrier2(cmd, &dep) };
}

unsafe fn begin_rendering(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    view: vk::ImageView,
    extent: vk::Extent2D,
    clear: vk::ClearValue,
) {
    let color_att = vk::RenderingAttachmentInfo {
        s_type: vk::StructureType::RENDERING_ATTACHMENT_INFO,
        image_view: view,
        image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        clear_value: clear,
        ..Default::default()
    };
    let rendering_info = vk::RenderingInfo {
        s_type: vk::StructureType::RENDERING_INFO,
        render_area: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        },
        layer_count: 1,
        color_attachment_count: 1,
        p_color_attachments: &color_att,
        ..Default::default()
    };
    unsafe { device.cmd_begin_rendering(cmd, &rendering_info) };
}

// Viewport and scissor are dynamic so a rebuilt chain never forces a
// pipeline rebuild.
unsafe fn set_viewport_and_scissor(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    extent: vk::Extent2D,
) {
    let vp = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let sc = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    unsafe {
        device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&vp));
        device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&sc));
    }
}

/// Steps 3 to 6: reset + begin, barrier in, rendering pass with the scene,
/// barrier out, end.
pub(crate) unsafe fn record_frame(
    device: &ash::Device,
    target: FrameTarget,
    clear: vk::ClearValue,
    scene: &mut dyn SceneRenderer,
) -> PresentResult<()> {
    let cmd = target.cmd;
    unsafe { device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()) }
        .call("reset_command_buffer")?;
    let begin = vk::CommandBufferBeginInfo {
        s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
        flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        ..Default::default()
    };
    unsafe { device.begin_command_buffer(cmd, &begin) }.call("begin_command_buffer")?;

    unsafe {
        transition_to_color(device, cmd, target.image);
        begin_rendering(device, cmd, target.view, target.extent, clear);
        set_viewport_and_scissor(device, cmd, target.extent);
    }
    scene.record(&RecordContext {
        device,
        cmd,
        extent: target.extent,
    })?;
    unsafe {
        device.cmd_end_rendering(cmd);
        transition_to_present(device, cmd, target.image);
    }

    unsafe { device.end_command_buffer(cmd) }.call("end_command_buffer")
}

impl VkRenderer {
    /// Runs one frame. A stale chain comes back as `FrameStatus::OutOfDate`;
    /// every other failure is fatal.
    pub(crate) unsafe fn draw_frame(&mut self) -> PresentResult<FrameStatus> {
        let Some(chain) = self.swapchain.as_ref() else {
            return Ok(FrameStatus::Paused);
        };
        let timeout = wait_timeout_ns(self.options.frame_timeout_ms);

        // 1) slot fence
        let slot = unsafe { self.frames.wait_for_slot(timeout) }?;
        let (fence, acquire, cmd) = {
            let s = self.frames.slot(slot);
            (s.fence, s.acquire, s.cmd)
        };

        // 2) acquire; image index and slot index are unrelated
        let acquired = classify_acquire(unsafe {
            self.swapchain_loader.acquire_next_image(
                chain.handle,
                timeout,
                acquire,
                vk::Fence::null(),
            )
        })?;
        let (image_index, acquire_suboptimal) =
            match after_acquire(self.frames.tracker_mut(), acquired)? {
                Step::Record {
                    image_index,
                    suboptimal,
                } => (image_index, suboptimal),
                Step::Abandoned => return Ok(FrameStatus::OutOfDate),
            };
        debug_assert!((image_index as usize) < chain.image_count());
        trace!("frame: slot {slot} image {image_index}");

        unsafe { self.frames.reset_fence(slot) }?;

        // 3-6) record
        let target = FrameTarget {
            cmd,
            image: chain.images[image_index as usize],
            view: chain.views[image_index as usize],
            extent: chain.extent(),
        };
        unsafe { record_frame(self.device.handle(), target, self.clear, self.scene.as_mut()) }?;

        // 7) submit: wait acquire at color output, signal the image's present
        //    semaphore, signal the slot fence
        let render_done = self.frames.present_semaphore(image_index);
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: 1,
            p_wait_semaphores: &acquire,
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &cmd,
            signal_semaphore_count: 1,
            p_signal_semaphores: &render_done,
            ..Default::default()
        };
        unsafe {
            self.device.handle().queue_submit(
                self.device.graphics_queue,
                std::slice::from_ref(&submit),
                fence,
            )
        }
        .call("queue_submit")?;
        self.frames.tracker_mut().submitted()?;

        // 8) present
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &render_done,
            swapchain_count: 1,
            p_swapchains: &chain.handle,
            p_image_indices: &image_index,
            ..Default::default()
        };
        let status = classify_present(unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue, &present)
        })?;

        // 9) next slot
        Ok(finish_frame(
            self.frames.tracker_mut(),
            acquire_suboptimal,
            status,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SlotState;

    #[test]
    fn acquire_success_and_suboptimal_keep_the_index() {
        assert_eq!(
            classify_acquire(Ok((2, false))).unwrap(),
            Acquired::Image {
                index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            classify_acquire(Ok((0, true))).unwrap(),
            Acquired::Image {
                index: 0,
                suboptimal: true
            }
        );
    }

    #[test]
    fn acquire_out_of_date_is_not_an_error() {
        assert_eq!(
            classify_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            Acquired::OutOfDate
        );
    }

    #[test]
    fn acquire_timeout_is_distinct() {
        for r in [vk::Result::TIMEOUT, vk::Result::NOT_READY] {
            assert!(matches!(
                classify_acquire(Err(r)),
                Err(PresentError::Timeout { .. })
            ));
        }
    }

    #[test]
    fn acquire_other_failures_are_fatal() {
        assert!(matches!(
            classify_acquire(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(PresentError::Vulkan {
                call: "acquire_next_image",
                result: vk::Result::ERROR_SURFACE_LOST_KHR
            })
        ));
    }

    #[test]
    fn present_outcomes() {
        assert_eq!(classify_present(Ok(false)).unwrap(), FrameStatus::Presented);
        assert_eq!(classify_present(Ok(true)).unwrap(), FrameStatus::Suboptimal);
        assert_eq!(
            classify_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            FrameStatus::OutOfDate
        );
        assert!(matches!(
            classify_present(Err(vk::Result::ERROR_DEVICE_LOST)),
            Err(PresentError::Vulkan {
                call: "queue_present",
                ..
            })
        ));
    }

    #[test]
    fn acquired_image_moves_the_slot_to_recording() {
        let mut tracker = SlotTracker::new(2);
        tracker.begin_wait().unwrap();
        let step = after_acquire(
            &mut tracker,
            Acquired::Image {
                index: 1,
                suboptimal: true,
            },
        )
        .unwrap();
        assert_eq!(
            step,
            Step::Record {
                image_index: 1,
                suboptimal: true
            }
        );
        assert_eq!(tracker.state(0), SlotState::Recording);
    }

    #[test]
    fn out_of_date_acquire_abandons_without_advancing() {
        let mut tracker = SlotTracker::new(2);
        tracker.begin_wait().unwrap();
        let step = after_acquire(&mut tracker, Acquired::OutOfDate).unwrap();
        assert_eq!(step, Step::Abandoned);
        assert_eq!(tracker.current(), 0);
        assert_eq!(tracker.state(0), SlotState::Idle);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn acquire_outcome_needs_a_waited_slot() {
        let mut tracker = SlotTracker::new(2);
        let err = after_acquire(
            &mut tracker,
            Acquired::Image {
                index: 0,
                suboptimal: false,
            },
        )
        .unwrap_err();
        assert_eq!(err.from, SlotState::Idle);
        assert!(after_acquire(&mut tracker, Acquired::OutOfDate).is_err());
    }

    #[test]
    fn suboptimal_acquire_with_clean_present_is_suboptimal() {
        assert_eq!(
            frame_status(true, FrameStatus::Presented),
            FrameStatus::Suboptimal
        );
        assert_eq!(
            frame_status(false, FrameStatus::Presented),
            FrameStatus::Presented
        );
        assert_eq!(
            frame_status(true, FrameStatus::OutOfDate),
            FrameStatus::OutOfDate
        );
        assert_eq!(
            frame_status(false, FrameStatus::Suboptimal),
            FrameStatus::Suboptimal
        );
    }

    #[test]
    fn out_of_date_present_still_advances_the_slot() {
        let mut tracker = SlotTracker::new(2);
        tracker.begin_wait().unwrap();
        tracker.begin_recording().unwrap();
        tracker.submitted().unwrap();
        let status = finish_frame(&mut tracker, false, FrameStatus::OutOfDate);
        assert_eq!(status, FrameStatus::OutOfDate);
        assert_eq!(tracker.current(), 1);
        assert_eq!(tracker.state(0), SlotState::Submitted);
    }

    #[test]
    fn frame_sequence_through_the_decisions() {
        let mut tracker = SlotTracker::new(2);
        let outcomes = [
            (Acquired::Image { index: 0, suboptimal: false }, FrameStatus::Presented),
            (Acquired::OutOfDate, FrameStatus::Presented),
            (Acquired::Image { index: 2, suboptimal: true }, FrameStatus::Presented),
            (Acquired::Image { index: 1, suboptimal: false }, FrameStatus::OutOfDate),
        ];
        let mut seen = Vec::new();
        for (acquired, present) in outcomes {
            let slot = tracker.begin_wait().unwrap();
            let status = match after_acquire(&mut tracker, acquired).unwrap() {
                Step::Record { suboptimal, .. } => {
                    tracker.submitted().unwrap();
                    finish_frame(&mut tracker, suboptimal, present)
                }
                Step::Abandoned => FrameStatus::OutOfDate,
            };
            seen.push((slot, status));
        }
        assert_eq!(
            seen,
            vec![
                (0, FrameStatus::Presented),
                (1, FrameStatus::OutOfDate),
                (1, FrameStatus::Suboptimal),
                (0, FrameStatus::OutOfDate),
            ]
        );
        assert_eq!(tracker.current(), 1);
        assert!(tracker.in_flight() <= 2);
    }
}
