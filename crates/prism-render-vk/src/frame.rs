// SPDX-License-Identifier: CEPL-1.0
//! Frames in flight: per-slot fences, acquire semaphores and command buffers,
//! plus one present semaphore per swapchain image.

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::error::{PresentError, PresentResult, VkResultExt};

/// Double buffering: frame N+2 may be recorded while frame N is on the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Slot lifecycle:
/// `Idle -> Waiting -> Recording -> Submitted -> (Waiting on next use)`.
/// A submitted slot is only observed retired by the next wait on its fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signaled, nothing pending.
    Idle,
    /// CPU blocked on (or has just observed) the fence.
    Waiting,
    /// Fence reset, command buffer being recorded.
    Recording,
    /// Work queued; the fence signals when the GPU retires it.
    Submitted,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("frame slot {slot}: cannot move from {from:?} to {to:?}")]
pub struct SlotError {
    pub slot: usize,
    pub from: SlotState,
    pub to: SlotState,
}

/// Cursor over the slot ring plus each slot's state.
#[derive(Clone, Debug)]
pub struct SlotTracker {
    states: Vec<SlotState>,
    cursor: usize,
}

impl SlotTracker {
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "at least one frame slot");
        Self {
            states: vec![SlotState::Idle; slots],
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn current(&self) -> usize {
        self.cursor
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.states[slot]
    }

    /// Submitted slots whose retirement has not been observed yet.
    pub fn in_flight(&self) -> usize {
        self.states
            .iter()
            .filter(|&&s| s == SlotState::Submitted)
            .count()
    }

    fn go(&mut self, allowed: &[SlotState], to: SlotState) -> Result<usize, SlotError> {
        let slot = self.cursor;
        let from = self.states[slot];
        if !allowed.contains(&from) {
            return Err(SlotError { slot, from, to });
        }
        self.states[slot] = to;
        Ok(slot)
    }

    pub fn begin_wait(&mut self) -> Result<usize, SlotError> {
        self.go(&[SlotState::Idle, SlotState::Submitted], SlotState::Waiting)
    }

    pub fn begin_recording(&mut self) -> Result<usize, SlotError> {
        self.go(&[SlotState::Waiting], SlotState::Recording)
    }

    pub fn submitted(&mut self) -> Result<usize, SlotError> {
        self.go(&[SlotState::Recording], SlotState::Submitted)
    }

    /// The frame was dropped before its fence was reset (stale swapchain).
    pub fn abandon(&mut self) -> Result<usize, SlotError> {
        self.go(&[SlotState::Waiting], SlotState::Idle)
    }

    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.states.len();
    }

    /// After the device went idle every fence is signaled; start over at slot 0.
    pub fn restart(&mut self) {
        for s in &mut self.states {
            if *s == SlotState::Submitted {
                *s = SlotState::Idle;
            }
        }
        self.cursor = 0;
    }
}

pub struct FrameSlot {
    pub fence: vk::Fence,
    pub acquire: vk::Semaphore,
    pub cmd: vk::CommandBuffer,
}

/// Owns the command pool, every slot, and the per-image present semaphores.
pub struct FrameSync {
    device: ash::Device,
    pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    present: Vec<vk::Semaphore>,
    tracker: SlotTracker,
}

// STRICT ORDER: pool (frees its buffers), then semaphores, then fences.
// Caller idles the device first.
impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            if self.pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(self.pool, None);
            }
            for &sem in &self.present {
                self.device.destroy_semaphore(sem, None);
            }
            for slot in &self.slots {
                self.device.destroy_semaphore(slot.acquire, None);
                self.device.destroy_fence(slot.fence, None);
            }
        }
    }
}

pub(crate) fn wait_timeout_ns(timeout_ms: Option<u64>) -> u64 {
    timeout_ms.map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000))
}

impl FrameSync {
    /// Fences start signaled so the first F frames do not wait on work that
    /// was never submitted.
    pub unsafe fn new(device: &Device, image_count: usize) -> PresentResult<Self> {
        let d = device.handle().clone();
        let mut sync = Self {
            device: d.clone(),
            pool: vk::CommandPool::null(),
            slots: Vec::with_capacity(FRAMES_IN_FLIGHT),
            present: Vec::new(),
            tracker: SlotTracker::new(FRAMES_IN_FLIGHT),
        };

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: device.families().graphics,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            ..Default::default()
        };
        sync.pool = unsafe { d.create_command_pool(&pool_info, None) }.call("create_command_pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: sync.pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: FRAMES_IN_FLIGHT as u32,
            ..Default::default()
        };
        let cmds = unsafe { d.allocate_command_buffers(&alloc_info) }
            .call("allocate_command_buffers")?;

        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        let sem_ci = vk::SemaphoreCreateInfo::default();
        for cmd in cmds {
            let fence = unsafe { d.create_fence(&fence_ci, None) }.call("create_fence")?;
            let acquire = match unsafe { d.create_semaphore(&sem_ci, None) } {
                Ok(sem) => sem,
                Err(result) => {
                    unsafe { d.destroy_fence(fence, None) };
                    return Err(PresentError::Vulkan {
                        call: "create_semaphore",
                        result,
                    });
                }
            };
            sync.slots.push(FrameSlot {
                fence,
                acquire,
                cmd,
            });
        }

        unsafe { sync.fill_present(image_count) }?;
        Ok(sync)
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn present_semaphore(&self, image_index: u32) -> vk::Semaphore {
        self.present[image_index as usize]
    }

    pub fn tracker_mut(&mut self) -> &mut SlotTracker {
        &mut self.tracker
    }

    /// Step 1 of a frame: block until the current slot's previous submission
    /// retired. Returns the slot index.
    pub unsafe fn wait_for_slot(&mut self, timeout_ns: u64) -> PresentResult<usize> {
        let slot = self.tracker.begin_wait()?;
        let fence = self.slots[slot].fence;
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(slot),
            Err(vk::Result::TIMEOUT) => Err(PresentError::Timeout {
                what: "frame fence wait",
            }),
            Err(result) => Err(PresentError::Vulkan {
                call: "wait_for_fences",
                result,
            }),
        }
    }

    /// Resets the slot fence once an image is secured for this frame; the
    /// submit that follows signals it again.
    pub unsafe fn reset_fence(&self, slot: usize) -> PresentResult<()> {
        let fence = self.slots[slot].fence;
        unsafe { self.device.reset_fences(&[fence]) }.call("reset_fences")
    }

    /// Present semaphores follow the image count; call with the device idle.
    pub unsafe fn rebuild_present_semaphores(&mut self, image_count: usize) -> PresentResult<()> {
        for sem in self.present.drain(..) {
            unsafe { self.device.destroy_semaphore(sem, None) };
        }
        unsafe { self.fill_present(image_count) }?;
        self.tracker.restart();
        Ok(())
    }

    // Pushes one at a time so Drop sees every semaphore created so far.
    unsafe fn fill_present(&mut self, image_count: usize) -> PresentResult<()> {
        let sem_ci = vk::SemaphoreCreateInfo::default();
        self.present.reserve(image_count);
        for _ in 0..image_count {
            let sem = unsafe { self.device.create_semaphore(&sem_ci, None) }
                .call("create_semaphore")?;
            self.present.push(sem);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Models fences and a GPU queue that retires submissions in order.
    struct FakeGpu {
        signaled: Vec<bool>,
        queue: VecDeque<usize>,
        seed: u32,
    }

    impl FakeGpu {
        fn new(slots: usize) -> Self {
            Self {
                signaled: vec![true; slots],
                queue: VecDeque::new(),
                seed: 0x2545_f491,
            }
        }

        fn roll(&mut self) -> u32 {
            self.seed ^= self.seed << 13;
            self.seed ^= self.seed >> 17;
            self.seed ^= self.seed << 5;
            self.seed
        }

        fn retire_one(&mut self) {
            if let Some(slot) = self.queue.pop_front() {
                self.signaled[slot] = true;
            }
        }

        fn block_on(&mut self, slot: usize) {
            while !self.signaled[slot] {
                self.retire_one();
            }
        }

        fn unsignaled(&self) -> usize {
            self.signaled.iter().filter(|s| !**s).count()
        }
    }

    #[test]
    fn in_flight_never_exceeds_slot_count() {
        for slots in 1..=4 {
            let mut tracker = SlotTracker::new(slots);
            let mut gpu = FakeGpu::new(slots);
            for frame in 0..500u32 {
                let slot = tracker.begin_wait().unwrap();
                gpu.block_on(slot);

                // every 11th acquire reports a stale chain
                if frame % 11 == 10 {
                    tracker.abandon().unwrap();
                    assert!(gpu.signaled[slot], "abandoned slot must stay signaled");
                    continue;
                }

                assert!(gpu.signaled[slot], "recording into a busy slot");
                tracker.begin_recording().unwrap();
                gpu.signaled[slot] = false;
                tracker.submitted().unwrap();
                gpu.queue.push_back(slot);

                assert!(gpu.unsignaled() <= slots);
                assert!(tracker.in_flight() <= slots);

                for _ in 0..(gpu.roll() % 3) {
                    gpu.retire_one();
                }
                tracker.advance();
            }
        }
    }

    #[test]
    fn slot_cursor_cycles_in_order() {
        let mut tracker = SlotTracker::new(FRAMES_IN_FLIGHT);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let slot = tracker.begin_wait().unwrap();
            tracker.begin_recording().unwrap();
            tracker.submitted().unwrap();
            seen.push(slot);
            tracker.advance();
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn cannot_record_without_waiting() {
        let mut tracker = SlotTracker::new(2);
        let err = tracker.begin_recording().unwrap_err();
        assert_eq!(
            err,
            SlotError {
                slot: 0,
                from: SlotState::Idle,
                to: SlotState::Recording
            }
        );
    }

    #[test]
    fn submitted_slot_must_be_waited_on_before_reuse() {
        let mut tracker = SlotTracker::new(1);
        tracker.begin_wait().unwrap();
        tracker.begin_recording().unwrap();
        tracker.submitted().unwrap();
        assert!(tracker.begin_recording().is_err());
        assert_eq!(tracker.begin_wait().unwrap(), 0);
        assert_eq!(tracker.state(0), SlotState::Waiting);
    }

    #[test]
    fn abandoned_frame_keeps_its_slot() {
        let mut tracker = SlotTracker::new(2);
        let slot = tracker.begin_wait().unwrap();
        tracker.abandon().unwrap();
        assert_eq!(tracker.current(), slot);
        assert_eq!(tracker.state(slot), SlotState::Idle);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn restart_returns_to_slot_zero_with_everything_idle() {
        let mut tracker = SlotTracker::new(2);
        for _ in 0..3 {
            tracker.begin_wait().unwrap();
            tracker.begin_recording().unwrap();
            tracker.submitted().unwrap();
            tracker.advance();
        }
        assert_eq!(tracker.current(), 1);
        assert_eq!(tracker.in_flight(), 2);
        tracker.restart();
        assert_eq!(tracker.current(), 0);
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(wait_timeout_ns(None), u64::MAX);
        assert_eq!(wait_timeout_ns(Some(16)), 16_000_000);
        assert_eq!(wait_timeout_ns(Some(u64::MAX)), u64::MAX);
    }
}
