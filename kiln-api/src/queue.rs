use crate::backends::{
    KilnNativeCommandAllocator, KilnNativeCommandList, KilnNativeDevice, KilnNativeFence,
    KilnNativeQueue,
};
use crate::*;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A native command list plus one allocator per frame slot. The allocator of a slot is only reset
/// once the GPU has finished the frame that last used it.
#[derive(Debug)]
pub(crate) struct KilnCommandRecorder {
    allocators: [KilnNativeCommandAllocator; crate::MAX_FRAMES_IN_FLIGHT],
    // Last fence value submitted from each allocator, 0 if none
    allocator_fence_values: [u64; crate::MAX_FRAMES_IN_FLIGHT],
    active_allocator: usize,
    command_list: KilnNativeCommandList,
}

impl KilnCommandRecorder {
    fn new(
        native: &KilnNativeDevice,
        queue_type: KilnQueueType,
    ) -> KilnResult<Self> {
        let mut allocators = Vec::with_capacity(crate::MAX_FRAMES_IN_FLIGHT);
        for _ in 0..crate::MAX_FRAMES_IN_FLIGHT {
            match native.create_command_allocator(queue_type) {
                Ok(allocator) => allocators.push(allocator),
                Err(e) => {
                    for allocator in allocators {
                        native.destroy(allocator.into());
                    }
                    return Err(e);
                }
            }
        }

        let command_list = match native.create_command_list(queue_type) {
            Ok(command_list) => command_list,
            Err(e) => {
                for allocator in allocators {
                    native.destroy(allocator.into());
                }
                return Err(e);
            }
        };

        Ok(KilnCommandRecorder {
            allocators: [allocators[0], allocators[1]],
            allocator_fence_values: [0; crate::MAX_FRAMES_IN_FLIGHT],
            active_allocator: 0,
            command_list,
        })
    }

    pub(crate) fn command_list(&self) -> KilnNativeCommandList {
        self.command_list
    }

    /// Reset the allocator of the frame slot and open the command list on it
    pub(crate) fn reset(
        &mut self,
        native: &KilnNativeDevice,
        frame_index: usize,
    ) -> KilnResult<()> {
        let allocator = self.allocators[frame_index];
        native.reset_command_allocator(allocator)?;
        native.reset_command_list(self.command_list, allocator)?;
        self.active_allocator = frame_index;
        Ok(())
    }

    /// Fence value that must complete before the allocator of `frame_index` can be reset
    fn pending_fence_value(
        &self,
        frame_index: usize,
    ) -> u64 {
        self.allocator_fence_values[frame_index]
    }

    fn mark_submitted(
        &mut self,
        value: u64,
    ) {
        self.allocator_fence_values[self.active_allocator] = value;
    }

    pub(crate) fn destroy(
        self,
        native: &KilnNativeDevice,
    ) {
        native.destroy(self.command_list.into());
        for allocator in self.allocators.iter() {
            native.destroy((*allocator).into());
        }
    }
}

struct KilnQueueState {
    // Low bits of the last fence value handed out
    fence_counter: u64,
    last_submitted_value: u64,
    free_recorders: Vec<KilnCommandRecorder>,
    // Recorders used during the current frame. They become free when the next frame starts.
    used_recorders: Vec<KilnCommandRecorder>,
    pending_presents: Vec<KilnSwapChain>,
    frame_fence_values: [u64; crate::MAX_FRAMES_IN_FLIGHT],
}

/// One native queue and the fence that tracks its progress. Every fence value this queue signals
/// carries the queue's command list type in its top 8 bits.
pub struct KilnQueue {
    device_context: KilnDeviceContext,
    queue_type: KilnQueueType,
    queue: KilnNativeQueue,
    fence: KilnNativeFence,
    state: Mutex<KilnQueueState>,
    last_completed_value: AtomicU64,
    recorder_tx: Sender<KilnCommandRecorder>,
    recorder_rx: Receiver<KilnCommandRecorder>,
}

impl std::fmt::Debug for KilnQueue {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnQueue")
            .field("queue_type", &self.queue_type)
            .field("queue", &self.queue)
            .field("fence", &self.fence)
            .finish()
    }
}

impl KilnQueue {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        queue_type: KilnQueueType,
    ) -> KilnResult<Self> {
        let native = device_context.native();
        let queue = device_context.create_native(|native| native.create_queue(queue_type))?;
        let fence = match native.create_fence(queue_type.fence_base()) {
            Ok(fence) => fence,
            Err(e) => {
                native.destroy(queue.into());
                return Err(device_context.handle_native_error(e));
            }
        };

        let (recorder_tx, recorder_rx) = crossbeam_channel::unbounded();

        log::debug!("Created {:?} queue {:?}", queue_type, queue);

        Ok(KilnQueue {
            device_context: device_context.clone(),
            queue_type,
            queue,
            fence,
            state: Mutex::new(KilnQueueState {
                fence_counter: 0,
                last_submitted_value: queue_type.fence_base(),
                free_recorders: Vec::default(),
                used_recorders: Vec::default(),
                pending_presents: Vec::default(),
                frame_fence_values: [0; crate::MAX_FRAMES_IN_FLIGHT],
            }),
            last_completed_value: AtomicU64::new(queue_type.fence_base()),
            recorder_tx,
            recorder_rx,
        })
    }

    pub fn queue_type(&self) -> KilnQueueType {
        self.queue_type
    }

    pub fn native_queue(&self) -> KilnNativeQueue {
        self.queue
    }

    pub fn native_fence(&self) -> KilnNativeFence {
        self.fence
    }

    pub fn last_submitted_value(&self) -> u64 {
        self.state.lock().unwrap().last_submitted_value
    }

    /// Start recording. Picks a free recorder from the pool, creating one if the pool is empty.
    pub fn begin_command_buffer(
        &self,
        label: Option<&str>,
    ) -> KilnResult<KilnCommandBuffer> {
        self.device_context.check_lost()?;

        let recorder = self.state.lock().unwrap().free_recorders.pop();
        let mut recorder = match recorder {
            Some(recorder) => recorder,
            None => {
                log::trace!("Growing {:?} recorder pool", self.queue_type);
                self.device_context.create_native(|native| {
                    KilnCommandRecorder::new(native, self.queue_type)
                })?
            }
        };

        // A command buffer submitted after the frame it was begun in is not covered by that
        // frame's fence, so the allocator may still be in use
        let frame_index = self.device_context.frame_index();
        let pending = recorder.pending_fence_value(frame_index);
        if pending != 0 {
            if let Err(e) = self.wait_for_fence(pending) {
                self.state.lock().unwrap().used_recorders.push(recorder);
                return Err(e);
            }
        }

        if let Err(e) = recorder.reset(self.device_context.native(), frame_index) {
            self.state.lock().unwrap().used_recorders.push(recorder);
            return Err(self.device_context.handle_native_error(e));
        }

        Ok(KilnCommandBuffer::new(
            &self.device_context,
            self.queue_type,
            recorder,
            self.recorder_tx.clone(),
            label,
        ))
    }

    fn next_fence_value(state: &mut KilnQueueState) -> u64 {
        state.fence_counter += 1;
        state.fence_counter
    }

    // Hands out the next value and signals it. Called with the state lock held.
    fn signal_locked(
        &self,
        state: &mut KilnQueueState,
    ) -> KilnResult<u64> {
        let value = self.queue_type.fence_base() | Self::next_fence_value(state);
        self.device_context
            .native()
            .queue_signal(self.queue, self.fence, value)
            .map_err(|e| self.device_context.handle_native_error(e))?;
        state.last_submitted_value = value;
        Ok(value)
    }

    /// Close the command buffer, execute it and signal a new fence value. Returns that value.
    pub fn submit(
        &self,
        command_buffer: KilnCommandBuffer,
    ) -> KilnResult<u64> {
        profiling::scope!("KilnQueue::submit");
        if command_buffer.queue_type() != self.queue_type {
            return Err(KilnError::PreconditionViolation(format!(
                "A {:?} command buffer cannot be submitted to a {:?} queue",
                command_buffer.queue_type(),
                self.queue_type
            )));
        }

        let (mut recorder, presents) = command_buffer.finish()?;

        let mut state = self.state.lock().unwrap();
        let command_list = recorder.command_list();

        let result = self.device_context.check_lost().and_then(|_| {
            self.device_context
                .native()
                .execute_command_lists(self.queue, &[command_list])
                .map_err(|e| self.device_context.handle_native_error(e))?;
            self.signal_locked(&mut *state)
        });
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                state.used_recorders.push(recorder);
                return Err(e);
            }
        };

        recorder.mark_submitted(value);
        state.used_recorders.push(recorder);
        state.pending_presents.extend(presents);

        log::trace!("Submitted to {:?} queue, fence value {:#x}", self.queue_type, value);
        Ok(value)
    }

    /// Signal a new fence value without submitting any work
    pub fn signal(&self) -> KilnResult<u64> {
        self.device_context.check_lost()?;
        let mut state = self.state.lock().unwrap();
        self.signal_locked(&mut *state)
    }

    /// Make this queue wait on the GPU until `other` reaches `value`. The CPU does not block.
    pub fn wait_for_queue(
        &self,
        other: &KilnQueue,
        value: u64,
    ) -> KilnResult<()> {
        self.device_context.check_lost()?;
        other.check_fence_value(value)?;

        let _state = self.state.lock().unwrap();
        self.device_context
            .native()
            .queue_wait(self.queue, other.fence, value)
            .map_err(|e| self.device_context.handle_native_error(e))
    }

    fn check_fence_value(
        &self,
        value: u64,
    ) -> KilnResult<()> {
        if KilnQueueType::from_fence_value(value) != Some(self.queue_type) {
            return Err(KilnError::PreconditionViolation(format!(
                "Fence value {:#x} was not signaled by a {:?} queue",
                value, self.queue_type
            )));
        }

        Ok(())
    }

    /// Checks the cached completed value first. The cache only moves forward.
    pub fn is_fence_complete(
        &self,
        value: u64,
    ) -> KilnResult<bool> {
        self.check_fence_value(value)?;
        if value <= self.last_completed_value.load(Ordering::Acquire) {
            return Ok(true);
        }

        self.device_context.check_lost()?;
        let completed = self
            .device_context
            .native()
            .fence_completed_value(self.fence)
            .map_err(|e| self.device_context.handle_native_error(e))?;
        let completed = self
            .last_completed_value
            .fetch_max(completed, Ordering::AcqRel)
            .max(completed);
        Ok(value <= completed)
    }

    pub fn fence_status(
        &self,
        value: u64,
    ) -> KilnResult<KilnFenceStatus> {
        if self.is_fence_complete(value)? {
            Ok(KilnFenceStatus::Complete)
        } else if value > self.last_submitted_value() {
            Ok(KilnFenceStatus::Unsubmitted)
        } else {
            Ok(KilnFenceStatus::Incomplete)
        }
    }

    /// Block the calling thread until the GPU passes `value`
    pub fn wait_for_fence(
        &self,
        value: u64,
    ) -> KilnResult<()> {
        if self.is_fence_complete(value)? {
            return Ok(());
        }

        if value > self.last_submitted_value() {
            return Err(KilnError::PreconditionViolation(format!(
                "Fence value {:#x} has not been submitted on the {:?} queue",
                value, self.queue_type
            )));
        }

        profiling::scope!("KilnQueue::wait_for_fence");
        self.device_context
            .native()
            .wait_for_fence(self.fence, value)
            .map_err(|e| self.device_context.handle_native_error(e))?;
        self.last_completed_value.fetch_max(value, Ordering::AcqRel);
        Ok(())
    }

    /// Signal a fresh value and wait for it
    pub fn wait_idle(&self) -> KilnResult<()> {
        let value = self.signal()?;
        self.wait_for_fence(value)
    }

    //
    // Frame pacing, driven by the device
    //

    /// Present everything submitted this frame and signal the fence value for the frame slot. A
    /// failed present marks the device lost instead of failing the frame.
    pub(crate) fn submit_frame(
        &self,
        frame_index: usize,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        for swap_chain in state.pending_presents.drain(..) {
            if let Err(e) = swap_chain.present() {
                log::error!("Present failed on {:?} queue: {}", self.queue_type, e);
                self.device_context.mark_lost();
            }
        }

        if self.device_context.is_lost() {
            return Ok(());
        }

        let value = self.signal_locked(&mut *state)?;
        state.frame_fence_values[frame_index] = value;
        Ok(())
    }

    /// Wait for the last frame that used this frame slot
    pub(crate) fn wait_for_frame_slot(
        &self,
        frame_index: usize,
    ) -> KilnResult<()> {
        if self.device_context.is_lost() {
            return Ok(());
        }

        let value = self.state.lock().unwrap().frame_fence_values[frame_index];
        if value == 0 {
            return Ok(());
        }

        self.wait_for_fence(value)
    }

    /// Recorders used during the finished frame go back to the pool. Their allocators for the new
    /// frame slot are idle.
    pub(crate) fn finish_frame(&self) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state.used_recorders.extend(self.recorder_rx.try_iter());
        state.free_recorders.append(&mut state.used_recorders);
    }

    pub fn pooled_recorder_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.free_recorders.len() + state.used_recorders.len() + self.recorder_rx.len()
    }
}

impl Drop for KilnQueue {
    fn drop(&mut self) {
        let native = self.device_context.native();
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        state.pending_presents.clear();

        let recorders: Vec<_> = state
            .free_recorders
            .drain(..)
            .chain(state.used_recorders.drain(..))
            .chain(self.recorder_rx.try_iter())
            .collect();
        for recorder in recorders {
            recorder.destroy(native);
        }

        native.destroy(self.fence.into());
        native.destroy(self.queue.into());
        log::debug!("Destroyed {:?} queue", self.queue_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_device(deferred_fence_completion: bool) -> KilnDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        KilnDevice::new(&KilnDeviceDef {
            null: KilnNullDeviceDef {
                deferred_fence_completion,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_fence_values_encode_queue_type() {
        let device = create_device(false);
        let compute = device.queue(KilnQueueType::Compute).unwrap();
        let copy = device.queue(KilnQueueType::Copy).unwrap();

        let a = compute.signal().unwrap();
        let b = compute.signal().unwrap();
        assert_eq!(a, (2 << 56) | 1);
        assert!(b > a);
        assert_eq!(KilnQueueType::from_fence_value(b), Some(KilnQueueType::Compute));

        let c = copy.signal().unwrap();
        assert_eq!(c >> crate::FENCE_QUEUE_TYPE_SHIFT, 3);

        assert!(matches!(
            compute.is_fence_complete(c),
            Err(KilnError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_submit_returns_increasing_values() {
        let device = create_device(false);
        let queue = device.queue(KilnQueueType::Graphics).unwrap();

        let mut last = 0;
        for _ in 0..3 {
            let command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
            let value = queue.submit(command_buffer).unwrap();
            assert!(value > last);
            last = value;
        }
    }

    #[test]
    fn test_fence_completes_only_after_wait() {
        let device = create_device(true);
        let queue = device.queue(KilnQueueType::Graphics).unwrap();

        let command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        let value = queue.submit(command_buffer).unwrap();
        assert!(!queue.is_fence_complete(value).unwrap());
        assert_eq!(queue.fence_status(value).unwrap(), KilnFenceStatus::Incomplete);
        assert_eq!(
            queue.fence_status(value + 1).unwrap(),
            KilnFenceStatus::Unsubmitted
        );

        queue.wait_for_fence(value).unwrap();
        assert!(queue.is_fence_complete(value).unwrap());
        assert!(matches!(
            queue.wait_for_fence(value + 1),
            Err(KilnError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_wrong_queue_submit_is_rejected() {
        let device = create_device(false);
        let command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
        let result = device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer);
        assert!(matches!(result, Err(KilnError::PreconditionViolation(_))));
    }

    #[test]
    fn test_dropped_command_buffer_returns_recorder() {
        let device = create_device(false);
        let queue = device.queue(KilnQueueType::Graphics).unwrap();

        let command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        assert_eq!(queue.pooled_recorder_count(), 0);
        drop(command_buffer);
        assert_eq!(queue.pooled_recorder_count(), 1);

        device.commit_frame().unwrap();
        let null = device.null_device().unwrap();
        let live_lists = null.live_object_count(crate::backends::null::NullObjectKind::CommandList);
        let _command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        assert_eq!(
            null.live_object_count(crate::backends::null::NullObjectKind::CommandList),
            live_lists
        );
    }

    #[test]
    fn test_late_submit_keeps_allocator_alive() {
        use crate::backends::null::NullCall;

        let device = create_device(true);
        let queue = device.queue(KilnQueueType::Graphics).unwrap();
        let null = device.null_device().unwrap();

        // Begun in one frame, submitted in the next
        let command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        device.commit_frame().unwrap();
        let value = queue.submit(command_buffer).unwrap();

        // Back on the frame slot the command buffer was begun in. The frame fence waited for
        // here was signaled before the late submit.
        device.commit_frame().unwrap();
        assert!(!queue.is_fence_complete(value).unwrap());

        let start = null.call_count();
        let _command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        let calls = null.calls_since(start);
        let wait = calls
            .iter()
            .position(|x| matches!(x, NullCall::WaitForFence { value: v, .. } if *v == value));
        let reset = calls
            .iter()
            .position(|x| matches!(x, NullCall::ResetCommandAllocator { .. }));
        assert!(wait.is_some());
        assert!(wait < reset);
        assert!(queue.is_fence_complete(value).unwrap());
    }

    #[test]
    fn test_cross_queue_wait() {
        let device = create_device(false);
        let graphics = device.queue(KilnQueueType::Graphics).unwrap();
        let compute = device.queue(KilnQueueType::Compute).unwrap();

        let value = compute.signal().unwrap();
        graphics.wait_for_queue(compute, value).unwrap();
        assert!(matches!(
            graphics.wait_for_queue(compute, graphics.signal().unwrap()),
            Err(KilnError::PreconditionViolation(_))
        ));
    }
}
