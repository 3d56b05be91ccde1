//! Resource state tracking and barrier batching.
//!
//! Textures track a layout per subresource and buffers track a set of buffer states. A request to
//! move a resource into the state it is already in records nothing, unless that state is unordered
//! access, which gets a UAV barrier. Everything else is appended to a batch that is flushed as a
//! single native call when it fills up, when the caller forces it, and before the command list is
//! closed.
//!
//! Two encodings sit behind the same calls. The legacy model has a single state per resource and
//! an explicit UAV barrier for write-after-write hazards. The enhanced model describes every
//! transition with sync, access and layout on both sides.

use crate::backends::{
    KilnNativeBarrier, KilnNativeCommand, KilnNativeCommandList, KilnNativeDevice,
    KilnNativeResource,
};
use crate::*;

/// Which barrier encoding the device uses. Picked once from `KilnFeature::EnhancedBarriers`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KilnBarrierModel {
    Legacy,
    Enhanced,
}

/// The part of a texture a barrier applies to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KilnSubresource {
    All,
    Single { mip_level: u32, array_layer: u32 },
}

impl Default for KilnSubresource {
    fn default() -> Self {
        KilnSubresource::All
    }
}

/// What a resource was last asked to be in, and the legacy native state that request produced.
/// The native state depends on the queue that recorded the transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct KilnTrackedState<T> {
    pub(crate) requested: T,
    pub(crate) native: KilnResourceState,
}

impl<T> KilnTrackedState<T> {
    pub(crate) fn new(
        requested: T,
        native: KilnResourceState,
    ) -> Self {
        KilnTrackedState { requested, native }
    }
}

pub struct KilnBarrierTracker {
    model: KilnBarrierModel,
    queue_type: KilnQueueType,
    pending: Vec<KilnNativeBarrier>,
}

impl KilnBarrierTracker {
    pub fn new(
        model: KilnBarrierModel,
        queue_type: KilnQueueType,
    ) -> Self {
        KilnBarrierTracker {
            model,
            queue_type,
            pending: Vec::with_capacity(crate::MAX_BARRIER_BATCH),
        }
    }

    pub fn model(&self) -> KilnBarrierModel {
        self.model
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop anything not yet flushed. Used when a recorder is reset.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn validate_state(
        &self,
        state: KilnResourceState,
        what: &dyn std::fmt::Debug,
    ) -> KilnResult<()> {
        if state.is_valid_for_queue(self.queue_type) {
            Ok(())
        } else {
            Err(KilnError::ValidationError(format!(
                "{:?} ({:?}) cannot be used on a {:?} queue",
                what, state, self.queue_type
            )))
        }
    }

    fn push(
        &mut self,
        native: &KilnNativeDevice,
        command_list: KilnNativeCommandList,
        barrier: KilnNativeBarrier,
    ) {
        self.pending.push(barrier);
        if self.pending.len() >= crate::MAX_BARRIER_BATCH {
            self.commit(native, command_list);
        }
    }

    /// Record every pending barrier as a single native call
    pub fn commit(
        &mut self,
        native: &KilnNativeDevice,
        command_list: KilnNativeCommandList,
    ) {
        if self.pending.is_empty() {
            return;
        }

        let barriers = std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(crate::MAX_BARRIER_BATCH),
        );
        native.record(command_list, KilnNativeCommand::ResourceBarriers(barriers));
    }

    // None when the subresource is already in the requested state
    fn texture_transition(
        &self,
        resource: KilnNativeResource,
        subresource: Option<u32>,
        old: KilnTrackedState<KilnTextureLayout>,
        new: KilnTrackedState<KilnTextureLayout>,
    ) -> Option<KilnNativeBarrier> {
        match self.model {
            KilnBarrierModel::Legacy => {
                // Different layouts with the same native state only need the tracking update
                if old.native != new.native {
                    Some(KilnNativeBarrier::Transition {
                        resource,
                        subresource,
                        state_before: old.native,
                        state_after: new.native,
                    })
                } else {
                    None
                }
            }
            KilnBarrierModel::Enhanced => {
                if old.requested != new.requested {
                    Some(KilnNativeBarrier::Texture {
                        resource,
                        subresource,
                        before: old.requested.to_layout_sync(),
                        after: new.requested.to_layout_sync(),
                    })
                } else {
                    None
                }
            }
        }
    }

    /// Move a texture, or one of its subresources, into `new_layout`. Both the state the texture
    /// is in and the requested one must be usable on this queue. Nothing is tracked or recorded
    /// if either is not.
    pub fn texture_barrier(
        &mut self,
        native: &KilnNativeDevice,
        command_list: KilnNativeCommandList,
        texture: &KilnTexture,
        new_layout: KilnTextureLayout,
        subresource: KilnSubresource,
        force_commit: bool,
    ) -> KilnResult<()> {
        let state_after = new_layout.to_resource_state(self.queue_type);
        self.validate_state(state_after, &new_layout)?;

        let texture_def = texture.texture_def();
        let target = match subresource {
            KilnSubresource::All => None,
            KilnSubresource::Single {
                mip_level,
                array_layer,
            } => {
                if mip_level >= texture_def.mip_count
                    || array_layer >= texture_def.array_layer_count()
                {
                    return Err(KilnError::ValidationError(format!(
                        "Subresource mip {} layer {} is out of range for texture {:?}",
                        mip_level, array_layer, texture_def.label
                    )));
                }

                Some(texture_def.subresource_index(mip_level, array_layer))
            }
        };

        let resource = texture.native_resource();
        let mut layouts = texture.layouts();
        let transitions: Vec<_> = match target {
            Some(index) => vec![(Some(index), layouts[index as usize])],
            None => {
                let first = layouts[0];
                if layouts.iter().all(|x| *x == first) {
                    vec![(None, first)]
                } else {
                    layouts
                        .iter()
                        .enumerate()
                        .map(|(index, old)| (Some(index as u32), *old))
                        .collect()
                }
            }
        };

        for (_, old) in &transitions {
            self.validate_state(old.native, &old.requested)?;
        }

        let new = KilnTrackedState::new(new_layout, state_after);
        let mut barriers = Vec::default();
        let mut uav_hazard = false;
        for (subresource, old) in transitions {
            match self.texture_transition(resource, subresource, old, new) {
                Some(barrier) => barriers.push(barrier),
                None => {
                    uav_hazard |= old.requested == KilnTextureLayout::UnorderedAccess
                        && new_layout == KilnTextureLayout::UnorderedAccess
                }
            }
        }

        // Unordered access to unordered access still orders the writes
        if uav_hazard {
            barriers.push(self.unordered_access_barrier(Some(resource)));
        }

        match target {
            Some(index) => layouts[index as usize] = new,
            None => {
                for layout in layouts.iter_mut() {
                    *layout = new;
                }
            }
        }
        drop(layouts);

        for barrier in barriers {
            self.push(native, command_list, barrier);
        }

        if force_commit {
            self.commit(native, command_list);
        }

        Ok(())
    }

    pub fn buffer_barrier(
        &mut self,
        native: &KilnNativeDevice,
        command_list: KilnNativeCommandList,
        buffer: &KilnBuffer,
        new_states: KilnBufferStates,
        force_commit: bool,
    ) -> KilnResult<()> {
        // Mapped buffers stay in the state they were created in
        if buffer.buffer_def().memory_type.is_cpu_visible() {
            return Ok(());
        }

        let state_after = new_states.to_resource_state(self.queue_type);
        self.validate_state(state_after, &new_states)?;

        let resource = buffer.native_resource();
        let mut tracked = buffer.tracked_states();
        let old = *tracked;
        self.validate_state(old.native, &old.requested)?;

        let transition = match self.model {
            KilnBarrierModel::Legacy => {
                if old.native != state_after {
                    Some(KilnNativeBarrier::Transition {
                        resource,
                        subresource: None,
                        state_before: old.native,
                        state_after,
                    })
                } else {
                    None
                }
            }
            KilnBarrierModel::Enhanced => {
                if old.requested != new_states {
                    let (sync_before, access_before) = old.requested.to_sync_access();
                    let (sync_after, access_after) = new_states.to_sync_access();
                    Some(KilnNativeBarrier::Buffer {
                        resource,
                        sync_before,
                        sync_after,
                        access_before,
                        access_after,
                    })
                } else {
                    None
                }
            }
        };

        let barrier = match transition {
            Some(barrier) => Some(barrier),
            None if old.requested.contains(KilnBufferStates::SHADER_WRITE)
                && new_states.contains(KilnBufferStates::SHADER_WRITE) =>
            {
                Some(self.unordered_access_barrier(Some(resource)))
            }
            None => None,
        };

        *tracked = KilnTrackedState::new(new_states, state_after);
        drop(tracked);

        if let Some(barrier) = barrier {
            self.push(native, command_list, barrier);
        }

        if force_commit {
            self.commit(native, command_list);
        }

        Ok(())
    }

    fn unordered_access_barrier(
        &self,
        resource: Option<KilnNativeResource>,
    ) -> KilnNativeBarrier {
        match self.model {
            KilnBarrierModel::Legacy => KilnNativeBarrier::UnorderedAccess { resource },
            KilnBarrierModel::Enhanced => KilnNativeBarrier::Global {
                sync_before: KilnBarrierSync::ALL_SHADING,
                sync_after: KilnBarrierSync::ALL_SHADING,
                access_before: KilnBarrierAccess::UNORDERED_ACCESS,
                access_after: KilnBarrierAccess::UNORDERED_ACCESS,
            },
        }
    }

    /// Order unordered-access writes before later unordered-access reads or writes. `None` covers
    /// every resource.
    pub fn uav_barrier(
        &mut self,
        native: &KilnNativeDevice,
        command_list: KilnNativeCommandList,
        resource: Option<KilnNativeResource>,
        force_commit: bool,
    ) {
        let barrier = self.unordered_access_barrier(resource);
        self.push(native, command_list, barrier);

        if force_commit {
            self.commit(native, command_list);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::NullCall;

    fn create_device(enhanced_barriers: bool) -> KilnDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        KilnDevice::new(&KilnDeviceDef {
            null: KilnNullDeviceDef {
                enhanced_barriers,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    fn create_texture(
        device: &KilnDevice,
        mip_count: u32,
    ) -> KilnTexture {
        device
            .create_texture(&KilnTextureDef {
                format: KilnFormat::R8G8B8A8Unorm,
                extents: KilnExtents3D {
                    width: 64,
                    height: 64,
                    depth_or_array_layers: 1,
                },
                mip_count,
                usage: KilnTextureUsage::SHADER_READ | KilnTextureUsage::RENDER_TARGET,
                ..Default::default()
            })
            .unwrap()
    }

    fn barrier_batches(calls: &[NullCall]) -> Vec<usize> {
        calls.iter().filter_map(|x| x.barrier_count()).collect()
    }

    #[test]
    fn test_shader_resource_render_target_round_trip_queues_two_barriers() {
        let device = create_device(false);
        let texture = create_texture(&device, 1);
        texture.set_layout(KilnTextureLayout::ShaderResource);

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::RenderTarget)
            .unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::ShaderResource)
            .unwrap();
        assert_eq!(command_buffer.pending_barrier_count(), 2);

        let null = device.null_device().unwrap();
        let start = null.call_count();
        command_buffer.commit_barriers().unwrap();
        assert_eq!(barrier_batches(&null.calls_since(start)), vec![2]);
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_redundant_barrier_records_nothing() {
        let device = create_device(false);
        let texture = create_texture(&device, 1);

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::CopyDest)
            .unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::CopyDest)
            .unwrap();
        assert_eq!(command_buffer.pending_barrier_count(), 1);
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_render_target_on_compute_queue_is_rejected() {
        let device = create_device(false);
        let texture = create_texture(&device, 1);
        let layouts_before = texture.subresource_layouts();

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
        let null = device.null_device().unwrap();
        let start = null.call_count();
        let result = command_buffer.texture_barrier_with_options(
            &texture,
            KilnTextureLayout::RenderTarget,
            KilnSubresource::All,
            true,
        );

        assert!(matches!(result, Err(KilnError::ValidationError(_))));
        assert!(null.calls_since(start).is_empty());
        assert_eq!(texture.subresource_layouts(), layouts_before);
        device.queue(KilnQueueType::Compute).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_mixed_subresources_emit_one_barrier_each() {
        let device = create_device(false);
        let texture = create_texture(&device, 3);
        texture.set_layout(KilnTextureLayout::ShaderResource);

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer
            .texture_barrier_with_options(
                &texture,
                KilnTextureLayout::CopyDest,
                KilnSubresource::Single {
                    mip_level: 1,
                    array_layer: 0,
                },
                false,
            )
            .unwrap();
        assert_eq!(command_buffer.pending_barrier_count(), 1);

        // The mips disagree, so each one gets its own entry
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::CopySource)
            .unwrap();
        assert_eq!(command_buffer.pending_barrier_count(), 4);
        assert_eq!(
            texture.subresource_layouts(),
            vec![KilnTextureLayout::CopySource; 3]
        );
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_out_of_range_subresource_is_rejected() {
        let device = create_device(false);
        let texture = create_texture(&device, 1);
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        let result = command_buffer.texture_barrier_with_options(
            &texture,
            KilnTextureLayout::CopyDest,
            KilnSubresource::Single {
                mip_level: 1,
                array_layer: 0,
            },
            false,
        );
        assert!(matches!(result, Err(KilnError::ValidationError(_))));
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_batch_flushes_when_full() {
        let device = create_device(false);
        let textures: Vec<_> = (0..crate::MAX_BARRIER_BATCH + 1)
            .map(|_| create_texture(&device, 1))
            .collect();

        let null = device.null_device().unwrap();
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        let start = null.call_count();
        for texture in &textures {
            command_buffer
                .texture_barrier(texture, KilnTextureLayout::CopyDest)
                .unwrap();
        }

        assert_eq!(
            barrier_batches(&null.calls_since(start)),
            vec![crate::MAX_BARRIER_BATCH]
        );
        assert_eq!(command_buffer.pending_barrier_count(), 1);
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_legacy_same_state_layouts_skip_native_barrier() {
        let device = create_device(false);
        let texture = create_texture(&device, 1);
        texture.set_layout(KilnTextureLayout::Undefined);

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        // Undefined and Present are both COMMON
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::Present)
            .unwrap();
        assert_eq!(command_buffer.pending_barrier_count(), 0);
        assert_eq!(
            texture.subresource_layouts(),
            vec![KilnTextureLayout::Present]
        );
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_enhanced_barrier_carries_layouts() {
        let device = create_device(true);
        let texture = create_texture(&device, 1);
        texture.set_layout(KilnTextureLayout::Undefined);

        let null = device.null_device().unwrap();
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        let start = null.call_count();
        command_buffer
            .texture_barrier_with_options(
                &texture,
                KilnTextureLayout::RenderTarget,
                KilnSubresource::All,
                true,
            )
            .unwrap();

        let calls = null.calls_since(start);
        let command = calls.iter().find_map(|x| x.recorded_command()).unwrap();
        match command {
            KilnNativeCommand::ResourceBarriers(barriers) => match &barriers[0] {
                KilnNativeBarrier::Texture { before, after, .. } => {
                    assert_eq!(before.layout, KilnBarrierLayout::Undefined);
                    assert_eq!(before.access, KilnBarrierAccess::NO_ACCESS);
                    assert_eq!(after.layout, KilnBarrierLayout::RenderTarget);
                    assert_eq!(after.sync, KilnBarrierSync::RENDER_TARGET);
                }
                x => panic!("unexpected barrier {:?}", x),
            },
            x => panic!("unexpected command {:?}", x),
        }
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();
    }

    fn create_storage_texture(device: &KilnDevice) -> KilnTexture {
        let texture = device
            .create_texture(&KilnTextureDef {
                format: KilnFormat::R8G8B8A8Unorm,
                extents: KilnExtents3D {
                    width: 64,
                    height: 64,
                    depth_or_array_layers: 1,
                },
                usage: KilnTextureUsage::SHADER_READ
                    | KilnTextureUsage::SHADER_WRITE
                    | KilnTextureUsage::RENDER_TARGET,
                ..Default::default()
            })
            .unwrap();
        texture.set_layout(KilnTextureLayout::Undefined);
        texture
    }

    fn pending_barriers(
        device: &KilnDevice,
        command_buffer: &mut KilnCommandBuffer,
    ) -> Vec<KilnNativeBarrier> {
        let null = device.null_device().unwrap();
        let start = null.call_count();
        command_buffer.commit_barriers().unwrap();
        null.calls_since(start)
            .iter()
            .filter_map(|x| match x.recorded_command() {
                Some(KilnNativeCommand::ResourceBarriers(barriers)) => Some(barriers.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_texture_uav_to_uav_orders_writes() {
        for enhanced_barriers in [false, true].iter() {
            let device = create_device(*enhanced_barriers);
            let texture = create_storage_texture(&device);
            let resource = texture.native_resource();

            let mut command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
            command_buffer
                .texture_barrier(&texture, KilnTextureLayout::UnorderedAccess)
                .unwrap();
            command_buffer
                .texture_barrier(&texture, KilnTextureLayout::UnorderedAccess)
                .unwrap();
            assert_eq!(command_buffer.pending_barrier_count(), 2);

            let barriers = pending_barriers(&device, &mut command_buffer);
            match (&barriers[1], *enhanced_barriers) {
                (KilnNativeBarrier::UnorderedAccess { resource: Some(x) }, false) => {
                    assert_eq!(*x, resource)
                }
                (KilnNativeBarrier::Global { access_after, .. }, true) => {
                    assert_eq!(*access_after, KilnBarrierAccess::UNORDERED_ACCESS)
                }
                x => panic!("unexpected barrier {:?}", x),
            }
            device.queue(KilnQueueType::Compute).unwrap().submit(command_buffer).unwrap();
        }
    }

    #[test]
    fn test_compute_queue_rejects_graphics_only_current_state() {
        let device = create_device(false);
        let texture = create_storage_texture(&device);

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::RenderTarget)
            .unwrap();
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();

        let null = device.null_device().unwrap();
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
        let start = null.call_count();
        let result = command_buffer.texture_barrier_with_options(
            &texture,
            KilnTextureLayout::UnorderedAccess,
            KilnSubresource::All,
            true,
        );

        assert!(matches!(result, Err(KilnError::ValidationError(_))));
        assert!(null.calls_since(start).is_empty());
        assert_eq!(
            texture.subresource_layouts(),
            vec![KilnTextureLayout::RenderTarget]
        );
        device.queue(KilnQueueType::Compute).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_shader_resource_state_follows_recording_queue() {
        let device = create_device(false);
        let texture = create_storage_texture(&device);

        // Compute can only make it visible to non-pixel shaders
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::ShaderResource)
            .unwrap();
        let barriers = pending_barriers(&device, &mut command_buffer);
        match &barriers[0] {
            KilnNativeBarrier::Transition { state_after, .. } => {
                assert_eq!(*state_after, KilnResourceState::NON_PIXEL_SHADER_RESOURCE)
            }
            x => panic!("unexpected barrier {:?}", x),
        }
        device.queue(KilnQueueType::Compute).unwrap().submit(command_buffer).unwrap();

        // Same layout, but pixel shaders need the wider state
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer
            .texture_barrier(&texture, KilnTextureLayout::ShaderResource)
            .unwrap();
        let barriers = pending_barriers(&device, &mut command_buffer);
        assert_eq!(barriers.len(), 1);
        match &barriers[0] {
            KilnNativeBarrier::Transition {
                state_before,
                state_after,
                ..
            } => {
                assert_eq!(*state_before, KilnResourceState::NON_PIXEL_SHADER_RESOURCE);
                assert_eq!(*state_after, KilnResourceState::SHADER_RESOURCE);
            }
            x => panic!("unexpected barrier {:?}", x),
        }
        device.queue(KilnQueueType::Graphics).unwrap().submit(command_buffer).unwrap();

        // Pixel shader visibility is not a state the compute queue can leave
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
        assert!(matches!(
            command_buffer.texture_barrier(&texture, KilnTextureLayout::UnorderedAccess),
            Err(KilnError::ValidationError(_))
        ));
        device.queue(KilnQueueType::Compute).unwrap().submit(command_buffer).unwrap();
    }

    #[test]
    fn test_buffer_uav_to_uav_always_barriers() {
        let device = create_device(false);
        let buffer = device
            .create_buffer(&KilnBufferDef {
                size: 256,
                usage: KilnBufferUsage::SHADER_WRITE,
                ..Default::default()
            })
            .unwrap();

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
        command_buffer
            .buffer_barrier(&buffer, KilnBufferStates::SHADER_WRITE)
            .unwrap();
        command_buffer
            .buffer_barrier(&buffer, KilnBufferStates::SHADER_WRITE)
            .unwrap();
        assert_eq!(command_buffer.pending_barrier_count(), 2);

        assert!(matches!(
            command_buffer.buffer_barrier(&buffer, KilnBufferStates::VERTEX),
            Err(KilnError::ValidationError(_))
        ));
        device.queue(KilnQueueType::Compute).unwrap().submit(command_buffer).unwrap();
    }
}
