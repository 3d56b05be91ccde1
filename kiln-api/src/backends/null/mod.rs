//! A backend that does no GPU work. It keeps enough state to behave like a real device (objects,
//! fences, descriptor heaps, mapped buffer contents, swap chain back buffers) and logs every native
//! call, so the rest of the crate can be driven and observed without a GPU.

mod call;
pub use call::*;

use crate::backends::*;
use crate::*;
use fnv::FnvHashMap;
use std::sync::Mutex;

enum NullObject {
    Queue {
        queue_type: KilnQueueType,
    },
    Fence {
        completed: u64,
        pending: Vec<u64>,
    },
    CommandAllocator,
    CommandList {
        queue_type: KilnQueueType,
        open: bool,
        commands: Vec<KilnNativeCommand>,
    },
    Buffer {
        memory_type: KilnMemoryType,
        size: u64,
        // Device-local buffers get storage on the first copy into them
        data: Vec<u8>,
    },
    Texture,
    Sampler,
    BindGroupLayout,
    RootSignature,
    Pipeline,
    QueryHeap,
    DescriptorHeap {
        capacity: u32,
        shader_visible: bool,
        descriptors: FnvHashMap<u32, KilnNativeDescriptor>,
    },
    SwapChain {
        back_buffers: Vec<NullObjectId>,
        current_back_buffer: u32,
    },
    BackBuffer,
}

impl NullObject {
    fn kind(&self) -> NullObjectKind {
        match self {
            NullObject::Queue { .. } => NullObjectKind::Queue,
            NullObject::Fence { .. } => NullObjectKind::Fence,
            NullObject::CommandAllocator => NullObjectKind::CommandAllocator,
            NullObject::CommandList { .. } => NullObjectKind::CommandList,
            NullObject::Buffer { .. } => NullObjectKind::Buffer,
            NullObject::Texture => NullObjectKind::Texture,
            NullObject::Sampler => NullObjectKind::Sampler,
            NullObject::BindGroupLayout => NullObjectKind::BindGroupLayout,
            NullObject::RootSignature => NullObjectKind::RootSignature,
            NullObject::Pipeline => NullObjectKind::Pipeline,
            NullObject::QueryHeap => NullObjectKind::QueryHeap,
            NullObject::DescriptorHeap { .. } => NullObjectKind::DescriptorHeap,
            NullObject::SwapChain { .. } => NullObjectKind::SwapChain,
            NullObject::BackBuffer => NullObjectKind::BackBuffer,
        }
    }
}

struct NullDeviceState {
    next_object_id: NullObjectId,
    objects: FnvHashMap<NullObjectId, NullObject>,
    calls: Vec<NullCall>,
    validation_errors: Vec<String>,
    fail_next_create: Option<String>,
    fail_next_present: bool,
    removed: bool,
}

impl NullDeviceState {
    fn report(
        &mut self,
        message: String,
    ) {
        log::error!("null device: {}", message);
        self.validation_errors.push(message);
    }

    fn check_create(&mut self) -> KilnResult<()> {
        if self.removed {
            return Err(KilnError::DeviceLost);
        }

        if let Some(message) = self.fail_next_create.take() {
            return Err(KilnError::BackendError(message));
        }

        Ok(())
    }

    fn insert(
        &mut self,
        object: NullObject,
    ) -> NullObjectId {
        let id = self.next_object_id;
        self.next_object_id += 1;
        self.calls.push(NullCall::CreateObject {
            id,
            kind: object.kind(),
        });
        self.objects.insert(id, object);
        id
    }

    fn remove(
        &mut self,
        id: NullObjectId,
    ) {
        match self.objects.remove(&id) {
            Some(object) => {
                self.calls.push(NullCall::DestroyObject {
                    id,
                    kind: object.kind(),
                });

                if let NullObject::SwapChain { back_buffers, .. } = object {
                    for back_buffer in back_buffers {
                        self.remove(back_buffer);
                    }
                }
            }
            None => self.report(format!("destroyed object {} which does not exist", id)),
        }
    }

    fn check_alive(
        &mut self,
        resource: &KilnNativeResource,
        usage: &str,
    ) {
        if let Some(id) = resource.null_id() {
            if !self.objects.contains_key(&id) {
                self.report(format!("{} references destroyed resource {}", usage, id));
            }
        }
    }

    fn create_back_buffers(
        &mut self,
        count: u32,
    ) -> Vec<NullObjectId> {
        (0..count)
            .map(|_| self.insert(NullObject::BackBuffer))
            .collect()
    }
}

fn null_id(id: Option<NullObjectId>) -> NullObjectId {
    id.unwrap_or(0)
}

/// The null backend's device. Reachable through `KilnDevice::null_device()` for inspection.
pub struct NullDevice {
    def: KilnNullDeviceDef,
    state: Mutex<NullDeviceState>,
    device_removed_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl NullDevice {
    pub fn new(def: &KilnNullDeviceDef) -> Self {
        NullDevice {
            def: def.clone(),
            state: Mutex::new(NullDeviceState {
                next_object_id: 1,
                objects: Default::default(),
                calls: Default::default(),
                validation_errors: Default::default(),
                fail_next_create: None,
                fail_next_present: false,
                removed: false,
            }),
            device_removed_callbacks: Default::default(),
        }
    }

    //
    // Inspection and fault injection
    //

    /// Every native call made so far
    pub fn calls(&self) -> Vec<NullCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Calls made after the first `start` calls
    pub fn calls_since(
        &self,
        start: usize,
    ) -> Vec<NullCall> {
        let state = self.state.lock().unwrap();
        state.calls[start.min(state.calls.len())..].to_vec()
    }

    /// Misuse that a native debug layer would have flagged
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.lock().unwrap().validation_errors.clone()
    }

    pub fn is_object_alive(
        &self,
        id: NullObjectId,
    ) -> bool {
        self.state.lock().unwrap().objects.contains_key(&id)
    }

    pub fn live_object_count(
        &self,
        kind: NullObjectKind,
    ) -> usize {
        self.state
            .lock()
            .unwrap()
            .objects
            .values()
            .filter(|x| x.kind() == kind)
            .count()
    }

    pub fn descriptor(
        &self,
        heap: KilnNativeDescriptorHeap,
        index: u32,
    ) -> Option<KilnNativeDescriptor> {
        let state = self.state.lock().unwrap();
        match state.objects.get(&null_id(heap.null_id())) {
            Some(NullObject::DescriptorHeap { descriptors, .. }) => descriptors.get(&index).cloned(),
            _ => None,
        }
    }

    /// Contents of any buffer, including device-local ones
    pub fn buffer_contents(
        &self,
        resource: KilnNativeResource,
    ) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match state.objects.get(&null_id(resource.null_id())) {
            Some(NullObject::Buffer { size, data, .. }) => {
                let mut contents = data.clone();
                contents.resize(*size as usize, 0);
                Some(contents)
            }
            _ => None,
        }
    }

    /// The next create call fails with `KilnError::BackendError`
    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next_create =
            Some("injected native creation failure".to_string());
    }

    /// The next present fails as if the device had been removed
    pub fn fail_next_present(&self) {
        self.state.lock().unwrap().fail_next_present = true;
    }

    /// Every fence value signaled so far completes
    pub fn complete_pending_work(&self) {
        let mut state = self.state.lock().unwrap();
        for object in state.objects.values_mut() {
            if let NullObject::Fence { completed, pending } = object {
                if let Some(max_pending) = pending.iter().copied().max() {
                    *completed = (*completed).max(max_pending);
                }
                pending.clear();
            }
        }
    }

    /// Simulate the GPU being removed. Registered callbacks fire before this returns.
    pub fn trigger_device_removed(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.removed {
                return;
            }
            state.removed = true;
        }

        log::error!("null device: device removed");
        for callback in &*self.device_removed_callbacks.lock().unwrap() {
            (callback)();
        }
    }

    //
    // Device
    //
    pub(crate) fn adapter_name(&self) -> String {
        "Null Device".to_string()
    }

    pub(crate) fn timestamp_frequency(&self) -> u64 {
        1_000_000_000
    }

    pub(crate) fn supports_feature(
        &self,
        feature: KilnFeature,
    ) -> bool {
        match feature {
            KilnFeature::EnhancedBarriers => self.def.enhanced_barriers,
            KilnFeature::VideoDecode => self.def.video_decode,
            _ => self.def.features.contains(&feature),
        }
    }

    pub(crate) fn format_support(
        &self,
        format: KilnFormat,
    ) -> KilnFormatSupport {
        if format.is_undefined() {
            KilnFormatSupport::NONE
        } else if format.is_depth_stencil() {
            KilnFormatSupport::DEPTH_STENCIL
                | KilnFormatSupport::SHADER_READ
                | KilnFormatSupport::MULTISAMPLE
        } else if format.is_compressed() {
            if self.supports_feature(KilnFeature::TextureCompressionBC) {
                KilnFormatSupport::SHADER_READ
            } else {
                KilnFormatSupport::NONE
            }
        } else {
            KilnFormatSupport::SHADER_READ
                | KilnFormatSupport::SHADER_WRITE
                | KilnFormatSupport::RENDER_TARGET
                | KilnFormatSupport::BLENDABLE
                | KilnFormatSupport::MULTISAMPLE
                | KilnFormatSupport::VERTEX_BUFFER
        }
    }

    pub(crate) fn set_device_removed_callback(
        &self,
        callback: Box<dyn Fn() + Send + Sync>,
    ) {
        self.device_removed_callbacks.lock().unwrap().push(callback);
    }

    pub(crate) fn destroy(
        &self,
        object: KilnNativeObject,
    ) {
        let mut state = self.state.lock().unwrap();
        state.remove(null_id(object.null_id()));
    }

    //
    // Queues and synchronization
    //
    pub(crate) fn create_queue(
        &self,
        queue_type: KilnQueueType,
    ) -> KilnResult<KilnNativeQueue> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        if queue_type == KilnQueueType::VideoDecode && !self.def.video_decode {
            return Err(KilnError::BackendError(
                "video decode queues are not supported".to_string(),
            ));
        }

        Ok(KilnNativeQueue::Null(
            state.insert(NullObject::Queue { queue_type }),
        ))
    }

    pub(crate) fn create_fence(
        &self,
        initial_value: u64,
    ) -> KilnResult<KilnNativeFence> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeFence::Null(state.insert(NullObject::Fence {
            completed: initial_value,
            pending: Vec::default(),
        })))
    }

    pub(crate) fn fence_completed_value(
        &self,
        fence: KilnNativeFence,
    ) -> KilnResult<u64> {
        let state = self.state.lock().unwrap();
        if state.removed {
            // Fences report all bits set once the device is gone
            return Ok(u64::MAX);
        }

        match state.objects.get(&null_id(fence.null_id())) {
            Some(NullObject::Fence { completed, .. }) => Ok(*completed),
            _ => Err(KilnError::BackendError(format!(
                "{:?} is not a live fence",
                fence
            ))),
        }
    }

    pub(crate) fn wait_for_fence(
        &self,
        fence: KilnNativeFence,
        value: u64,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        let fence_id = null_id(fence.null_id());
        state.calls.push(NullCall::WaitForFence {
            fence: fence_id,
            value,
        });

        if state.removed {
            return Ok(());
        }

        let never_signaled = match state.objects.get_mut(&fence_id) {
            Some(NullObject::Fence { completed, pending }) => {
                if *completed >= value {
                    false
                } else if let Some(reached) = pending.iter().copied().filter(|x| *x >= value).min()
                {
                    // The GPU finishes work in order, so everything signaled before is done too
                    *completed = reached;
                    pending.retain(|x| *x > reached);
                    false
                } else {
                    true
                }
            }
            _ => {
                return Err(KilnError::BackendError(format!(
                    "{:?} is not a live fence",
                    fence
                )))
            }
        };

        if never_signaled {
            let message = format!(
                "waiting for fence value {:#x} that was never signaled would block forever",
                value
            );
            state.report(message.clone());
            return Err(KilnError::BackendError(message));
        }

        Ok(())
    }

    pub(crate) fn execute_command_lists(
        &self,
        queue: KilnNativeQueue,
        command_lists: &[KilnNativeCommandList],
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        let queue_id = null_id(queue.null_id());
        let ids: Vec<_> = command_lists.iter().map(|x| null_id(x.null_id())).collect();
        state.calls.push(NullCall::ExecuteCommandLists {
            queue: queue_id,
            command_lists: ids.clone(),
        });

        if state.removed {
            return Err(KilnError::DeviceLost);
        }

        let queue_type = match state.objects.get(&queue_id) {
            Some(NullObject::Queue { queue_type }) => *queue_type,
            _ => return Err(KilnError::BackendError(format!("{:?} is not a queue", queue))),
        };

        let mut copies = Vec::default();
        let mut errors = Vec::default();
        for id in ids {
            match state.objects.get(&id) {
                Some(NullObject::CommandList {
                    queue_type: list_type,
                    open,
                    commands,
                }) => {
                    if *open {
                        errors.push(format!("executed command list {} while it is open", id));
                    }
                    if *list_type != queue_type {
                        errors.push(format!(
                            "executed a {:?} command list on a {:?} queue",
                            list_type, queue_type
                        ));
                    }
                    copies.extend(commands.iter().filter_map(|x| match x {
                        KilnNativeCommand::CopyBufferRegion {
                            dst,
                            dst_offset,
                            src,
                            src_offset,
                            size,
                        } => Some((*dst, *dst_offset, *src, *src_offset, *size)),
                        _ => None,
                    }));
                }
                _ => errors.push(format!("executed {} which is not a command list", id)),
            }
        }

        for error in errors {
            state.report(error);
        }

        // Buffer copies are applied so uploads can be observed
        for (dst, dst_offset, src, src_offset, size) in copies {
            let bytes = match state.objects.get(&null_id(src.null_id())) {
                Some(NullObject::Buffer {
                    size: src_size,
                    data,
                    ..
                }) if src_offset + size <= *src_size => {
                    let range = src_offset as usize..(src_offset + size) as usize;
                    Some(data.get(range).map(|x| x.to_vec()).unwrap_or_else(|| {
                        // Never written, so it reads back as zeros
                        vec![0; size as usize]
                    }))
                }
                _ => None,
            };

            if let (
                Some(bytes),
                Some(NullObject::Buffer {
                    size: dst_size,
                    data,
                    ..
                }),
            ) = (bytes, state.objects.get_mut(&null_id(dst.null_id())))
            {
                let range = dst_offset as usize..(dst_offset as usize + bytes.len());
                if range.end as u64 <= *dst_size {
                    if data.is_empty() {
                        data.resize(*dst_size as usize, 0);
                    }
                    data[range].copy_from_slice(&bytes);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn queue_signal(
        &self,
        queue: KilnNativeQueue,
        fence: KilnNativeFence,
        value: u64,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        let fence_id = null_id(fence.null_id());
        state.calls.push(NullCall::Signal {
            queue: null_id(queue.null_id()),
            fence: fence_id,
            value,
        });

        if state.removed {
            return Err(KilnError::DeviceLost);
        }

        let deferred = self.def.deferred_fence_completion;
        match state.objects.get_mut(&fence_id) {
            Some(NullObject::Fence { completed, pending }) => {
                if deferred {
                    pending.push(value);
                } else {
                    *completed = (*completed).max(value);
                }
                Ok(())
            }
            _ => Err(KilnError::BackendError(format!(
                "{:?} is not a live fence",
                fence
            ))),
        }
    }

    pub(crate) fn queue_wait(
        &self,
        queue: KilnNativeQueue,
        fence: KilnNativeFence,
        value: u64,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NullCall::QueueWait {
            queue: null_id(queue.null_id()),
            fence: null_id(fence.null_id()),
            value,
        });

        if state.removed {
            return Err(KilnError::DeviceLost);
        }

        Ok(())
    }

    //
    // Command recording
    //
    pub(crate) fn create_command_allocator(
        &self,
        _queue_type: KilnQueueType,
    ) -> KilnResult<KilnNativeCommandAllocator> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeCommandAllocator::Null(
            state.insert(NullObject::CommandAllocator),
        ))
    }

    pub(crate) fn reset_command_allocator(
        &self,
        allocator: KilnNativeCommandAllocator,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(NullCall::ResetCommandAllocator {
            allocator: null_id(allocator.null_id()),
        });
        Ok(())
    }

    pub(crate) fn create_command_list(
        &self,
        queue_type: KilnQueueType,
    ) -> KilnResult<KilnNativeCommandList> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeCommandList::Null(state.insert(
            NullObject::CommandList {
                queue_type,
                open: false,
                commands: Vec::default(),
            },
        )))
    }

    pub(crate) fn reset_command_list(
        &self,
        command_list: KilnNativeCommandList,
        allocator: KilnNativeCommandAllocator,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        let list_id = null_id(command_list.null_id());
        state.calls.push(NullCall::ResetCommandList {
            command_list: list_id,
            allocator: null_id(allocator.null_id()),
        });

        let was_open = match state.objects.get_mut(&list_id) {
            Some(NullObject::CommandList { open, commands, .. }) => {
                let was_open = *open;
                *open = true;
                commands.clear();
                was_open
            }
            _ => {
                return Err(KilnError::BackendError(format!(
                    "{:?} is not a command list",
                    command_list
                )))
            }
        };

        if was_open {
            state.report(format!("reset command list {} while it is open", list_id));
        }

        Ok(())
    }

    pub(crate) fn close_command_list(
        &self,
        command_list: KilnNativeCommandList,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        let list_id = null_id(command_list.null_id());
        state.calls.push(NullCall::CloseCommandList {
            command_list: list_id,
        });

        let was_open = match state.objects.get_mut(&list_id) {
            Some(NullObject::CommandList { open, .. }) => std::mem::replace(open, false),
            _ => false,
        };

        if !was_open {
            state.report(format!("closed command list {} which is not open", list_id));
        }

        Ok(())
    }

    pub(crate) fn record(
        &self,
        command_list: KilnNativeCommandList,
        command: KilnNativeCommand,
    ) {
        let mut state = self.state.lock().unwrap();
        let list_id = null_id(command_list.null_id());

        match &command {
            KilnNativeCommand::ResourceBarriers(barriers) => {
                for barrier in barriers {
                    match barrier {
                        KilnNativeBarrier::Transition { resource, .. }
                        | KilnNativeBarrier::Texture { resource, .. }
                        | KilnNativeBarrier::Buffer { resource, .. } => {
                            state.check_alive(resource, "barrier")
                        }
                        KilnNativeBarrier::UnorderedAccess {
                            resource: Some(resource),
                        } => state.check_alive(resource, "barrier"),
                        _ => {}
                    }
                }
            }
            KilnNativeCommand::CopyBufferRegion { dst, src, .. }
            | KilnNativeCommand::CopyBufferToTexture { dst, src, .. } => {
                state.check_alive(dst, "copy");
                state.check_alive(src, "copy");
            }
            _ => {}
        }

        let recorded = match state.objects.get_mut(&list_id) {
            Some(NullObject::CommandList { open, commands, .. }) if *open => {
                commands.push(command.clone());
                true
            }
            _ => false,
        };

        if !recorded {
            state.report(format!(
                "recorded {:?} into command list {} which is not open",
                command, list_id
            ));
        }

        state.calls.push(NullCall::Record {
            command_list: list_id,
            command,
        });
    }

    //
    // Resources
    //
    pub(crate) fn create_buffer(
        &self,
        buffer_def: &KilnBufferDef,
        _initial_state: KilnResourceState,
    ) -> KilnResult<KilnNativeResource> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        let data = if buffer_def.memory_type.is_cpu_visible() {
            vec![0; buffer_def.size as usize]
        } else {
            Vec::new()
        };

        Ok(KilnNativeResource::Null(state.insert(NullObject::Buffer {
            memory_type: buffer_def.memory_type,
            size: buffer_def.size,
            data,
        })))
    }

    pub(crate) fn create_texture(
        &self,
        _texture_def: &KilnTextureDef,
        _initial_state: KilnResourceState,
    ) -> KilnResult<KilnNativeResource> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeResource::Null(state.insert(NullObject::Texture)))
    }

    pub(crate) fn write_mapped(
        &self,
        resource: KilnNativeResource,
        offset: u64,
        bytes: &[u8],
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        let id = null_id(resource.null_id());
        state.calls.push(NullCall::WriteMapped {
            resource: id,
            offset,
            size: bytes.len() as u64,
        });

        match state.objects.get_mut(&id) {
            Some(NullObject::Buffer {
                memory_type,
                data,
                ..
            }) if memory_type.is_cpu_visible() => {
                let range = offset as usize..offset as usize + bytes.len();
                if range.end > data.len() {
                    return Err(KilnError::BackendError(format!(
                        "mapped write {:?} is outside of a {} byte buffer",
                        range,
                        data.len()
                    )));
                }
                data[range].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(KilnError::BackendError(format!(
                "{:?} is not a mapped buffer",
                resource
            ))),
        }
    }

    pub(crate) fn read_mapped(
        &self,
        resource: KilnNativeResource,
        offset: u64,
        length: u64,
    ) -> KilnResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        match state.objects.get(&null_id(resource.null_id())) {
            Some(NullObject::Buffer {
                memory_type,
                data,
                ..
            }) if memory_type.is_cpu_visible() => data
                .get(offset as usize..(offset + length) as usize)
                .map(|x| x.to_vec())
                .ok_or_else(|| {
                    KilnError::BackendError(format!(
                        "mapped read at {} of {} bytes is outside of a {} byte buffer",
                        offset,
                        length,
                        data.len()
                    ))
                }),
            _ => Err(KilnError::BackendError(format!(
                "{:?} is not a mapped buffer",
                resource
            ))),
        }
    }

    pub(crate) fn create_sampler(
        &self,
        _sampler_def: &KilnSamplerDef,
    ) -> KilnResult<KilnNativeSampler> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeSampler::Null(state.insert(NullObject::Sampler)))
    }

    pub(crate) fn create_bind_group_layout(
        &self,
        _bind_group_layout_def: &KilnBindGroupLayoutDef,
    ) -> KilnResult<KilnNativeBindGroupLayout> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeBindGroupLayout::Null(
            state.insert(NullObject::BindGroupLayout),
        ))
    }

    pub(crate) fn create_root_signature(
        &self,
        _desc: &KilnNativeRootSignatureDesc,
    ) -> KilnResult<KilnNativeRootSignature> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeRootSignature::Null(
            state.insert(NullObject::RootSignature),
        ))
    }

    pub(crate) fn create_render_pipeline(
        &self,
        _root_signature: KilnNativeRootSignature,
        _pipeline_def: &KilnRenderPipelineDef,
    ) -> KilnResult<KilnNativePipeline> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativePipeline::Null(state.insert(NullObject::Pipeline)))
    }

    pub(crate) fn create_compute_pipeline(
        &self,
        _root_signature: KilnNativeRootSignature,
        _pipeline_def: &KilnComputePipelineDef,
    ) -> KilnResult<KilnNativePipeline> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativePipeline::Null(state.insert(NullObject::Pipeline)))
    }

    pub(crate) fn create_query_heap(
        &self,
        _query_heap_def: &KilnQueryHeapDef,
    ) -> KilnResult<KilnNativeQueryHeap> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeQueryHeap::Null(state.insert(NullObject::QueryHeap)))
    }

    //
    // Descriptors
    //
    pub(crate) fn create_descriptor_heap(
        &self,
        _heap_type: KilnDescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> KilnResult<KilnNativeDescriptorHeap> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        Ok(KilnNativeDescriptorHeap::Null(state.insert(
            NullObject::DescriptorHeap {
                capacity,
                shader_visible,
                descriptors: Default::default(),
            },
        )))
    }

    pub(crate) fn write_descriptor(
        &self,
        heap: KilnNativeDescriptorHeap,
        index: u32,
        descriptor: &KilnNativeDescriptor,
    ) {
        let mut state = self.state.lock().unwrap();
        let heap_id = null_id(heap.null_id());
        state.calls.push(NullCall::WriteDescriptor {
            heap: heap_id,
            index,
            descriptor: descriptor.clone(),
        });

        let error = match state.objects.get_mut(&heap_id) {
            Some(NullObject::DescriptorHeap {
                capacity,
                descriptors,
                ..
            }) => {
                if index < *capacity {
                    descriptors.insert(index, descriptor.clone());
                    None
                } else {
                    Some(format!(
                        "descriptor write at {} is outside heap {} of capacity {}",
                        index, heap_id, capacity
                    ))
                }
            }
            _ => Some(format!("{} is not a descriptor heap", heap_id)),
        };

        if let Some(error) = error {
            state.report(error);
        }
    }

    pub(crate) fn copy_descriptors(
        &self,
        dst_heap: KilnNativeDescriptorHeap,
        dst_index: u32,
        src_heap: KilnNativeDescriptorHeap,
        src_index: u32,
        count: u32,
    ) {
        let mut state = self.state.lock().unwrap();
        let dst_id = null_id(dst_heap.null_id());
        let src_id = null_id(src_heap.null_id());
        state.calls.push(NullCall::CopyDescriptors {
            dst_heap: dst_id,
            dst_index,
            src_heap: src_id,
            src_index,
            count,
        });

        let copied: Result<Vec<_>, String> = match state.objects.get(&src_id) {
            Some(NullObject::DescriptorHeap {
                capacity,
                shader_visible,
                descriptors,
            }) => {
                if *shader_visible {
                    Err(format!("copied descriptors out of shader-visible heap {}", src_id))
                } else if src_index + count > *capacity {
                    Err(format!("descriptor copy source is outside heap {}", src_id))
                } else {
                    Ok((0..count)
                        .map(|i| (dst_index + i, descriptors.get(&(src_index + i)).cloned()))
                        .collect())
                }
            }
            _ => Err(format!("{} is not a descriptor heap", src_id)),
        };

        let error = match (copied, state.objects.get_mut(&dst_id)) {
            (
                Ok(copied),
                Some(NullObject::DescriptorHeap {
                    capacity,
                    descriptors,
                    ..
                }),
            ) => {
                if dst_index + count > *capacity {
                    Some(format!("descriptor copy destination is outside heap {}", dst_id))
                } else {
                    for (index, descriptor) in copied {
                        match descriptor {
                            Some(descriptor) => descriptors.insert(index, descriptor),
                            None => descriptors.remove(&index),
                        };
                    }
                    None
                }
            }
            (Ok(_), _) => Some(format!("{} is not a descriptor heap", dst_id)),
            (Err(error), _) => Some(error),
        };

        if let Some(error) = error {
            state.report(error);
        }
    }

    //
    // Presentation
    //
    pub(crate) fn create_swap_chain(
        &self,
        _queue: KilnNativeQueue,
        surface: &KilnSurfaceHandle,
        swap_chain_def: &KilnSwapChainDef,
    ) -> KilnResult<KilnNativeSwapChain> {
        let mut state = self.state.lock().unwrap();
        state.check_create()?;
        log::debug!("null device: creating swap chain for {:?}", surface);

        let back_buffers =
            state.create_back_buffers(swap_chain_def.present_mode.back_buffer_count());
        Ok(KilnNativeSwapChain::Null(state.insert(
            NullObject::SwapChain {
                back_buffers,
                current_back_buffer: 0,
            },
        )))
    }

    pub(crate) fn swap_chain_back_buffers(
        &self,
        swap_chain: KilnNativeSwapChain,
    ) -> KilnResult<Vec<KilnNativeResource>> {
        let state = self.state.lock().unwrap();
        match state.objects.get(&null_id(swap_chain.null_id())) {
            Some(NullObject::SwapChain { back_buffers, .. }) => Ok(back_buffers
                .iter()
                .map(|x| KilnNativeResource::Null(*x))
                .collect()),
            _ => Err(KilnError::BackendError(format!(
                "{:?} is not a swap chain",
                swap_chain
            ))),
        }
    }

    pub(crate) fn resize_swap_chain(
        &self,
        swap_chain: KilnNativeSwapChain,
        width: u32,
        height: u32,
    ) -> KilnResult<()> {
        let mut state = self.state.lock().unwrap();
        let id = null_id(swap_chain.null_id());
        state.calls.push(NullCall::ResizeSwapChain {
            swap_chain: id,
            width,
            height,
        });

        if state.removed {
            return Err(KilnError::DeviceLost);
        }

        let old_back_buffers = match state.objects.get_mut(&id) {
            Some(NullObject::SwapChain {
                back_buffers,
                current_back_buffer,
            }) => {
                *current_back_buffer = 0;
                std::mem::replace(back_buffers, Vec::default())
            }
            _ => {
                return Err(KilnError::BackendError(format!(
                    "{:?} is not a swap chain",
                    swap_chain
                )))
            }
        };

        let count = old_back_buffers.len() as u32;
        for back_buffer in old_back_buffers {
            state.remove(back_buffer);
        }

        let new_back_buffers = state.create_back_buffers(count);
        if let Some(NullObject::SwapChain { back_buffers, .. }) = state.objects.get_mut(&id) {
            *back_buffers = new_back_buffers;
        }

        Ok(())
    }

    pub(crate) fn current_back_buffer_index(
        &self,
        swap_chain: KilnNativeSwapChain,
    ) -> u32 {
        let state = self.state.lock().unwrap();
        match state.objects.get(&null_id(swap_chain.null_id())) {
            Some(NullObject::SwapChain {
                current_back_buffer,
                ..
            }) => *current_back_buffer,
            _ => 0,
        }
    }

    pub(crate) fn present(
        &self,
        swap_chain: KilnNativeSwapChain,
        sync_interval: u32,
    ) -> KilnResult<()> {
        let removed_now = {
            let mut state = self.state.lock().unwrap();
            let id = null_id(swap_chain.null_id());
            state.calls.push(NullCall::Present {
                swap_chain: id,
                sync_interval,
            });

            if state.removed {
                return Err(KilnError::DeviceLost);
            }

            if state.fail_next_present {
                state.fail_next_present = false;
                true
            } else {
                if let Some(NullObject::SwapChain {
                    back_buffers,
                    current_back_buffer,
                }) = state.objects.get_mut(&id)
                {
                    *current_back_buffer = (*current_back_buffer + 1) % back_buffers.len() as u32;
                }
                false
            }
        };

        if removed_now {
            self.trigger_device_removed();
            return Err(KilnError::DeviceLost);
        }

        Ok(())
    }
}
