use crate::backends::{KilnNativeDevice, KilnNativeObject};
use crate::barrier::KilnBarrierModel;
use crate::descriptor_heap::{KilnDescriptorHeap, KilnViewDescriptorAllocator};
use crate::*;
use kiln_base::slab::{GenSlab, GenSlabKey};
use kiln_base::RetirementQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type KilnObjectKey = GenSlabKey<KilnNativeObject>;

/// Something handed to the retirement queue. It is destroyed or released once the GPU can no
/// longer be using it.
#[derive(Debug)]
pub enum KilnRetiredItem {
    /// A native object owned by the arena
    Object(KilnObjectKey),
    /// A native object that is not in the arena, such as a descriptor heap replaced by growth
    NativeObject(KilnNativeObject),
    Descriptors {
        heap: KilnDescriptorHeapType,
        first: u32,
        count: u32,
    },
    ViewDescriptor {
        heap: KilnDescriptorHeapType,
        index: u32,
    },
}

pub struct KilnDeviceContextInner {
    native: KilnNativeDevice,
    device_info: KilnDeviceInfo,
    barrier_model: KilnBarrierModel,
    objects: Mutex<GenSlab<KilnNativeObject>>,
    retirement_queue: Mutex<RetirementQueue<KilnRetiredItem>>,
    frame_count: AtomicU64,
    lost: Arc<AtomicBool>,
    shutting_down: AtomicBool,

    resource_heap: KilnDescriptorHeap,
    sampler_heap: KilnDescriptorHeap,
    render_target_views: KilnViewDescriptorAllocator,
    depth_stencil_views: KilnViewDescriptorAllocator,

    #[cfg(debug_assertions)]
    #[cfg(feature = "track-device-contexts")]
    object_backtraces: Mutex<fnv::FnvHashMap<u32, backtrace::Backtrace>>,
}

/// State shared by the device and every object created from it. Cheap to clone.
#[derive(Clone)]
pub struct KilnDeviceContext {
    pub(crate) inner: Arc<KilnDeviceContextInner>,
}

impl std::fmt::Debug for KilnDeviceContext {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter,
    ) -> std::fmt::Result {
        f.debug_struct("KilnDeviceContext")
            .field("backend_type", &self.inner.device_info.backend_type)
            .field("frame_count", &self.frame_count())
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl KilnDeviceContext {
    pub(crate) fn new(
        native: KilnNativeDevice,
        device_def: &KilnDeviceDef,
    ) -> KilnResult<Self> {
        let heap_def = &device_def.descriptor_heaps;
        let supports_enhanced_barriers = native.supports_feature(KilnFeature::EnhancedBarriers);
        let barrier_model = if supports_enhanced_barriers {
            KilnBarrierModel::Enhanced
        } else {
            KilnBarrierModel::Legacy
        };

        let device_info = KilnDeviceInfo {
            backend_type: native.backend_type(),
            adapter_name: native.adapter_name(),
            max_bind_groups: crate::MAX_BIND_GROUPS as u32,
            max_barrier_batch: crate::MAX_BARRIER_BATCH as u32,
            resource_heap_capacity: heap_def.resource_capacity,
            sampler_heap_capacity: heap_def.sampler_capacity,
            min_constant_buffer_offset_alignment: 256,
            upload_texture_alignment: 512,
            upload_texture_row_alignment: 256,
            timestamp_frequency: native.timestamp_frequency(),
            supports_enhanced_barriers,
            supports_video_decode: native.supports_feature(KilnFeature::VideoDecode),
        };

        let resource_heap = KilnDescriptorHeap::new(
            &native,
            KilnDescriptorHeapType::Resource,
            heap_def.resource_capacity,
            heap_def.overflow_policy,
        )?;
        let sampler_heap = KilnDescriptorHeap::new(
            &native,
            KilnDescriptorHeapType::Sampler,
            heap_def.sampler_capacity,
            heap_def.overflow_policy,
        )?;
        let render_target_views = KilnViewDescriptorAllocator::new(
            &native,
            KilnDescriptorHeapType::RenderTarget,
            heap_def.render_target_block_size,
        );
        let depth_stencil_views = KilnViewDescriptorAllocator::new(
            &native,
            KilnDescriptorHeapType::DepthStencil,
            heap_def.depth_stencil_block_size,
        );

        let lost = Arc::new(AtomicBool::new(false));
        let lost_clone = lost.clone();
        native.set_device_removed_callback(Box::new(move || {
            log::error!("The native device was removed");
            lost_clone.store(true, Ordering::Release);
        }));

        let inner = KilnDeviceContextInner {
            native,
            device_info,
            barrier_model,
            objects: Default::default(),
            retirement_queue: Mutex::new(RetirementQueue::new(crate::MAX_FRAMES_IN_FLIGHT as u64)),
            frame_count: AtomicU64::new(0),
            lost,
            shutting_down: AtomicBool::new(false),
            resource_heap,
            sampler_heap,
            render_target_views,
            depth_stencil_views,

            #[cfg(debug_assertions)]
            #[cfg(feature = "track-device-contexts")]
            object_backtraces: Default::default(),
        };

        Ok(KilnDeviceContext {
            inner: Arc::new(inner),
        })
    }

    pub fn native(&self) -> &KilnNativeDevice {
        &self.inner.native
    }

    pub fn device_info(&self) -> &KilnDeviceInfo {
        &self.inner.device_info
    }

    pub fn barrier_model(&self) -> KilnBarrierModel {
        self.inner.barrier_model
    }

    pub fn resource_heap(&self) -> &KilnDescriptorHeap {
        &self.inner.resource_heap
    }

    pub fn sampler_heap(&self) -> &KilnDescriptorHeap {
        &self.inner.sampler_heap
    }

    pub fn descriptor_heap(
        &self,
        heap_type: KilnDescriptorHeapType,
    ) -> Option<&KilnDescriptorHeap> {
        match heap_type {
            KilnDescriptorHeapType::Resource => Some(&self.inner.resource_heap),
            KilnDescriptorHeapType::Sampler => Some(&self.inner.sampler_heap),
            _ => None,
        }
    }

    pub fn view_descriptor_allocator(
        &self,
        heap_type: KilnDescriptorHeapType,
    ) -> Option<&KilnViewDescriptorAllocator> {
        match heap_type {
            KilnDescriptorHeapType::RenderTarget => Some(&self.inner.render_target_views),
            KilnDescriptorHeapType::DepthStencil => Some(&self.inner.depth_stencil_views),
            _ => None,
        }
    }

    //
    // Frame counter and device loss
    //
    pub fn frame_count(&self) -> u64 {
        self.inner.frame_count.load(Ordering::Acquire)
    }

    pub fn frame_index(&self) -> usize {
        (self.frame_count() % crate::MAX_FRAMES_IN_FLIGHT as u64) as usize
    }

    /// Returns the new frame count
    pub(crate) fn advance_frame(&self) -> u64 {
        self.inner.frame_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        if !self.inner.lost.swap(true, Ordering::AcqRel) {
            log::error!("Device lost");
        }
    }

    pub fn check_lost(&self) -> KilnResult<()> {
        if self.is_lost() {
            Err(KilnError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Map a native error onto the device state. A lost device stays lost.
    pub(crate) fn handle_native_error(
        &self,
        error: KilnError,
    ) -> KilnError {
        if error.is_device_lost() {
            self.mark_lost();
        }
        error
    }

    /// Run a native creation call on a device that is not lost
    pub(crate) fn create_native<T, F: FnOnce(&KilnNativeDevice) -> KilnResult<T>>(
        &self,
        f: F,
    ) -> KilnResult<T> {
        self.check_lost()?;
        (f)(&self.inner.native).map_err(|e| self.handle_native_error(e))
    }

    //
    // Arena and retirement
    //
    pub(crate) fn register_object(
        &self,
        object: KilnNativeObject,
    ) -> KilnObjectKey {
        let key = self.inner.objects.lock().unwrap().allocate(object);

        #[cfg(debug_assertions)]
        #[cfg(feature = "track-device-contexts")]
        {
            self.inner
                .object_backtraces
                .lock()
                .unwrap()
                .insert(key.index(), backtrace::Backtrace::new_unresolved());
        }

        key
    }

    pub fn native_object(
        &self,
        key: &KilnObjectKey,
    ) -> Option<KilnNativeObject> {
        self.inner.objects.lock().unwrap().get(key).copied()
    }

    pub fn live_object_count(&self) -> usize {
        self.inner.objects.lock().unwrap().count()
    }

    pub fn retired_item_count(&self) -> usize {
        self.inner.retirement_queue.lock().unwrap().len()
    }

    /// Stamp the item with the current frame count. During shutdown the item is destroyed
    /// immediately.
    pub(crate) fn retire(
        &self,
        item: KilnRetiredItem,
    ) {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            self.destroy_retired_item(item);
            return;
        }

        let mut retirement_queue = self.inner.retirement_queue.lock().unwrap();
        // Read the frame count under the lock so stamps are pushed in order
        let frame_count = self.frame_count();
        log::trace!("Retiring {:?} at frame {}", item, frame_count);
        retirement_queue.retire(item, frame_count);
    }

    /// Allocate from a shader-visible heap pair. Heaps replaced by growth are retired.
    pub(crate) fn allocate_descriptors(
        &self,
        heap_type: KilnDescriptorHeapType,
        count: u32,
    ) -> KilnResult<u32> {
        let heap = self.descriptor_heap(heap_type).ok_or_else(|| {
            KilnError::StringError(format!("{:?} is not a shader-visible heap", heap_type))
        })?;

        let allocation = heap.allocate(count)?;
        for replaced_heap in allocation.replaced_heaps {
            self.retire(KilnRetiredItem::NativeObject(replaced_heap.into()));
        }

        Ok(allocation.first)
    }

    /// Destroy everything that has waited long enough, or everything if `force` is set.
    /// Destruction happens outside of the queue's lock.
    pub(crate) fn process_retirement_queue(
        &self,
        force: bool,
    ) {
        profiling::scope!("process_retirement_queue");
        let ready = {
            let mut retirement_queue = self.inner.retirement_queue.lock().unwrap();
            if force {
                retirement_queue.take_all()
            } else {
                retirement_queue.take_ready(self.frame_count())
            }
        };

        if !ready.is_empty() {
            log::trace!(
                "Destroying {} retired items at frame {}",
                ready.len(),
                self.frame_count()
            );
        }

        for item in ready {
            self.destroy_retired_item(item);
        }
    }

    fn destroy_retired_item(
        &self,
        item: KilnRetiredItem,
    ) {
        match item {
            KilnRetiredItem::Object(key) => {
                let object = self.inner.objects.lock().unwrap().free(&key);

                #[cfg(debug_assertions)]
                #[cfg(feature = "track-device-contexts")]
                {
                    self.inner
                        .object_backtraces
                        .lock()
                        .unwrap()
                        .remove(&key.index());
                }

                self.inner.native.destroy(object);
            }
            KilnRetiredItem::NativeObject(object) => self.inner.native.destroy(object),
            KilnRetiredItem::Descriptors { heap, first, count } => {
                let result = match self.descriptor_heap(heap) {
                    Some(descriptor_heap) => descriptor_heap.release(first, count),
                    None => Err(KilnError::StringError(format!(
                        "{:?} is not a shader-visible heap",
                        heap
                    ))),
                };

                if let Err(e) = result {
                    log::error!("Failed to release retired descriptors: {}", e);
                }
            }
            KilnRetiredItem::ViewDescriptor { heap, index } => {
                let result = match self.view_descriptor_allocator(heap) {
                    Some(allocator) => allocator.release(index),
                    None => Err(KilnError::StringError(format!(
                        "{:?} is not a view descriptor heap",
                        heap
                    ))),
                };

                if let Err(e) = result {
                    log::error!("Failed to release retired view descriptor: {}", e);
                }
            }
        }
    }

    /// Objects disposed after this point are destroyed immediately
    pub(crate) fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
    }

    /// Log every arena object that is still alive. Returns how many there were.
    pub(crate) fn report_leaks(&self) -> usize {
        let retired_count = self.retired_item_count();
        if retired_count > 0 {
            log::error!(
                "{} retired items were never destroyed",
                retired_count
            );
        }

        let objects = self.inner.objects.lock().unwrap();
        let leaked_count = objects.count();
        if leaked_count > 0 {
            log::error!(
                "{} objects were still alive when the device was destroyed",
                leaked_count
            );

            for (key, object) in objects.iter() {
                log::error!("  Leaked {:?} ({:?})", object, key);

                #[cfg(debug_assertions)]
                #[cfg(feature = "track-device-contexts")]
                {
                    if let Some(backtrace) = self
                        .inner
                        .object_backtraces
                        .lock()
                        .unwrap()
                        .get(&key.index())
                    {
                        let mut backtrace = backtrace.clone();
                        backtrace.resolve();
                        log::error!("  Created at:\n{:?}", backtrace);
                    }
                }
            }
        }

        leaked_count + retired_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::NullDevice;
    use crate::backends::KilnNativeResource;

    fn create_context() -> (Arc<NullDevice>, KilnDeviceContext) {
        let _ = env_logger::builder().is_test(true).try_init();
        let null = Arc::new(NullDevice::new(&Default::default()));
        let context =
            KilnDeviceContext::new(KilnNativeDevice::Null(null.clone()), &Default::default())
                .unwrap();
        (null, context)
    }

    fn create_buffer(
        null: &NullDevice,
        context: &KilnDeviceContext,
    ) -> (KilnNativeResource, KilnObjectKey) {
        let def = KilnBufferDef {
            size: 16,
            ..Default::default()
        };
        let resource = null.create_buffer(&def, KilnResourceState::COMMON).unwrap();
        let key = context.register_object(resource.into());
        (resource, key)
    }

    #[test]
    fn test_retired_object_waits_for_frames_in_flight() {
        let (null, context) = create_context();
        let (resource, key) = create_buffer(&null, &context);
        let id = resource.null_id().unwrap();

        context.retire(KilnRetiredItem::Object(key));
        context.process_retirement_queue(false);
        assert!(null.is_object_alive(id));

        context.advance_frame();
        context.process_retirement_queue(false);
        assert!(null.is_object_alive(id));

        context.advance_frame();
        context.process_retirement_queue(false);
        assert!(!null.is_object_alive(id));
        assert!(context.native_object(&key).is_none());
        assert_eq!(context.live_object_count(), 0);
    }

    #[test]
    fn test_force_processing_destroys_everything() {
        let (null, context) = create_context();
        let (resource, key) = create_buffer(&null, &context);

        context.retire(KilnRetiredItem::Object(key));
        context.process_retirement_queue(true);
        assert!(!null.is_object_alive(resource.null_id().unwrap()));
        assert_eq!(context.report_leaks(), 0);
    }

    #[test]
    fn test_shutdown_destroys_immediately() {
        let (null, context) = create_context();
        let (resource, key) = create_buffer(&null, &context);

        context.begin_shutdown();
        context.retire(KilnRetiredItem::Object(key));
        assert!(!null.is_object_alive(resource.null_id().unwrap()));
        assert_eq!(context.retired_item_count(), 0);
    }

    #[test]
    fn test_leaks_are_reported() {
        let (null, context) = create_context();
        let (_resource, key) = create_buffer(&null, &context);
        assert_eq!(context.report_leaks(), 1);

        context.retire(KilnRetiredItem::Object(key));
        context.process_retirement_queue(true);
        assert_eq!(context.report_leaks(), 0);
    }

    #[test]
    fn test_removed_callback_marks_lost() {
        let (null, context) = create_context();
        assert!(context.check_lost().is_ok());
        null.trigger_device_removed();
        assert!(context.is_lost());
        assert!(matches!(context.check_lost(), Err(KilnError::DeviceLost)));
    }

    #[test]
    fn test_retired_descriptors_are_released_later() {
        let (_null, context) = create_context();
        let first = context
            .allocate_descriptors(KilnDescriptorHeapType::Resource, 4)
            .unwrap();
        assert_eq!(context.resource_heap().allocated_count(), 4);

        context.retire(KilnRetiredItem::Descriptors {
            heap: KilnDescriptorHeapType::Resource,
            first,
            count: 4,
        });
        context.advance_frame();
        context.process_retirement_queue(false);
        assert_eq!(context.resource_heap().allocated_count(), 4);

        context.advance_frame();
        context.process_retirement_queue(false);
        assert_eq!(context.resource_heap().allocated_count(), 0);
    }
}
