use crate::backends::null::NullDevice;
use crate::backends::KilnNativeDevice;
use crate::*;
use std::sync::Arc;

/// Primary entry point to the API. Owns the queues, the copy allocator and the device context
/// that every resource holds a clone of.
///
/// **The device must outlive every object created through it.** Dropping the device waits for
/// the GPU, destroys everything still waiting in the retirement queue and logs any object that is
/// still alive.
pub struct KilnDevice {
    device_context: KilnDeviceContext,
    queues: Vec<Arc<KilnQueue>>,
    copy_allocator: Option<KilnCopyAllocator>,
}

impl std::fmt::Debug for KilnDevice {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnDevice")
            .field("device_context", &self.device_context)
            .field("queues", &self.queues)
            .finish()
    }
}

impl KilnDevice {
    pub fn new(device_def: &KilnDeviceDef) -> KilnResult<Self> {
        device_def.verify()?;

        let native = match device_def.preferred_backend {
            KilnBackendPreference::Default | KilnBackendPreference::Null => {
                KilnNativeDevice::Null(Arc::new(NullDevice::new(&device_def.null)))
            }
            backend => {
                return Err(KilnError::BackendError(format!(
                    "The {:?} backend is not available in this build",
                    backend
                )))
            }
        };

        let device_context = KilnDeviceContext::new(native, device_def)?;
        let device_info = device_context.device_info();
        log::info!(
            "Created {:?} device {:?} on {} (validation: {:?}, barriers: {:?})",
            device_info.backend_type,
            device_def.label,
            device_info.adapter_name,
            device_def.validation_mode,
            device_context.barrier_model()
        );

        let mut queues = Vec::with_capacity(KilnQueueType::ALL.len());
        for &queue_type in KilnQueueType::ALL.iter() {
            if queue_type == KilnQueueType::VideoDecode && !device_info.supports_video_decode {
                continue;
            }

            queues.push(Arc::new(KilnQueue::new(&device_context, queue_type)?));
        }

        let copy_allocator = KilnCopyAllocator::new(&device_context)?;

        Ok(KilnDevice {
            device_context,
            queues,
            copy_allocator: Some(copy_allocator),
        })
    }

    pub fn device_context(&self) -> &KilnDeviceContext {
        &self.device_context
    }

    pub fn device_info(&self) -> &KilnDeviceInfo {
        self.device_context.device_info()
    }

    /// The null backend, for inspecting the native calls a test made
    pub fn null_device(&self) -> Option<&NullDevice> {
        self.device_context.native().null_device()
    }

    pub fn is_lost(&self) -> bool {
        self.device_context.is_lost()
    }

    pub fn frame_count(&self) -> u64 {
        self.device_context.frame_count()
    }

    pub fn frame_index(&self) -> usize {
        self.device_context.frame_index()
    }

    pub fn query_feature_support(
        &self,
        feature: KilnFeature,
    ) -> bool {
        self.device_context.native().supports_feature(feature)
    }

    pub fn query_format_support(
        &self,
        format: KilnFormat,
    ) -> KilnFormatSupport {
        self.device_context.native().format_support(format)
    }

    //
    // Queues
    //

    /// `None` if the device has no queue of this type
    pub fn queue(
        &self,
        queue_type: KilnQueueType,
    ) -> Option<&KilnQueue> {
        self.queues
            .iter()
            .find(|x| x.queue_type() == queue_type)
            .map(|x| &**x)
    }

    fn queue_or_err(
        &self,
        queue_type: KilnQueueType,
    ) -> KilnResult<&Arc<KilnQueue>> {
        self.queues
            .iter()
            .find(|x| x.queue_type() == queue_type)
            .ok_or_else(|| {
                KilnError::ValidationError(format!("The device has no {:?} queue", queue_type))
            })
    }

    pub fn copy_allocator(&self) -> Option<&KilnCopyAllocator> {
        self.copy_allocator.as_ref()
    }

    pub fn begin_command_buffer(
        &self,
        queue_type: KilnQueueType,
    ) -> KilnResult<KilnCommandBuffer> {
        self.queue_or_err(queue_type)?.begin_command_buffer(None)
    }

    pub fn begin_command_buffer_with_label(
        &self,
        queue_type: KilnQueueType,
        label: &str,
    ) -> KilnResult<KilnCommandBuffer> {
        self.queue_or_err(queue_type)?
            .begin_command_buffer(Some(label))
    }

    //
    // Frame pacing
    //

    /// Present and signal every queue, advance to the next frame slot and wait for the GPU to
    /// finish the frame that last used it, then destroy whatever has retired long enough. Returns
    /// the new frame index.
    pub fn commit_frame(&self) -> KilnResult<usize> {
        profiling::scope!("KilnDevice::commit_frame");
        self.device_context.check_lost()?;

        let frame_index = self.device_context.frame_index();
        for queue in &self.queues {
            queue.submit_frame(frame_index)?;
        }

        let frame_count = self.device_context.advance_frame();
        let frame_index = self.device_context.frame_index();
        log::trace!("Committed frame {}, next slot {}", frame_count - 1, frame_index);

        if frame_count >= crate::MAX_FRAMES_IN_FLIGHT as u64 {
            for queue in &self.queues {
                queue.wait_for_frame_slot(frame_index)?;
            }
        }

        for queue in &self.queues {
            queue.finish_frame();
        }

        self.device_context.process_retirement_queue(false);
        Ok(frame_index)
    }

    /// Block until every queue is idle, then destroy everything in the retirement queue
    pub fn wait_idle(&self) -> KilnResult<()> {
        profiling::scope!("KilnDevice::wait_idle");
        if !self.device_context.is_lost() {
            for queue in &self.queues {
                queue.wait_idle()?;
            }
        }

        self.device_context.process_retirement_queue(true);
        Ok(())
    }

    //
    // Resource creation
    //

    pub fn create_buffer(
        &self,
        buffer_def: &KilnBufferDef,
    ) -> KilnResult<KilnBuffer> {
        KilnBuffer::new(&self.device_context, buffer_def)
    }

    /// Create a buffer and fill it. `Upload` buffers are written through their mapping, all others
    /// through the copy allocator.
    pub fn create_buffer_with_data(
        &self,
        buffer_def: &KilnBufferDef,
        data: &[u8],
    ) -> KilnResult<KilnBuffer> {
        if data.len() as u64 > buffer_def.size {
            return Err(KilnError::ValidationError(format!(
                "{} bytes do not fit in a buffer of {} bytes",
                data.len(),
                buffer_def.size
            )));
        }

        let buffer = self.create_buffer(buffer_def)?;
        if buffer_def.memory_type == KilnMemoryType::Upload {
            buffer.write_mapped(0, data)?;
        } else {
            self.copy_allocator_or_err()?
                .upload_buffer(&buffer, 0, data)?;
        }

        Ok(buffer)
    }

    pub fn create_texture(
        &self,
        texture_def: &KilnTextureDef,
    ) -> KilnResult<KilnTexture> {
        KilnTexture::new(&self.device_context, texture_def)
    }

    /// Create a texture and fill every subresource through the copy allocator. The texture is left
    /// in `CopyDest`.
    pub fn create_texture_with_data(
        &self,
        texture_def: &KilnTextureDef,
        data: &[u8],
    ) -> KilnResult<KilnTexture> {
        let texture =
            KilnTexture::new_with_layout(&self.device_context, texture_def, KilnTextureLayout::CopyDest)?;
        self.copy_allocator_or_err()?
            .upload_texture(&texture, data)?;
        Ok(texture)
    }

    fn copy_allocator_or_err(&self) -> KilnResult<&KilnCopyAllocator> {
        self.copy_allocator
            .as_ref()
            .ok_or_else(|| KilnError::StringError("The copy allocator was destroyed".to_string()))
    }

    pub fn create_sampler(
        &self,
        sampler_def: &KilnSamplerDef,
    ) -> KilnResult<KilnSampler> {
        KilnSampler::new(&self.device_context, sampler_def)
    }

    pub fn create_bind_group_layout(
        &self,
        bind_group_layout_def: &KilnBindGroupLayoutDef,
    ) -> KilnResult<KilnBindGroupLayout> {
        KilnBindGroupLayout::new(&self.device_context, bind_group_layout_def)
    }

    pub fn create_bind_group(
        &self,
        bind_group_def: &KilnBindGroupDef,
    ) -> KilnResult<KilnBindGroup> {
        KilnBindGroup::new(&self.device_context, bind_group_def)
    }

    pub fn create_pipeline_layout(
        &self,
        pipeline_layout_def: &KilnPipelineLayoutDef,
    ) -> KilnResult<KilnPipelineLayout> {
        KilnPipelineLayout::new(&self.device_context, pipeline_layout_def)
    }

    pub fn create_render_pipeline(
        &self,
        pipeline_def: &KilnRenderPipelineDef,
    ) -> KilnResult<KilnRenderPipeline> {
        KilnRenderPipeline::new(&self.device_context, pipeline_def)
    }

    pub fn create_compute_pipeline(
        &self,
        pipeline_def: &KilnComputePipelineDef,
    ) -> KilnResult<KilnComputePipeline> {
        KilnComputePipeline::new(&self.device_context, pipeline_def)
    }

    pub fn create_query_heap(
        &self,
        query_heap_def: &KilnQueryHeapDef,
    ) -> KilnResult<KilnQueryHeap> {
        KilnQueryHeap::new(&self.device_context, query_heap_def)
    }

    pub fn create_swap_chain(
        &self,
        surface: &KilnSurface,
        swap_chain_def: &KilnSwapChainDef,
    ) -> KilnResult<KilnSwapChain> {
        let graphics_queue = self.queue_or_err(KilnQueueType::Graphics)?;
        KilnSwapChain::new(&self.device_context, graphics_queue, surface, swap_chain_def)
    }
}

impl Drop for KilnDevice {
    fn drop(&mut self) {
        log::info!("Destroying device");
        if let Err(e) = self.wait_idle() {
            log::error!("Failed to wait for the device to go idle: {}", e);
        }

        self.device_context.begin_shutdown();
        self.copy_allocator = None;
        self.queues.clear();
        self.device_context.process_retirement_queue(true);

        let leaked_count = self.device_context.report_leaks();
        if !std::thread::panicking() {
            debug_assert_eq!(leaked_count, 0, "Objects outlived the device");
        }
    }
}
