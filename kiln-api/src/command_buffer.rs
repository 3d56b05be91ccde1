use crate::backends::{KilnNativeCommand, KilnNativeCommandList};
use crate::queue::KilnCommandRecorder;
use crate::*;
use crossbeam_channel::Sender;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum KilnPassKind {
    None,
    Render,
    Compute,
}

// Bind groups and layout of one binding point (graphics or compute)
#[derive(Default)]
struct KilnBindingState {
    pipeline_layout: Option<KilnPipelineLayout>,
    bind_groups: [Option<KilnBindGroup>; crate::MAX_BIND_GROUPS],
    dirty: u32,
}

impl KilnBindingState {
    fn mark_all_dirty(&mut self) {
        self.dirty = (1u32 << crate::MAX_BIND_GROUPS) - 1;
    }
}

struct KilnPendingResolve {
    src: KilnTexture,
    src_mip_level: u32,
    src_array_layer: u32,
    dst: KilnTexture,
    dst_mip_level: u32,
    dst_array_layer: u32,
}

/// Records commands for one queue. Obtained from `KilnQueue::begin_command_buffer` and consumed
/// by `KilnQueue::submit`.
///
/// Every recording call fails with `KilnError::PreconditionViolation` after `end()`, and nothing
/// reaches the native command list in that case. Draws are only valid inside a render pass,
/// dispatches inside a compute pass, and copies and barriers outside of any pass.
pub struct KilnCommandBuffer {
    device_context: KilnDeviceContext,
    queue_type: KilnQueueType,
    recorder: Option<KilnCommandRecorder>,
    command_list: KilnNativeCommandList,
    recorder_tx: Sender<KilnCommandRecorder>,
    ended: bool,
    pass: KilnPassKind,
    barrier_tracker: KilnBarrierTracker,
    label_pushed: bool,
    pass_label_pushed: bool,
    debug_group_depth: u32,
    heap_generations: Option<(u32, u32)>,
    graphics: KilnBindingState,
    compute: KilnBindingState,
    render_pipeline: Option<KilnRenderPipeline>,
    compute_pipeline: Option<KilnComputePipeline>,
    index_buffer_bound: bool,
    pending_resolves: Vec<KilnPendingResolve>,
    pending_presents: Vec<KilnSwapChain>,
}

impl std::fmt::Debug for KilnCommandBuffer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("KilnCommandBuffer")
            .field("queue_type", &self.queue_type)
            .field("command_list", &self.command_list)
            .field("ended", &self.ended)
            .field("pass", &self.pass)
            .finish()
    }
}

impl KilnCommandBuffer {
    pub(crate) fn new(
        device_context: &KilnDeviceContext,
        queue_type: KilnQueueType,
        recorder: KilnCommandRecorder,
        recorder_tx: Sender<KilnCommandRecorder>,
        label: Option<&str>,
    ) -> Self {
        let command_list = recorder.command_list();
        let mut command_buffer = KilnCommandBuffer {
            device_context: device_context.clone(),
            queue_type,
            recorder: Some(recorder),
            command_list,
            recorder_tx,
            ended: false,
            pass: KilnPassKind::None,
            barrier_tracker: KilnBarrierTracker::new(device_context.barrier_model(), queue_type),
            label_pushed: false,
            pass_label_pushed: false,
            debug_group_depth: 0,
            heap_generations: None,
            graphics: Default::default(),
            compute: Default::default(),
            render_pipeline: None,
            compute_pipeline: None,
            index_buffer_bound: false,
            pending_resolves: Vec::default(),
            pending_presents: Vec::default(),
        };

        if queue_type != KilnQueueType::Copy && queue_type != KilnQueueType::VideoDecode {
            command_buffer.bind_descriptor_heaps();
        }

        if let Some(label) = label {
            command_buffer.record(KilnNativeCommand::BeginEvent(label.to_string()));
            command_buffer.label_pushed = true;
        }

        command_buffer
    }

    pub fn queue_type(&self) -> KilnQueueType {
        self.queue_type
    }

    pub fn native_command_list(&self) -> KilnNativeCommandList {
        self.command_list
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn record(
        &self,
        command: KilnNativeCommand,
    ) {
        self.device_context.native().record(self.command_list, command);
    }

    //
    // Precondition checks
    //
    fn check_recording(
        &self,
        operation: &str,
    ) -> KilnResult<()> {
        if self.ended {
            return Err(KilnError::PreconditionViolation(format!(
                "{} called after the command buffer was ended",
                operation
            )));
        }

        self.device_context.check_lost()
    }

    fn check_pass(
        &self,
        operation: &str,
        expected: KilnPassKind,
    ) -> KilnResult<()> {
        self.check_recording(operation)?;
        if self.pass != expected {
            let message = match expected {
                KilnPassKind::None => format!("{} is not allowed inside a {:?} pass", operation, self.pass),
                _ => format!("{} is only allowed inside a {:?} pass", operation, expected),
            };
            return Err(KilnError::PreconditionViolation(message));
        }

        Ok(())
    }

    fn check_graphics_queue(
        &self,
        operation: &str,
    ) -> KilnResult<()> {
        if self.queue_type != KilnQueueType::Graphics {
            return Err(KilnError::PreconditionViolation(format!(
                "{} requires a graphics queue, this command buffer is for a {:?} queue",
                operation, self.queue_type
            )));
        }

        Ok(())
    }

    fn check_compute_queue(
        &self,
        operation: &str,
    ) -> KilnResult<()> {
        match self.queue_type {
            KilnQueueType::Graphics | KilnQueueType::Compute => Ok(()),
            _ => Err(KilnError::PreconditionViolation(format!(
                "{} requires a graphics or compute queue, this command buffer is for a {:?} queue",
                operation, self.queue_type
            ))),
        }
    }

    //
    // Descriptor heaps and bind groups
    //
    fn bind_descriptor_heaps(&mut self) {
        let (resource_heap, resource_generation) =
            self.device_context.resource_heap().shader_visible_heap();
        let (sampler_heap, sampler_generation) =
            self.device_context.sampler_heap().shader_visible_heap();
        let generations = (resource_generation, sampler_generation);
        if self.heap_generations == Some(generations) {
            return;
        }

        if self.heap_generations.is_some() {
            log::trace!("Descriptor heaps were replaced, rebinding them");
            self.graphics.mark_all_dirty();
            self.compute.mark_all_dirty();
        }

        self.record(KilnNativeCommand::SetDescriptorHeaps {
            resource_heap,
            sampler_heap,
        });
        self.heap_generations = Some(generations);
    }

    pub fn set_render_pipeline(
        &mut self,
        pipeline: &KilnRenderPipeline,
    ) -> KilnResult<()> {
        self.check_recording("set_render_pipeline")?;
        self.check_graphics_queue("set_render_pipeline")?;

        let layout = pipeline.layout();
        if self.graphics.pipeline_layout.as_ref() != Some(layout) {
            self.record(KilnNativeCommand::SetRootSignature {
                compute: false,
                root_signature: layout.native_root_signature(),
            });
            self.graphics.pipeline_layout = Some(layout.clone());
            self.graphics.mark_all_dirty();
        }

        self.record(KilnNativeCommand::SetPipeline(pipeline.native_pipeline()));
        self.record(KilnNativeCommand::SetPrimitiveTopology(
            pipeline.primitive_topology(),
        ));
        self.render_pipeline = Some(pipeline.clone());
        Ok(())
    }

    pub fn set_compute_pipeline(
        &mut self,
        pipeline: &KilnComputePipeline,
    ) -> KilnResult<()> {
        self.check_recording("set_compute_pipeline")?;
        self.check_compute_queue("set_compute_pipeline")?;

        let layout = pipeline.layout();
        if self.compute.pipeline_layout.as_ref() != Some(layout) {
            self.record(KilnNativeCommand::SetRootSignature {
                compute: true,
                root_signature: layout.native_root_signature(),
            });
            self.compute.pipeline_layout = Some(layout.clone());
            self.compute.mark_all_dirty();
        }

        self.record(KilnNativeCommand::SetPipeline(pipeline.native_pipeline()));
        self.compute_pipeline = Some(pipeline.clone());
        Ok(())
    }

    /// Bind a group to both the graphics and compute binding points. The tables are bound lazily
    /// by the next draw or dispatch.
    pub fn set_bind_group(
        &mut self,
        index: u32,
        bind_group: &KilnBindGroup,
    ) -> KilnResult<()> {
        self.check_recording("set_bind_group")?;
        self.check_compute_queue("set_bind_group")?;
        if index as usize >= crate::MAX_BIND_GROUPS {
            return Err(KilnError::ValidationError(format!(
                "Bind group index {} exceeds the maximum of {}",
                index,
                crate::MAX_BIND_GROUPS
            )));
        }

        for state in [&mut self.graphics, &mut self.compute].iter_mut() {
            state.bind_groups[index as usize] = Some(bind_group.clone());
            state.dirty |= 1 << index;
        }

        Ok(())
    }

    /// Set root constants for the pipeline of the current pass. Compute passes use the compute
    /// pipeline, everything else uses the render pipeline.
    pub fn set_push_constants(
        &mut self,
        data: &[u8],
    ) -> KilnResult<()> {
        self.check_recording("set_push_constants")?;
        let compute = self.pass == KilnPassKind::Compute;
        let layout = if compute {
            self.compute.pipeline_layout.as_ref()
        } else {
            self.graphics.pipeline_layout.as_ref()
        }
        .ok_or_else(|| {
            KilnError::PreconditionViolation(
                "set_push_constants requires a bound pipeline".to_string(),
            )
        })?;

        let root_parameter_index = layout.push_constant_root_index().ok_or_else(|| {
            KilnError::ValidationError("The pipeline layout has no push constants".to_string())
        })?;

        if data.len() as u32 > layout.push_constant_size() || data.len() % 4 != 0 {
            return Err(KilnError::ValidationError(format!(
                "{} bytes of push constants do not fit a {} byte range of 32-bit values",
                data.len(),
                layout.push_constant_size()
            )));
        }

        self.record(KilnNativeCommand::SetRootConstants {
            compute,
            root_parameter_index,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Bind the tables of every dirty bind group. Called right before each draw and dispatch.
    fn flush_bind_groups(
        &mut self,
        compute: bool,
    ) -> KilnResult<()> {
        self.bind_descriptor_heaps();

        let state = if compute {
            &mut self.compute
        } else {
            &mut self.graphics
        };

        let layout = match &state.pipeline_layout {
            Some(layout) => layout.clone(),
            None => {
                return Err(KilnError::PreconditionViolation(
                    "No pipeline is bound".to_string(),
                ))
            }
        };

        let mut commands = Vec::default();
        for (index, expected_layout) in layout.bind_group_layouts().iter().enumerate() {
            if state.dirty & (1 << index) == 0 {
                continue;
            }

            let has_tables =
                expected_layout.resource_table_size() > 0 || expected_layout.sampler_table_size() > 0;
            let bind_group = match &state.bind_groups[index] {
                Some(bind_group) => bind_group,
                None if has_tables => {
                    return Err(KilnError::ValidationError(format!(
                        "Bind group {} is required by the pipeline layout but was never set",
                        index
                    )))
                }
                None => continue,
            };

            if bind_group.layout() != expected_layout {
                return Err(KilnError::ValidationError(format!(
                    "Bind group {:?} at index {} does not match the pipeline layout",
                    bind_group.label(),
                    index
                )));
            }

            let root_indices = layout.root_indices(index as u32).unwrap_or_default();
            let tables = [
                (
                    root_indices.resource_table,
                    bind_group.resource_table_base(),
                    KilnDescriptorHeapType::Resource,
                ),
                (
                    root_indices.sampler_table,
                    bind_group.sampler_table_base(),
                    KilnDescriptorHeapType::Sampler,
                ),
            ];
            for (root_parameter_index, base_descriptor, heap_type) in tables.iter() {
                if let (Some(root_parameter_index), Some(base_descriptor)) =
                    (root_parameter_index, base_descriptor)
                {
                    commands.push(KilnNativeCommand::SetRootDescriptorTable {
                        compute,
                        root_parameter_index: *root_parameter_index,
                        heap_type: *heap_type,
                        base_descriptor: *base_descriptor,
                    });
                }
            }
        }

        // Groups beyond the layout stay dirty for the next layout that uses them
        state.dirty &= !((1u32 << layout.bind_group_layouts().len()) - 1);

        for command in commands {
            self.record(command);
        }

        Ok(())
    }

    //
    // Vertex input and fixed-function state
    //
    pub fn set_vertex_buffer(
        &mut self,
        slot: u32,
        buffer: &KilnBuffer,
        offset: u64,
    ) -> KilnResult<()> {
        self.check_recording("set_vertex_buffer")?;
        self.check_graphics_queue("set_vertex_buffer")?;
        let stride = self
            .render_pipeline
            .as_ref()
            .ok_or_else(|| {
                KilnError::PreconditionViolation(
                    "set_vertex_buffer requires a bound render pipeline".to_string(),
                )
            })?
            .vertex_buffer_stride(slot)
            .ok_or_else(|| {
                KilnError::ValidationError(format!(
                    "The render pipeline has no vertex buffer in slot {}",
                    slot
                ))
            })?;

        if !buffer.buffer_def().usage.contains(KilnBufferUsage::VERTEX) {
            return Err(KilnError::ValidationError(format!(
                "Buffer {:?} was not created with VERTEX usage",
                buffer.buffer_def().label
            )));
        }

        let size = buffer.buffer_def().size;
        buffer.check_range(offset, 1)?;
        self.record(KilnNativeCommand::SetVertexBuffer {
            slot,
            resource: buffer.native_resource(),
            offset,
            size: size - offset,
            stride,
        });
        Ok(())
    }

    pub fn set_index_buffer(
        &mut self,
        buffer: &KilnBuffer,
        offset: u64,
        index_type: KilnIndexType,
    ) -> KilnResult<()> {
        self.check_recording("set_index_buffer")?;
        self.check_graphics_queue("set_index_buffer")?;
        if !buffer.buffer_def().usage.contains(KilnBufferUsage::INDEX) {
            return Err(KilnError::ValidationError(format!(
                "Buffer {:?} was not created with INDEX usage",
                buffer.buffer_def().label
            )));
        }

        if offset % index_type.index_size_in_bytes() as u64 != 0 {
            return Err(KilnError::ValidationError(format!(
                "Index buffer offset {} is not aligned to {:?}",
                offset, index_type
            )));
        }

        let size = buffer.buffer_def().size;
        buffer.check_range(offset, 1)?;
        self.record(KilnNativeCommand::SetIndexBuffer {
            resource: buffer.native_resource(),
            offset,
            size: size - offset,
            index_type,
        });
        self.index_buffer_bound = true;
        Ok(())
    }

    pub fn set_viewport(
        &mut self,
        viewport: KilnViewport,
    ) -> KilnResult<()> {
        self.check_recording("set_viewport")?;
        self.check_graphics_queue("set_viewport")?;
        if viewport.width < 0.0 || viewport.height < 0.0 || viewport.min_depth > viewport.max_depth {
            return Err(KilnError::ValidationError(format!(
                "Invalid viewport {:?}",
                viewport
            )));
        }

        self.record(KilnNativeCommand::SetViewport(viewport));
        Ok(())
    }

    pub fn set_scissor_rect(
        &mut self,
        scissor_rect: KilnScissorRect,
    ) -> KilnResult<()> {
        self.check_recording("set_scissor_rect")?;
        self.check_graphics_queue("set_scissor_rect")?;
        self.record(KilnNativeCommand::SetScissorRect(scissor_rect));
        Ok(())
    }

    pub fn set_stencil_reference(
        &mut self,
        reference: u32,
    ) -> KilnResult<()> {
        self.check_recording("set_stencil_reference")?;
        self.check_graphics_queue("set_stencil_reference")?;
        self.record(KilnNativeCommand::SetStencilReference(reference));
        Ok(())
    }

    //
    // Draws
    //
    fn prepare_draw(
        &mut self,
        operation: &str,
    ) -> KilnResult<()> {
        self.check_pass(operation, KilnPassKind::Render)?;
        if self.render_pipeline.is_none() {
            return Err(KilnError::PreconditionViolation(format!(
                "{} requires a bound render pipeline",
                operation
            )));
        }

        self.flush_bind_groups(false)
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> KilnResult<()> {
        self.prepare_draw("draw")?;
        self.record(KilnNativeCommand::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) -> KilnResult<()> {
        self.prepare_draw("draw_indexed")?;
        if !self.index_buffer_bound {
            return Err(KilnError::PreconditionViolation(
                "draw_indexed requires a bound index buffer".to_string(),
            ));
        }

        self.record(KilnNativeCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        });
        Ok(())
    }

    fn check_indirect_buffer(
        buffer: &KilnBuffer,
        offset: u64,
        size: u64,
    ) -> KilnResult<()> {
        if !buffer.buffer_def().usage.contains(KilnBufferUsage::INDIRECT) {
            return Err(KilnError::ValidationError(format!(
                "Buffer {:?} was not created with INDIRECT usage",
                buffer.buffer_def().label
            )));
        }

        if offset % 4 != 0 {
            return Err(KilnError::ValidationError(format!(
                "Indirect argument offset {} is not 4 byte aligned",
                offset
            )));
        }

        buffer.check_range(offset, size)
    }

    fn draw_indirect_internal(
        &mut self,
        indexed: bool,
        buffer: &KilnBuffer,
        offset: u64,
        draw_count: u32,
    ) -> KilnResult<()> {
        let operation = if indexed {
            "draw_indexed_indirect"
        } else {
            "draw_indirect"
        };
        self.prepare_draw(operation)?;
        if indexed && !self.index_buffer_bound {
            return Err(KilnError::PreconditionViolation(format!(
                "{} requires a bound index buffer",
                operation
            )));
        }

        // D3D12_DRAW_ARGUMENTS is 16 bytes, D3D12_DRAW_INDEXED_ARGUMENTS is 20
        let stride = if indexed { 20 } else { 16 };
        Self::check_indirect_buffer(buffer, offset, stride * draw_count as u64)?;

        self.record(KilnNativeCommand::DrawIndirect {
            indexed,
            resource: buffer.native_resource(),
            offset,
            draw_count,
        });
        Ok(())
    }

    pub fn draw_indirect(
        &mut self,
        buffer: &KilnBuffer,
        offset: u64,
        draw_count: u32,
    ) -> KilnResult<()> {
        self.draw_indirect_internal(false, buffer, offset, draw_count)
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: &KilnBuffer,
        offset: u64,
        draw_count: u32,
    ) -> KilnResult<()> {
        self.draw_indirect_internal(true, buffer, offset, draw_count)
    }

    //
    // Compute
    //
    pub fn begin_compute_pass(&mut self) -> KilnResult<()> {
        self.check_pass("begin_compute_pass", KilnPassKind::None)?;
        self.check_compute_queue("begin_compute_pass")?;
        self.commit_pending_barriers();
        self.pass = KilnPassKind::Compute;
        Ok(())
    }

    pub fn end_compute_pass(&mut self) -> KilnResult<()> {
        self.check_pass("end_compute_pass", KilnPassKind::Compute)?;
        self.pass = KilnPassKind::None;
        Ok(())
    }

    fn prepare_dispatch(
        &mut self,
        operation: &str,
    ) -> KilnResult<()> {
        self.check_pass(operation, KilnPassKind::Compute)?;
        if self.compute_pipeline.is_none() {
            return Err(KilnError::PreconditionViolation(format!(
                "{} requires a bound compute pipeline",
                operation
            )));
        }

        self.flush_bind_groups(true)
    }

    pub fn dispatch(
        &mut self,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) -> KilnResult<()> {
        self.prepare_dispatch("dispatch")?;
        self.record(KilnNativeCommand::Dispatch {
            group_count_x,
            group_count_y,
            group_count_z,
        });
        Ok(())
    }

    pub fn dispatch_indirect(
        &mut self,
        buffer: &KilnBuffer,
        offset: u64,
    ) -> KilnResult<()> {
        self.prepare_dispatch("dispatch_indirect")?;
        // D3D12_DISPATCH_ARGUMENTS
        Self::check_indirect_buffer(buffer, offset, 12)?;
        self.record(KilnNativeCommand::DispatchIndirect {
            resource: buffer.native_resource(),
            offset,
        });
        Ok(())
    }

    //
    // Copies
    //
    pub fn copy_buffer(
        &mut self,
        src: &KilnBuffer,
        src_offset: u64,
        dst: &KilnBuffer,
        dst_offset: u64,
        size: u64,
    ) -> KilnResult<()> {
        self.check_pass("copy_buffer", KilnPassKind::None)?;
        src.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        if src == dst {
            let overlaps = src_offset < dst_offset + size && dst_offset < src_offset + size;
            if overlaps {
                return Err(KilnError::ValidationError(
                    "Source and destination ranges of a buffer copy overlap".to_string(),
                ));
            }
        }

        self.commit_pending_barriers();
        self.record(KilnNativeCommand::CopyBufferRegion {
            dst: dst.native_resource(),
            dst_offset,
            src: src.native_resource(),
            src_offset,
            size,
        });
        Ok(())
    }

    /// Copy tightly described rows from a buffer into one texture subresource. The subresource
    /// must already be in `CopyDest`.
    pub fn copy_buffer_to_texture(
        &mut self,
        src: &KilnBuffer,
        src_offset: u64,
        row_pitch: u32,
        dst: &KilnTexture,
        mip_level: u32,
        array_layer: u32,
    ) -> KilnResult<()> {
        self.check_pass("copy_buffer_to_texture", KilnPassKind::None)?;
        let device_info = self.device_context.device_info();
        let texture_def = dst.texture_def();

        let layout = dst.subresource_layout(mip_level, array_layer).ok_or_else(|| {
            KilnError::ValidationError(format!(
                "Subresource mip {} layer {} is out of range for texture {:?}",
                mip_level, array_layer, texture_def.label
            ))
        })?;
        if layout != KilnTextureLayout::CopyDest {
            return Err(KilnError::ValidationError(format!(
                "Texture {:?} mip {} layer {} is in {:?}, expected CopyDest",
                texture_def.label, mip_level, array_layer, layout
            )));
        }

        if src_offset % device_info.upload_texture_alignment as u64 != 0
            || row_pitch % device_info.upload_texture_row_alignment != 0
        {
            return Err(KilnError::ValidationError(format!(
                "Texture upload offset {} must be {} byte aligned and row pitch {} must be {} byte aligned",
                src_offset,
                device_info.upload_texture_alignment,
                row_pitch,
                device_info.upload_texture_row_alignment
            )));
        }

        let extents = KilnExtents3D {
            width: (texture_def.extents.width >> mip_level).max(1),
            height: (texture_def.extents.height >> mip_level).max(1),
            depth_or_array_layers: (texture_def.depth() >> mip_level).max(1),
        };
        let format = texture_def.format;
        if (row_pitch as u64) < format.row_size_in_bytes(extents.width) {
            return Err(KilnError::ValidationError(format!(
                "Row pitch {} is smaller than a row of {} {:?} texels",
                row_pitch, extents.width, format
            )));
        }

        let size = row_pitch as u64 * format.row_count(extents.height) as u64
            * extents.depth_or_array_layers as u64;
        src.check_range(src_offset, size)?;

        self.commit_pending_barriers();
        self.record(KilnNativeCommand::CopyBufferToTexture {
            dst: dst.native_resource(),
            dst_subresource: texture_def.subresource_index(mip_level, array_layer),
            src: src.native_resource(),
            src_offset,
            row_pitch,
            extents,
            format,
        });
        Ok(())
    }

    //
    // Barriers
    //
    fn check_barrier(
        &self,
        operation: &str,
    ) -> KilnResult<()> {
        self.check_pass(operation, KilnPassKind::None)
    }

    /// Move every subresource of the texture into `new_layout`
    pub fn texture_barrier(
        &mut self,
        texture: &KilnTexture,
        new_layout: KilnTextureLayout,
    ) -> KilnResult<()> {
        self.texture_barrier_with_options(texture, new_layout, KilnSubresource::All, false)
    }

    pub fn texture_barrier_with_options(
        &mut self,
        texture: &KilnTexture,
        new_layout: KilnTextureLayout,
        subresource: KilnSubresource,
        force_commit: bool,
    ) -> KilnResult<()> {
        self.check_barrier("texture_barrier")?;
        self.barrier_tracker.texture_barrier(
            self.device_context.native(),
            self.command_list,
            texture,
            new_layout,
            subresource,
            force_commit,
        )
    }

    pub fn buffer_barrier(
        &mut self,
        buffer: &KilnBuffer,
        new_states: KilnBufferStates,
    ) -> KilnResult<()> {
        self.check_barrier("buffer_barrier")?;
        self.barrier_tracker.buffer_barrier(
            self.device_context.native(),
            self.command_list,
            buffer,
            new_states,
            false,
        )
    }

    /// Order unordered-access work on `buffer`, or on every resource if `None`
    pub fn uav_barrier(
        &mut self,
        buffer: Option<&KilnBuffer>,
    ) -> KilnResult<()> {
        self.check_barrier("uav_barrier")?;
        self.check_compute_queue("uav_barrier")?;
        self.barrier_tracker.uav_barrier(
            self.device_context.native(),
            self.command_list,
            buffer.map(|x| x.native_resource()),
            false,
        );
        Ok(())
    }

    pub fn texture_uav_barrier(
        &mut self,
        texture: &KilnTexture,
    ) -> KilnResult<()> {
        self.check_barrier("texture_uav_barrier")?;
        self.check_compute_queue("texture_uav_barrier")?;
        self.barrier_tracker.uav_barrier(
            self.device_context.native(),
            self.command_list,
            Some(texture.native_resource()),
            false,
        );
        Ok(())
    }

    pub fn commit_barriers(&mut self) -> KilnResult<()> {
        self.check_recording("commit_barriers")?;
        self.commit_pending_barriers();
        Ok(())
    }

    fn commit_pending_barriers(&mut self) {
        self.barrier_tracker
            .commit(self.device_context.native(), self.command_list);
    }

    pub fn pending_barrier_count(&self) -> usize {
        self.barrier_tracker.pending_count()
    }

    //
    // Queries
    //
    fn record_query(
        &mut self,
        operation: &str,
        query_heap: &KilnQueryHeap,
        index: u32,
        allowed: &[KilnQueryType],
        begin: bool,
    ) -> KilnResult<()> {
        self.check_recording(operation)?;
        if !allowed.contains(&query_heap.query_type()) {
            return Err(KilnError::ValidationError(format!(
                "{} cannot be used with {:?} queries",
                operation,
                query_heap.query_type()
            )));
        }

        match query_heap.query_type() {
            KilnQueryType::Occlusion | KilnQueryType::BinaryOcclusion => {
                self.check_graphics_queue(operation)?
            }
            KilnQueryType::PipelineStatistics => self.check_compute_queue(operation)?,
            KilnQueryType::Timestamp => {}
        }

        query_heap.check_range(index, 1)?;

        let native_query_heap = query_heap.native_query_heap();
        let query_type = query_heap.query_type();
        self.record(if begin {
            KilnNativeCommand::BeginQuery {
                query_heap: native_query_heap,
                query_type,
                index,
            }
        } else {
            KilnNativeCommand::EndQuery {
                query_heap: native_query_heap,
                query_type,
                index,
            }
        });
        Ok(())
    }

    pub fn begin_query(
        &mut self,
        query_heap: &KilnQueryHeap,
        index: u32,
    ) -> KilnResult<()> {
        self.record_query(
            "begin_query",
            query_heap,
            index,
            &[
                KilnQueryType::Occlusion,
                KilnQueryType::BinaryOcclusion,
                KilnQueryType::PipelineStatistics,
            ],
            true,
        )
    }

    pub fn end_query(
        &mut self,
        query_heap: &KilnQueryHeap,
        index: u32,
    ) -> KilnResult<()> {
        self.record_query(
            "end_query",
            query_heap,
            index,
            &[
                KilnQueryType::Occlusion,
                KilnQueryType::BinaryOcclusion,
                KilnQueryType::PipelineStatistics,
            ],
            false,
        )
    }

    pub fn write_timestamp(
        &mut self,
        query_heap: &KilnQueryHeap,
        index: u32,
    ) -> KilnResult<()> {
        self.record_query(
            "write_timestamp",
            query_heap,
            index,
            &[KilnQueryType::Timestamp],
            false,
        )
    }

    /// Write query results into `dst`. 64-bit values, 8 byte aligned.
    pub fn resolve_query(
        &mut self,
        query_heap: &KilnQueryHeap,
        first_query: u32,
        query_count: u32,
        dst: &KilnBuffer,
        dst_offset: u64,
    ) -> KilnResult<()> {
        self.check_pass("resolve_query", KilnPassKind::None)?;
        query_heap.check_range(first_query, query_count)?;
        if dst_offset % 8 != 0 {
            return Err(KilnError::ValidationError(format!(
                "Query resolve offset {} is not 8 byte aligned",
                dst_offset
            )));
        }

        let query_type = query_heap.query_type();
        dst.check_range(dst_offset, query_type.result_size() * query_count as u64)?;

        self.commit_pending_barriers();
        self.record(KilnNativeCommand::ResolveQueryData {
            query_heap: query_heap.native_query_heap(),
            query_type,
            first_query,
            query_count,
            dst: dst.native_resource(),
            dst_offset,
        });
        Ok(())
    }

    //
    // Debug labels
    //
    pub fn push_debug_group(
        &mut self,
        name: &str,
    ) -> KilnResult<()> {
        self.check_recording("push_debug_group")?;
        self.record(KilnNativeCommand::BeginEvent(name.to_string()));
        self.debug_group_depth += 1;
        Ok(())
    }

    pub fn pop_debug_group(&mut self) -> KilnResult<()> {
        self.check_recording("pop_debug_group")?;
        if self.debug_group_depth == 0 {
            return Err(KilnError::PreconditionViolation(
                "pop_debug_group without a matching push_debug_group".to_string(),
            ));
        }

        self.record(KilnNativeCommand::EndEvent);
        self.debug_group_depth -= 1;
        Ok(())
    }

    pub fn insert_debug_marker(
        &mut self,
        name: &str,
    ) -> KilnResult<()> {
        self.check_recording("insert_debug_marker")?;
        self.record(KilnNativeCommand::SetMarker(name.to_string()));
        Ok(())
    }

    //
    // Render passes
    //
    fn verify_render_pass(
        &self,
        render_pass_def: &KilnRenderPassDef,
    ) -> KilnResult<KilnExtents2D> {
        render_pass_def.verify()?;

        let mut extents = None;
        let attachments = render_pass_def
            .color_attachments
            .iter()
            .map(|x| (&x.texture, x.mip_level))
            .chain(
                render_pass_def
                    .depth_stencil_attachment
                    .iter()
                    .map(|x| (&x.texture, x.mip_level)),
            );
        for (texture, mip_level) in attachments {
            let def = texture.texture_def();
            let attachment_extents = KilnExtents2D {
                width: (def.extents.width >> mip_level).max(1),
                height: (def.extents.height >> mip_level).max(1),
            };

            match extents {
                None => extents = Some(attachment_extents),
                Some(extents) if extents != attachment_extents => {
                    return Err(KilnError::ValidationError(format!(
                        "Render pass attachments have different sizes: {:?} and {:?}",
                        extents, attachment_extents
                    )));
                }
                _ => {}
            }
        }

        for attachment in &render_pass_def.color_attachments {
            if let Some(resolve_target) = &attachment.resolve_target {
                let src_def = attachment.texture.texture_def();
                let dst_def = resolve_target.texture_def();
                if attachment.resolve_mip_level >= dst_def.mip_count
                    || attachment.resolve_array_layer >= dst_def.array_layer_count()
                {
                    return Err(KilnError::ValidationError(format!(
                        "Resolve subresource mip {} layer {} is out of range for texture {:?}",
                        attachment.resolve_mip_level,
                        attachment.resolve_array_layer,
                        dst_def.label
                    )));
                }

                let mip_extents = |def: &KilnTextureDef, mip_level: u32| KilnExtents2D {
                    width: (def.extents.width >> mip_level).max(1),
                    height: (def.extents.height >> mip_level).max(1),
                };
                if src_def.sample_count == KilnSampleCount::SampleCount1
                    || dst_def.sample_count != KilnSampleCount::SampleCount1
                    || src_def.format != dst_def.format
                    || mip_extents(src_def, attachment.mip_level)
                        != mip_extents(dst_def, attachment.resolve_mip_level)
                {
                    return Err(KilnError::ValidationError(format!(
                        "Texture {:?} cannot be resolved into {:?}",
                        src_def.label, dst_def.label
                    )));
                }
            }
        }

        extents.ok_or_else(|| KilnError::ValidationError("Render pass has no attachments".to_string()))
    }

    /// Transition the attachments, bind them and apply their load ops. The viewport and scissor
    /// cover the whole attachment.
    pub fn begin_render_pass(
        &mut self,
        render_pass_def: &KilnRenderPassDef,
    ) -> KilnResult<()> {
        self.check_pass("begin_render_pass", KilnPassKind::None)?;
        self.check_graphics_queue("begin_render_pass")?;
        let extents = self.verify_render_pass(render_pass_def)?;

        let mut render_target_views = Vec::with_capacity(render_pass_def.color_attachments.len());
        for attachment in &render_pass_def.color_attachments {
            render_target_views.push(
                attachment
                    .texture
                    .render_target_view(attachment.mip_level, attachment.array_layer)?,
            );
        }

        let depth_stencil_view = match &render_pass_def.depth_stencil_attachment {
            Some(attachment) => Some(attachment.texture.depth_stencil_view(
                attachment.mip_level,
                attachment.array_layer,
                attachment.read_only,
            )?),
            None => None,
        };

        for attachment in &render_pass_def.color_attachments {
            self.texture_barrier_with_options(
                &attachment.texture,
                KilnTextureLayout::RenderTarget,
                KilnSubresource::Single {
                    mip_level: attachment.mip_level,
                    array_layer: attachment.array_layer,
                },
                false,
            )?;
        }

        if let Some(attachment) = &render_pass_def.depth_stencil_attachment {
            let layout = if attachment.read_only {
                KilnTextureLayout::DepthRead
            } else {
                KilnTextureLayout::DepthWrite
            };
            self.texture_barrier_with_options(
                &attachment.texture,
                layout,
                KilnSubresource::Single {
                    mip_level: attachment.mip_level,
                    array_layer: attachment.array_layer,
                },
                false,
            )?;
        }

        self.commit_pending_barriers();

        if let Some(label) = &render_pass_def.label {
            self.push_debug_group(label)?;
        }
        self.pass_label_pushed = render_pass_def.label.is_some();

        self.record(KilnNativeCommand::SetRenderTargets {
            render_target_views: render_target_views.clone(),
            depth_stencil_view,
        });

        for (attachment, view) in render_pass_def
            .color_attachments
            .iter()
            .zip(render_target_views)
        {
            if attachment.load_op == KilnLoadOp::Clear {
                self.record(KilnNativeCommand::ClearRenderTarget {
                    render_target_view: view,
                    color: attachment.clear_value,
                });
            }
        }

        if let (Some(attachment), Some(view)) =
            (&render_pass_def.depth_stencil_attachment, depth_stencil_view)
        {
            if attachment.load_op == KilnLoadOp::Clear && !attachment.read_only {
                self.record(KilnNativeCommand::ClearDepthStencil {
                    depth_stencil_view: view,
                    value: attachment.clear_value,
                });
            }
        }

        self.record(KilnNativeCommand::SetViewport(KilnViewport {
            x: 0.0,
            y: 0.0,
            width: extents.width as f32,
            height: extents.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }));
        self.record(KilnNativeCommand::SetScissorRect(KilnScissorRect {
            x: 0,
            y: 0,
            width: extents.width,
            height: extents.height,
        }));

        self.pending_resolves = render_pass_def
            .color_attachments
            .iter()
            .filter_map(|attachment| {
                attachment
                    .resolve_target
                    .as_ref()
                    .map(|resolve_target| KilnPendingResolve {
                        src: attachment.texture.clone(),
                        src_mip_level: attachment.mip_level,
                        src_array_layer: attachment.array_layer,
                        dst: resolve_target.clone(),
                        dst_mip_level: attachment.resolve_mip_level,
                        dst_array_layer: attachment.resolve_array_layer,
                    })
            })
            .collect();
        self.pass = KilnPassKind::Render;
        Ok(())
    }

    /// Ends the pass and resolves multisampled attachments that named a resolve target
    pub fn end_render_pass(&mut self) -> KilnResult<()> {
        self.check_pass("end_render_pass", KilnPassKind::Render)?;
        self.pass = KilnPassKind::None;

        if self.pass_label_pushed {
            self.pass_label_pushed = false;
            self.pop_debug_group()?;
        }

        let resolves = std::mem::take(&mut self.pending_resolves);
        for resolve in &resolves {
            self.texture_barrier_with_options(
                &resolve.src,
                KilnTextureLayout::ResolveSource,
                KilnSubresource::Single {
                    mip_level: resolve.src_mip_level,
                    array_layer: resolve.src_array_layer,
                },
                false,
            )?;
            self.texture_barrier_with_options(
                &resolve.dst,
                KilnTextureLayout::ResolveDest,
                KilnSubresource::Single {
                    mip_level: resolve.dst_mip_level,
                    array_layer: resolve.dst_array_layer,
                },
                false,
            )?;
        }

        if resolves.is_empty() {
            return Ok(());
        }

        self.commit_pending_barriers();
        for resolve in resolves {
            let src_def = resolve.src.texture_def();
            let dst_def = resolve.dst.texture_def();
            self.record(KilnNativeCommand::ResolveSubresource {
                dst: resolve.dst.native_resource(),
                dst_subresource: dst_def
                    .subresource_index(resolve.dst_mip_level, resolve.dst_array_layer),
                src: resolve.src.native_resource(),
                src_subresource: src_def
                    .subresource_index(resolve.src_mip_level, resolve.src_array_layer),
                format: src_def.format,
            });
        }

        Ok(())
    }

    //
    // Presentation
    //

    /// Transition the swap chain's current back buffer to `Present` and queue the swap chain to be
    /// presented when the frame is committed
    pub fn present(
        &mut self,
        swap_chain: &KilnSwapChain,
    ) -> KilnResult<()> {
        self.check_pass("present", KilnPassKind::None)?;
        self.check_graphics_queue("present")?;

        let back_buffer = swap_chain.current_back_buffer()?;
        self.texture_barrier_with_options(
            &back_buffer,
            KilnTextureLayout::Present,
            KilnSubresource::All,
            true,
        )?;

        if !self.pending_presents.contains(swap_chain) {
            self.pending_presents.push(swap_chain.clone());
        }

        Ok(())
    }

    //
    // End and submission
    //

    /// Flush barriers, pop the label pushed at creation and close the native command list
    pub fn end(&mut self) -> KilnResult<()> {
        self.check_pass("end", KilnPassKind::None)?;
        if self.debug_group_depth > 0 {
            return Err(KilnError::PreconditionViolation(format!(
                "{} debug groups are still open",
                self.debug_group_depth
            )));
        }

        self.commit_pending_barriers();
        if self.label_pushed {
            self.record(KilnNativeCommand::EndEvent);
            self.label_pushed = false;
        }

        self.ended = true;
        self.device_context
            .native()
            .close_command_list(self.command_list)
            .map_err(|e| self.device_context.handle_native_error(e))
    }

    /// Ends the command buffer if needed and hands the recorder and presents to the queue
    pub(crate) fn finish(mut self) -> KilnResult<(KilnCommandRecorder, Vec<KilnSwapChain>)> {
        if !self.ended {
            self.end()?;
        }

        let presents = std::mem::take(&mut self.pending_presents);
        let recorder = self.recorder.take().ok_or_else(|| {
            KilnError::StringError("Command buffer has no recorder".to_string())
        })?;
        Ok((recorder, presents))
    }
}

impl Drop for KilnCommandBuffer {
    fn drop(&mut self) {
        let recorder = match self.recorder.take() {
            Some(recorder) => recorder,
            None => return,
        };

        log::warn!(
            "A {:?} command buffer was dropped without being submitted",
            self.queue_type
        );

        if !self.ended {
            if let Err(e) = self
                .device_context
                .native()
                .close_command_list(self.command_list)
            {
                log::error!("Failed to close dropped command list: {}", e);
            }
        }

        if let Err(crossbeam_channel::SendError(recorder)) = self.recorder_tx.send(recorder) {
            recorder.destroy(self.device_context.native());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::NullCall;

    fn create_device() -> KilnDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        KilnDevice::new(&Default::default()).unwrap()
    }

    fn shader(stage: KilnShaderStageFlags) -> KilnShaderStageDef {
        KilnShaderStageDef {
            stage,
            bytecode: vec![0x44, 0x58, 0x42, 0x43],
            entry_point: "main".to_string(),
        }
    }

    fn constant_buffer_layout(device: &KilnDevice) -> KilnBindGroupLayout {
        device
            .create_bind_group_layout(&KilnBindGroupLayoutDef {
                entries: vec![KilnBindGroupLayoutEntry::new(
                    0,
                    KilnBindingKind::ConstantBuffer,
                    KilnShaderStageFlags::ALL,
                )],
                label: None,
            })
            .unwrap()
    }

    fn constant_buffer_group(
        device: &KilnDevice,
        layout: &KilnBindGroupLayout,
    ) -> KilnBindGroup {
        let buffer = device
            .create_buffer(&KilnBufferDef {
                size: 256,
                usage: KilnBufferUsage::CONSTANT,
                ..Default::default()
            })
            .unwrap();
        device
            .create_bind_group(&KilnBindGroupDef {
                layout: layout.clone(),
                entries: vec![KilnBindGroupEntry::new(
                    0,
                    KilnBindingResource::ConstantBuffer {
                        buffer,
                        offset: 0,
                        size: 256,
                    },
                )],
                label: None,
            })
            .unwrap()
    }

    fn render_pipeline(
        device: &KilnDevice,
        layout: &KilnPipelineLayout,
    ) -> KilnRenderPipeline {
        device
            .create_render_pipeline(&KilnRenderPipelineDef {
                layout: layout.clone(),
                vertex: Some(shader(KilnShaderStageFlags::VERTEX)),
                mesh: None,
                fragment: Some(shader(KilnShaderStageFlags::FRAGMENT)),
                vertex_buffers: vec![],
                primitive_topology: KilnPrimitiveTopology::TriangleList,
                color_formats: vec![KilnFormat::R8G8B8A8Unorm],
                depth_stencil_format: KilnFormat::Undefined,
                sample_count: KilnSampleCount::SampleCount1,
                label: None,
            })
            .unwrap()
    }

    fn render_target(device: &KilnDevice) -> KilnTexture {
        device
            .create_texture(&KilnTextureDef {
                format: KilnFormat::R8G8B8A8Unorm,
                extents: KilnExtents3D {
                    width: 128,
                    height: 64,
                    depth_or_array_layers: 1,
                },
                usage: KilnTextureUsage::RENDER_TARGET | KilnTextureUsage::SHADER_READ,
                ..Default::default()
            })
            .unwrap()
    }

    fn clear_pass(texture: &KilnTexture) -> KilnRenderPassDef {
        KilnRenderPassDef {
            color_attachments: vec![KilnColorAttachment {
                load_op: KilnLoadOp::Clear,
                clear_value: KilnColorClearValue([0.0, 0.0, 0.0, 1.0]),
                ..KilnColorAttachment::new(texture.clone())
            }],
            depth_stencil_attachment: None,
            label: Some("main pass".to_string()),
        }
    }

    fn recorded(calls: &[NullCall]) -> Vec<KilnNativeCommand> {
        calls
            .iter()
            .filter_map(|x| x.recorded_command().cloned())
            .collect()
    }

    #[test]
    fn test_draw_outside_render_pass_is_rejected() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();

        let start = null.call_count();
        assert!(matches!(
            command_buffer.draw(3, 1, 0, 0),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(matches!(
            command_buffer.dispatch(1, 1, 1),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(null.calls_since(start).is_empty());
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
    }

    #[test]
    fn test_recording_after_end_is_rejected() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let texture = render_target(&device);
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer.end().unwrap();

        let start = null.call_count();
        assert!(matches!(
            command_buffer.texture_barrier(&texture, KilnTextureLayout::CopyDest),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(matches!(
            command_buffer.insert_debug_marker("late"),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(null.calls_since(start).is_empty());

        // Already ended command buffers are submitted as they are
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
        assert!(null.validation_errors().is_empty());
    }

    #[test]
    fn test_render_pass_binds_and_clears_attachments() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let texture = render_target(&device);
        texture.set_layout(KilnTextureLayout::ShaderResource);
        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();

        let start = null.call_count();
        command_buffer.begin_render_pass(&clear_pass(&texture)).unwrap();
        let commands = recorded(&null.calls_since(start));

        assert_eq!(
            texture.subresource_layouts(),
            vec![KilnTextureLayout::RenderTarget]
        );
        assert!(matches!(commands[0], KilnNativeCommand::ResourceBarriers(_)));
        assert!(commands.contains(&KilnNativeCommand::SetRenderTargets {
            render_target_views: vec![0],
            depth_stencil_view: None,
        }));
        assert!(commands.contains(&KilnNativeCommand::ClearRenderTarget {
            render_target_view: 0,
            color: KilnColorClearValue([0.0, 0.0, 0.0, 1.0]),
        }));
        assert!(commands.contains(&KilnNativeCommand::SetScissorRect(KilnScissorRect {
            x: 0,
            y: 0,
            width: 128,
            height: 64,
        })));

        // Copies and barriers are not allowed inside the pass
        assert!(matches!(
            command_buffer.texture_barrier(&texture, KilnTextureLayout::ShaderResource),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(matches!(
            command_buffer.end(),
            Err(KilnError::PreconditionViolation(_))
        ));

        command_buffer.end_render_pass().unwrap();
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
        assert!(null.validation_errors().is_empty());
    }

    #[test]
    fn test_only_dirty_bind_groups_are_rebound() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let bind_group_layout = constant_buffer_layout(&device);
        let bind_group = constant_buffer_group(&device, &bind_group_layout);
        let pipeline_layout = device
            .create_pipeline_layout(&KilnPipelineLayoutDef {
                bind_group_layouts: vec![bind_group_layout.clone()],
                ..Default::default()
            })
            .unwrap();
        let pipeline = render_pipeline(&device, &pipeline_layout);
        let texture = render_target(&device);

        let table_count = |commands: &[KilnNativeCommand]| {
            commands
                .iter()
                .filter(|x| matches!(x, KilnNativeCommand::SetRootDescriptorTable { .. }))
                .count()
        };

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer.begin_render_pass(&clear_pass(&texture)).unwrap();
        command_buffer.set_render_pipeline(&pipeline).unwrap();

        // The layout requires group 0
        assert!(matches!(
            command_buffer.draw(3, 1, 0, 0),
            Err(KilnError::ValidationError(_))
        ));

        command_buffer.set_bind_group(0, &bind_group).unwrap();
        let start = null.call_count();
        command_buffer.draw(3, 1, 0, 0).unwrap();
        let commands = recorded(&null.calls_since(start));
        assert_eq!(table_count(&commands), 1);
        assert!(commands.contains(&KilnNativeCommand::SetRootDescriptorTable {
            compute: false,
            root_parameter_index: 0,
            heap_type: KilnDescriptorHeapType::Resource,
            base_descriptor: bind_group.resource_table_base().unwrap(),
        }));

        let start = null.call_count();
        command_buffer.draw(3, 1, 0, 0).unwrap();
        assert_eq!(table_count(&recorded(&null.calls_since(start))), 0);

        // Binding the same pipeline again keeps the layout, so nothing is dirty
        command_buffer.set_render_pipeline(&pipeline).unwrap();
        let start = null.call_count();
        command_buffer.draw(3, 1, 0, 0).unwrap();
        assert_eq!(table_count(&recorded(&null.calls_since(start))), 0);

        command_buffer.end_render_pass().unwrap();
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
    }

    #[test]
    fn test_pipeline_layout_change_marks_groups_dirty() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let bind_group_layout = constant_buffer_layout(&device);
        let bind_group = constant_buffer_group(&device, &bind_group_layout);
        let pipeline_layout_def = KilnPipelineLayoutDef {
            bind_group_layouts: vec![bind_group_layout.clone()],
            ..Default::default()
        };
        let first = render_pipeline(
            &device,
            &device.create_pipeline_layout(&pipeline_layout_def).unwrap(),
        );
        let second = render_pipeline(
            &device,
            &device.create_pipeline_layout(&pipeline_layout_def).unwrap(),
        );
        let texture = render_target(&device);

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        command_buffer.begin_render_pass(&clear_pass(&texture)).unwrap();
        command_buffer.set_bind_group(0, &bind_group).unwrap();
        command_buffer.set_render_pipeline(&first).unwrap();
        command_buffer.draw(3, 1, 0, 0).unwrap();

        command_buffer.set_render_pipeline(&second).unwrap();
        let start = null.call_count();
        command_buffer.draw(3, 1, 0, 0).unwrap();
        let rebinds = recorded(&null.calls_since(start))
            .iter()
            .filter(|x| matches!(x, KilnNativeCommand::SetRootDescriptorTable { .. }))
            .count();
        assert_eq!(rebinds, 1);

        command_buffer.end_render_pass().unwrap();
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
    }

    #[test]
    fn test_resolve_into_mip_and_layer() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let multisampled = device
            .create_texture(&KilnTextureDef {
                format: KilnFormat::R8G8B8A8Unorm,
                extents: KilnExtents3D {
                    width: 64,
                    height: 32,
                    depth_or_array_layers: 1,
                },
                sample_count: KilnSampleCount::SampleCount4,
                usage: KilnTextureUsage::RENDER_TARGET,
                ..Default::default()
            })
            .unwrap();
        let resolved = device
            .create_texture(&KilnTextureDef {
                format: KilnFormat::R8G8B8A8Unorm,
                extents: KilnExtents3D {
                    width: 128,
                    height: 64,
                    depth_or_array_layers: 2,
                },
                mip_count: 2,
                usage: KilnTextureUsage::SHADER_READ,
                ..Default::default()
            })
            .unwrap();
        let pass = |resolve_mip_level| KilnRenderPassDef {
            color_attachments: vec![KilnColorAttachment {
                resolve_target: Some(resolved.clone()),
                resolve_mip_level,
                resolve_array_layer: 1,
                ..KilnColorAttachment::new(multisampled.clone())
            }],
            ..Default::default()
        };

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        // Mip 0 of the target is twice the size of the attachment
        assert!(matches!(
            command_buffer.begin_render_pass(&pass(0)),
            Err(KilnError::ValidationError(_))
        ));

        command_buffer.begin_render_pass(&pass(1)).unwrap();
        let start = null.call_count();
        command_buffer.end_render_pass().unwrap();

        let expected_dst = resolved.texture_def().subresource_index(1, 1);
        assert!(recorded(&null.calls_since(start)).iter().any(|x| matches!(
            x,
            KilnNativeCommand::ResolveSubresource {
                dst_subresource,
                src_subresource: 0,
                ..
            } if *dst_subresource == expected_dst
        )));
        assert_eq!(
            resolved.subresource_layout(1, 1),
            Some(KilnTextureLayout::ResolveDest)
        );
        assert_eq!(
            resolved.subresource_layout(0, 0),
            Some(KilnTextureLayout::ShaderResource)
        );
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
    }

    #[test]
    fn test_queue_restrictions() {
        let device = create_device();
        let texture = render_target(&device);

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Copy).unwrap();
        assert!(matches!(
            command_buffer.begin_compute_pass(),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(matches!(
            command_buffer.begin_render_pass(&clear_pass(&texture)),
            Err(KilnError::PreconditionViolation(_))
        ));
        device
            .queue(KilnQueueType::Copy)
            .unwrap()
            .submit(command_buffer)
            .unwrap();

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Compute).unwrap();
        command_buffer.begin_compute_pass().unwrap();
        // No pipeline bound
        assert!(matches!(
            command_buffer.dispatch(1, 1, 1),
            Err(KilnError::PreconditionViolation(_))
        ));
        command_buffer.end_compute_pass().unwrap();
        device
            .queue(KilnQueueType::Compute)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
    }

    #[test]
    fn test_copy_buffer_validates_ranges() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let src = device
            .create_buffer(&KilnBufferDef::for_staging_buffer(64))
            .unwrap();
        src.copy_to_host_visible_buffer(&[7u8; 64]).unwrap();
        let dst = device
            .create_buffer(&KilnBufferDef {
                size: 64,
                ..Default::default()
            })
            .unwrap();

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Copy).unwrap();
        command_buffer
            .buffer_barrier(&dst, KilnBufferStates::COPY_DEST)
            .unwrap();
        assert!(matches!(
            command_buffer.copy_buffer(&src, 32, &dst, 0, 64),
            Err(KilnError::ValidationError(_))
        ));
        assert_eq!(command_buffer.pending_barrier_count(), 1);

        command_buffer.copy_buffer(&src, 0, &dst, 0, 64).unwrap();
        assert_eq!(command_buffer.pending_barrier_count(), 0);

        let queue = device.queue(KilnQueueType::Copy).unwrap();
        let value = queue.submit(command_buffer).unwrap();
        queue.wait_for_fence(value).unwrap();
        assert_eq!(
            null.buffer_contents(dst.native_resource()),
            Some(vec![7u8; 64])
        );
    }

    #[test]
    fn test_debug_groups_must_balance() {
        let device = create_device();
        let null = device.null_device().unwrap();
        let mut command_buffer = device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .begin_command_buffer(Some("frame"))
            .unwrap();

        assert!(matches!(
            command_buffer.pop_debug_group(),
            Err(KilnError::PreconditionViolation(_))
        ));
        command_buffer.push_debug_group("shadows").unwrap();
        assert!(matches!(
            command_buffer.end(),
            Err(KilnError::PreconditionViolation(_))
        ));
        command_buffer.pop_debug_group().unwrap();

        let start = null.call_count();
        command_buffer.end().unwrap();
        assert!(recorded(&null.calls_since(start)).contains(&KilnNativeCommand::EndEvent));
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
    }

    #[test]
    fn test_query_types_are_checked() {
        let device = create_device();
        let occlusion = device
            .create_query_heap(&KilnQueryHeapDef {
                query_type: KilnQueryType::Occlusion,
                count: 4,
                label: None,
            })
            .unwrap();
        let timestamps = device
            .create_query_heap(&KilnQueryHeapDef {
                query_type: KilnQueryType::Timestamp,
                count: 4,
                label: None,
            })
            .unwrap();
        let readback = device
            .create_buffer(&KilnBufferDef {
                size: 64,
                memory_type: KilnMemoryType::Readback,
                ..Default::default()
            })
            .unwrap();

        let mut command_buffer = device.begin_command_buffer(KilnQueueType::Graphics).unwrap();
        assert!(matches!(
            command_buffer.write_timestamp(&occlusion, 0),
            Err(KilnError::ValidationError(_))
        ));
        command_buffer.write_timestamp(&timestamps, 0).unwrap();
        command_buffer.write_timestamp(&timestamps, 1).unwrap();
        command_buffer.begin_query(&occlusion, 0).unwrap();
        command_buffer.end_query(&occlusion, 0).unwrap();
        assert!(matches!(
            command_buffer.resolve_query(&timestamps, 0, 4, &readback, 40),
            Err(KilnError::ValidationError(_))
        ));
        command_buffer
            .resolve_query(&timestamps, 0, 2, &readback, 0)
            .unwrap();
        device
            .queue(KilnQueueType::Graphics)
            .unwrap()
            .submit(command_buffer)
            .unwrap();
    }
}
