//! Native dispatch. Every native object category is an enum with one variant per compiled backend,
//! and `KilnNativeDevice` forwards each native call to the active backend.

pub mod null;

use crate::*;
use null::{NullDevice, NullObjectId};
use std::sync::Arc;

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            Null(NullObjectId),
        }

        impl $name {
            pub fn null_id(&self) -> Option<NullObjectId> {
                match self {
                    $name::Null(id) => Some(*id),
                }
            }
        }
    };
}

native_handle!(
    /// A committed buffer or texture allocation
    KilnNativeResource
);
native_handle!(KilnNativeSampler);
native_handle!(KilnNativeBindGroupLayout);
native_handle!(KilnNativeRootSignature);
native_handle!(KilnNativePipeline);
native_handle!(KilnNativeQueryHeap);
native_handle!(KilnNativeDescriptorHeap);
native_handle!(KilnNativeSwapChain);
native_handle!(KilnNativeQueue);
native_handle!(KilnNativeFence);
native_handle!(KilnNativeCommandAllocator);
native_handle!(KilnNativeCommandList);

/// Any native object the device can destroy
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KilnNativeObject {
    Resource(KilnNativeResource),
    Sampler(KilnNativeSampler),
    BindGroupLayout(KilnNativeBindGroupLayout),
    RootSignature(KilnNativeRootSignature),
    Pipeline(KilnNativePipeline),
    QueryHeap(KilnNativeQueryHeap),
    DescriptorHeap(KilnNativeDescriptorHeap),
    SwapChain(KilnNativeSwapChain),
    Queue(KilnNativeQueue),
    Fence(KilnNativeFence),
    CommandAllocator(KilnNativeCommandAllocator),
    CommandList(KilnNativeCommandList),
}

macro_rules! native_object_from {
    ($($variant:ident($handle:ident)),*) => {
        $(
            impl From<$handle> for KilnNativeObject {
                fn from(handle: $handle) -> Self {
                    KilnNativeObject::$variant(handle)
                }
            }
        )*
    };
}

native_object_from!(
    Resource(KilnNativeResource),
    Sampler(KilnNativeSampler),
    BindGroupLayout(KilnNativeBindGroupLayout),
    RootSignature(KilnNativeRootSignature),
    Pipeline(KilnNativePipeline),
    QueryHeap(KilnNativeQueryHeap),
    DescriptorHeap(KilnNativeDescriptorHeap),
    SwapChain(KilnNativeSwapChain),
    Queue(KilnNativeQueue),
    Fence(KilnNativeFence),
    CommandAllocator(KilnNativeCommandAllocator),
    CommandList(KilnNativeCommandList)
);

impl KilnNativeObject {
    pub fn null_id(&self) -> Option<NullObjectId> {
        match self {
            KilnNativeObject::Resource(x) => x.null_id(),
            KilnNativeObject::Sampler(x) => x.null_id(),
            KilnNativeObject::BindGroupLayout(x) => x.null_id(),
            KilnNativeObject::RootSignature(x) => x.null_id(),
            KilnNativeObject::Pipeline(x) => x.null_id(),
            KilnNativeObject::QueryHeap(x) => x.null_id(),
            KilnNativeObject::DescriptorHeap(x) => x.null_id(),
            KilnNativeObject::SwapChain(x) => x.null_id(),
            KilnNativeObject::Queue(x) => x.null_id(),
            KilnNativeObject::Fence(x) => x.null_id(),
            KilnNativeObject::CommandAllocator(x) => x.null_id(),
            KilnNativeObject::CommandList(x) => x.null_id(),
        }
    }
}

/// A view written into a descriptor heap slot
#[derive(Clone, Debug, PartialEq)]
pub enum KilnNativeDescriptor {
    ConstantBufferView {
        resource: KilnNativeResource,
        offset: u64,
        size: u64,
    },
    BufferShaderResourceView {
        resource: KilnNativeResource,
        offset: u64,
        size: u64,
    },
    BufferUnorderedAccessView {
        resource: KilnNativeResource,
        offset: u64,
        size: u64,
    },
    TextureShaderResourceView {
        resource: KilnNativeResource,
        format: KilnFormat,
        dimension: KilnTextureDimension,
        mip_count: u32,
    },
    TextureUnorderedAccessView {
        resource: KilnNativeResource,
        format: KilnFormat,
        mip_level: u32,
    },
    Sampler(KilnNativeSampler),
    RenderTargetView {
        resource: KilnNativeResource,
        format: KilnFormat,
        mip_level: u32,
        array_layer: u32,
    },
    DepthStencilView {
        resource: KilnNativeResource,
        format: KilnFormat,
        mip_level: u32,
        array_layer: u32,
        read_only: bool,
    },
    NullConstantBufferView,
    NullShaderResourceView,
    NullUnorderedAccessView,
    /// Linear filtering, clamp addressing
    DefaultSampler,
}

/// One entry of a native barrier batch
#[derive(Clone, Debug, PartialEq)]
pub enum KilnNativeBarrier {
    /// Legacy state transition. `subresource` of `None` means every subresource.
    Transition {
        resource: KilnNativeResource,
        subresource: Option<u32>,
        state_before: KilnResourceState,
        state_after: KilnResourceState,
    },
    /// Legacy unordered access barrier. `None` orders every UAV access.
    UnorderedAccess { resource: Option<KilnNativeResource> },
    Texture {
        resource: KilnNativeResource,
        subresource: Option<u32>,
        before: KilnTextureLayoutSync,
        after: KilnTextureLayoutSync,
    },
    Buffer {
        resource: KilnNativeResource,
        sync_before: KilnBarrierSync,
        sync_after: KilnBarrierSync,
        access_before: KilnBarrierAccess,
        access_after: KilnBarrierAccess,
    },
    Global {
        sync_before: KilnBarrierSync,
        sync_after: KilnBarrierSync,
        access_before: KilnBarrierAccess,
        access_after: KilnBarrierAccess,
    },
}

/// Slot of a root signature
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KilnNativeRootParameter {
    DescriptorTable {
        heap_type: KilnDescriptorHeapType,
        descriptor_count: u32,
        visibility: KilnShaderStageFlags,
    },
    Constants {
        size_in_bytes: u32,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KilnNativeRootSignatureDesc {
    pub parameters: Vec<KilnNativeRootParameter>,
}

/// A single command recorded into a native command list
#[derive(Clone, Debug, PartialEq)]
pub enum KilnNativeCommand {
    ResourceBarriers(Vec<KilnNativeBarrier>),
    SetDescriptorHeaps {
        resource_heap: KilnNativeDescriptorHeap,
        sampler_heap: KilnNativeDescriptorHeap,
    },
    SetRootSignature {
        compute: bool,
        root_signature: KilnNativeRootSignature,
    },
    SetPipeline(KilnNativePipeline),
    SetRootDescriptorTable {
        compute: bool,
        root_parameter_index: u32,
        heap_type: KilnDescriptorHeapType,
        base_descriptor: u32,
    },
    SetRootConstants {
        compute: bool,
        root_parameter_index: u32,
        data: Vec<u8>,
    },
    SetVertexBuffer {
        slot: u32,
        resource: KilnNativeResource,
        offset: u64,
        size: u64,
        stride: u32,
    },
    SetIndexBuffer {
        resource: KilnNativeResource,
        offset: u64,
        size: u64,
        index_type: KilnIndexType,
    },
    SetPrimitiveTopology(KilnPrimitiveTopology),
    SetViewport(KilnViewport),
    SetScissorRect(KilnScissorRect),
    SetStencilReference(u32),
    SetRenderTargets {
        render_target_views: Vec<u32>,
        depth_stencil_view: Option<u32>,
    },
    ClearRenderTarget {
        render_target_view: u32,
        color: KilnColorClearValue,
    },
    ClearDepthStencil {
        depth_stencil_view: u32,
        value: KilnDepthStencilClearValue,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    DrawIndirect {
        indexed: bool,
        resource: KilnNativeResource,
        offset: u64,
        draw_count: u32,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    DispatchIndirect {
        resource: KilnNativeResource,
        offset: u64,
    },
    CopyBufferRegion {
        dst: KilnNativeResource,
        dst_offset: u64,
        src: KilnNativeResource,
        src_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        dst: KilnNativeResource,
        dst_subresource: u32,
        src: KilnNativeResource,
        src_offset: u64,
        row_pitch: u32,
        extents: KilnExtents3D,
        format: KilnFormat,
    },
    ResolveSubresource {
        dst: KilnNativeResource,
        dst_subresource: u32,
        src: KilnNativeResource,
        src_subresource: u32,
        format: KilnFormat,
    },
    BeginQuery {
        query_heap: KilnNativeQueryHeap,
        query_type: KilnQueryType,
        index: u32,
    },
    EndQuery {
        query_heap: KilnNativeQueryHeap,
        query_type: KilnQueryType,
        index: u32,
    },
    ResolveQueryData {
        query_heap: KilnNativeQueryHeap,
        query_type: KilnQueryType,
        first_query: u32,
        query_count: u32,
        dst: KilnNativeResource,
        dst_offset: u64,
    },
    BeginEvent(String),
    EndEvent,
    SetMarker(String),
}

/// The native device of the active backend
#[derive(Clone)]
pub enum KilnNativeDevice {
    Null(Arc<NullDevice>),
}

impl std::fmt::Debug for KilnNativeDevice {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter,
    ) -> std::fmt::Result {
        match self {
            KilnNativeDevice::Null(_) => f.debug_tuple("KilnNativeDevice::Null").finish(),
        }
    }
}

impl KilnNativeDevice {
    pub fn backend_type(&self) -> KilnBackendType {
        match self {
            KilnNativeDevice::Null(_) => KilnBackendType::Null,
        }
    }

    pub fn null_device(&self) -> Option<&NullDevice> {
        match self {
            KilnNativeDevice::Null(inner) => Some(inner),
        }
    }

    pub fn adapter_name(&self) -> String {
        match self {
            KilnNativeDevice::Null(inner) => inner.adapter_name(),
        }
    }

    pub fn timestamp_frequency(&self) -> u64 {
        match self {
            KilnNativeDevice::Null(inner) => inner.timestamp_frequency(),
        }
    }

    pub fn supports_feature(
        &self,
        feature: KilnFeature,
    ) -> bool {
        match self {
            KilnNativeDevice::Null(inner) => inner.supports_feature(feature),
        }
    }

    pub fn format_support(
        &self,
        format: KilnFormat,
    ) -> KilnFormatSupport {
        match self {
            KilnNativeDevice::Null(inner) => inner.format_support(format),
        }
    }

    /// Called from an arbitrary thread when the native device is removed or reset
    pub fn set_device_removed_callback(
        &self,
        callback: Box<dyn Fn() + Send + Sync>,
    ) {
        match self {
            KilnNativeDevice::Null(inner) => inner.set_device_removed_callback(callback),
        }
    }

    pub fn destroy(
        &self,
        object: KilnNativeObject,
    ) {
        match self {
            KilnNativeDevice::Null(inner) => inner.destroy(object),
        }
    }

    //
    // Queues and synchronization
    //
    pub fn create_queue(
        &self,
        queue_type: KilnQueueType,
    ) -> KilnResult<KilnNativeQueue> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_queue(queue_type),
        }
    }

    pub fn create_fence(
        &self,
        initial_value: u64,
    ) -> KilnResult<KilnNativeFence> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_fence(initial_value),
        }
    }

    pub fn fence_completed_value(
        &self,
        fence: KilnNativeFence,
    ) -> KilnResult<u64> {
        match self {
            KilnNativeDevice::Null(inner) => inner.fence_completed_value(fence),
        }
    }

    /// Block the calling thread until the fence reaches the value
    pub fn wait_for_fence(
        &self,
        fence: KilnNativeFence,
        value: u64,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.wait_for_fence(fence, value),
        }
    }

    pub fn execute_command_lists(
        &self,
        queue: KilnNativeQueue,
        command_lists: &[KilnNativeCommandList],
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.execute_command_lists(queue, command_lists),
        }
    }

    pub fn queue_signal(
        &self,
        queue: KilnNativeQueue,
        fence: KilnNativeFence,
        value: u64,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.queue_signal(queue, fence, value),
        }
    }

    /// GPU-side wait. The queue does not run further work until the fence reaches the value.
    pub fn queue_wait(
        &self,
        queue: KilnNativeQueue,
        fence: KilnNativeFence,
        value: u64,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.queue_wait(queue, fence, value),
        }
    }

    //
    // Command recording
    //
    pub fn create_command_allocator(
        &self,
        queue_type: KilnQueueType,
    ) -> KilnResult<KilnNativeCommandAllocator> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_command_allocator(queue_type),
        }
    }

    pub fn reset_command_allocator(
        &self,
        allocator: KilnNativeCommandAllocator,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.reset_command_allocator(allocator),
        }
    }

    /// Command lists are created closed
    pub fn create_command_list(
        &self,
        queue_type: KilnQueueType,
    ) -> KilnResult<KilnNativeCommandList> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_command_list(queue_type),
        }
    }

    pub fn reset_command_list(
        &self,
        command_list: KilnNativeCommandList,
        allocator: KilnNativeCommandAllocator,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.reset_command_list(command_list, allocator),
        }
    }

    pub fn close_command_list(
        &self,
        command_list: KilnNativeCommandList,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.close_command_list(command_list),
        }
    }

    pub fn record(
        &self,
        command_list: KilnNativeCommandList,
        command: KilnNativeCommand,
    ) {
        match self {
            KilnNativeDevice::Null(inner) => inner.record(command_list, command),
        }
    }

    //
    // Resources
    //
    pub fn create_buffer(
        &self,
        buffer_def: &KilnBufferDef,
        initial_state: KilnResourceState,
    ) -> KilnResult<KilnNativeResource> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_buffer(buffer_def, initial_state),
        }
    }

    pub fn create_texture(
        &self,
        texture_def: &KilnTextureDef,
        initial_state: KilnResourceState,
    ) -> KilnResult<KilnNativeResource> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_texture(texture_def, initial_state),
        }
    }

    /// Write through the persistent mapping of a CPU-visible buffer
    pub fn write_mapped(
        &self,
        resource: KilnNativeResource,
        offset: u64,
        data: &[u8],
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.write_mapped(resource, offset, data),
        }
    }

    /// Read through the persistent mapping of a CPU-visible buffer
    pub fn read_mapped(
        &self,
        resource: KilnNativeResource,
        offset: u64,
        length: u64,
    ) -> KilnResult<Vec<u8>> {
        match self {
            KilnNativeDevice::Null(inner) => inner.read_mapped(resource, offset, length),
        }
    }

    pub fn create_sampler(
        &self,
        sampler_def: &KilnSamplerDef,
    ) -> KilnResult<KilnNativeSampler> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_sampler(sampler_def),
        }
    }

    pub fn create_bind_group_layout(
        &self,
        bind_group_layout_def: &KilnBindGroupLayoutDef,
    ) -> KilnResult<KilnNativeBindGroupLayout> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_bind_group_layout(bind_group_layout_def),
        }
    }

    pub fn create_root_signature(
        &self,
        desc: &KilnNativeRootSignatureDesc,
    ) -> KilnResult<KilnNativeRootSignature> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_root_signature(desc),
        }
    }

    pub fn create_render_pipeline(
        &self,
        root_signature: KilnNativeRootSignature,
        pipeline_def: &KilnRenderPipelineDef,
    ) -> KilnResult<KilnNativePipeline> {
        match self {
            KilnNativeDevice::Null(inner) => {
                inner.create_render_pipeline(root_signature, pipeline_def)
            }
        }
    }

    pub fn create_compute_pipeline(
        &self,
        root_signature: KilnNativeRootSignature,
        pipeline_def: &KilnComputePipelineDef,
    ) -> KilnResult<KilnNativePipeline> {
        match self {
            KilnNativeDevice::Null(inner) => {
                inner.create_compute_pipeline(root_signature, pipeline_def)
            }
        }
    }

    pub fn create_query_heap(
        &self,
        query_heap_def: &KilnQueryHeapDef,
    ) -> KilnResult<KilnNativeQueryHeap> {
        match self {
            KilnNativeDevice::Null(inner) => inner.create_query_heap(query_heap_def),
        }
    }

    //
    // Descriptors
    //
    pub fn create_descriptor_heap(
        &self,
        heap_type: KilnDescriptorHeapType,
        capacity: u32,
        shader_visible: bool,
    ) -> KilnResult<KilnNativeDescriptorHeap> {
        match self {
            KilnNativeDevice::Null(inner) => {
                inner.create_descriptor_heap(heap_type, capacity, shader_visible)
            }
        }
    }

    pub fn write_descriptor(
        &self,
        heap: KilnNativeDescriptorHeap,
        index: u32,
        descriptor: &KilnNativeDescriptor,
    ) {
        match self {
            KilnNativeDevice::Null(inner) => inner.write_descriptor(heap, index, descriptor),
        }
    }

    /// Copy a contiguous run of descriptors. The source heap must be CPU-only.
    pub fn copy_descriptors(
        &self,
        dst_heap: KilnNativeDescriptorHeap,
        dst_index: u32,
        src_heap: KilnNativeDescriptorHeap,
        src_index: u32,
        count: u32,
    ) {
        match self {
            KilnNativeDevice::Null(inner) => {
                inner.copy_descriptors(dst_heap, dst_index, src_heap, src_index, count)
            }
        }
    }

    //
    // Presentation
    //
    pub fn create_swap_chain(
        &self,
        queue: KilnNativeQueue,
        surface: &KilnSurfaceHandle,
        swap_chain_def: &KilnSwapChainDef,
    ) -> KilnResult<KilnNativeSwapChain> {
        match self {
            KilnNativeDevice::Null(inner) => {
                inner.create_swap_chain(queue, surface, swap_chain_def)
            }
        }
    }

    /// Back buffers are owned by the swap chain and must not be destroyed individually
    pub fn swap_chain_back_buffers(
        &self,
        swap_chain: KilnNativeSwapChain,
    ) -> KilnResult<Vec<KilnNativeResource>> {
        match self {
            KilnNativeDevice::Null(inner) => inner.swap_chain_back_buffers(swap_chain),
        }
    }

    pub fn resize_swap_chain(
        &self,
        swap_chain: KilnNativeSwapChain,
        width: u32,
        height: u32,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.resize_swap_chain(swap_chain, width, height),
        }
    }

    pub fn current_back_buffer_index(
        &self,
        swap_chain: KilnNativeSwapChain,
    ) -> u32 {
        match self {
            KilnNativeDevice::Null(inner) => inner.current_back_buffer_index(swap_chain),
        }
    }

    /// Fails with `KilnError::DeviceLost` if the device was removed while presenting
    pub fn present(
        &self,
        swap_chain: KilnNativeSwapChain,
        sync_interval: u32,
    ) -> KilnResult<()> {
        match self {
            KilnNativeDevice::Null(inner) => inner.present(swap_chain, sync_interval),
        }
    }
}
