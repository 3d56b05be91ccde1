#[cfg(feature = "serde-support")]
use serde::{Deserialize, Serialize};

use crate::*;

fn validation_error<T>(message: String) -> KilnResult<T> {
    Err(KilnError::ValidationError(message))
}

/// Capacities of the device's descriptor heaps
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnDescriptorHeapDef {
    /// Constant buffer/shader resource/unordered access heap pair
    pub resource_capacity: u32,
    pub sampler_capacity: u32,
    /// Render target views are allocated in CPU-only blocks of this many descriptors
    pub render_target_block_size: u32,
    pub depth_stencil_block_size: u32,
    pub overflow_policy: KilnHeapOverflowPolicy,
}

impl Default for KilnDescriptorHeapDef {
    fn default() -> Self {
        KilnDescriptorHeapDef {
            resource_capacity: 1_000_000,
            sampler_capacity: 2048,
            render_target_block_size: 1024,
            depth_stencil_block_size: 256,
            overflow_policy: KilnHeapOverflowPolicy::Fail,
        }
    }
}

impl KilnDescriptorHeapDef {
    pub fn verify(&self) -> KilnResult<()> {
        if self.resource_capacity == 0 || self.sampler_capacity == 0 {
            return validation_error("Descriptor heap capacities must be > 0".to_string());
        }

        if self.sampler_capacity > crate::MAX_SAMPLER_HEAP_CAPACITY {
            return validation_error(format!(
                "Sampler heap capacity {} exceeds the maximum of {}",
                self.sampler_capacity,
                crate::MAX_SAMPLER_HEAP_CAPACITY
            ));
        }

        if self.render_target_block_size == 0 || self.depth_stencil_block_size == 0 {
            return validation_error("View descriptor block sizes must be > 0".to_string());
        }

        Ok(())
    }
}

/// Capabilities the null backend reports, and how it behaves
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnNullDeviceDef {
    pub enhanced_barriers: bool,
    pub video_decode: bool,
    pub features: Vec<KilnFeature>,
    /// When false, signaled fence values complete immediately. When true they stay pending until
    /// something waits on them or `NullDevice::complete_pending_work` is called.
    pub deferred_fence_completion: bool,
}

impl Default for KilnNullDeviceDef {
    fn default() -> Self {
        KilnNullDeviceDef {
            enhanced_barriers: false,
            video_decode: false,
            features: vec![
                KilnFeature::SamplerMinMax,
                KilnFeature::TimestampQuery,
                KilnFeature::PipelineStatisticsQuery,
                KilnFeature::TextureCompressionBC,
                KilnFeature::IndirectFirstInstance,
            ],
            deferred_fence_completion: false,
        }
    }
}

/// Used to create a `KilnDevice`
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnDeviceDef {
    pub preferred_backend: KilnBackendPreference,
    pub validation_mode: KilnValidationMode,
    pub power_preference: KilnPowerPreference,
    pub descriptor_heaps: KilnDescriptorHeapDef,
    pub null: KilnNullDeviceDef,
    pub label: Option<String>,
}

impl KilnDeviceDef {
    pub fn verify(&self) -> KilnResult<()> {
        self.descriptor_heaps.verify()
    }
}

/// Used to create a `KilnBuffer`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnBufferDef {
    pub size: u64,
    pub memory_type: KilnMemoryType,
    pub usage: KilnBufferUsage,
    pub label: Option<String>,
}

impl Default for KilnBufferDef {
    fn default() -> Self {
        KilnBufferDef {
            size: 0,
            memory_type: KilnMemoryType::Private,
            usage: KilnBufferUsage::NONE,
            label: None,
        }
    }
}

impl KilnBufferDef {
    pub fn for_staging_buffer(size: u64) -> Self {
        KilnBufferDef {
            size,
            memory_type: KilnMemoryType::Upload,
            ..Default::default()
        }
    }

    pub fn verify(&self) -> KilnResult<()> {
        if self.size < 4 {
            return validation_error(format!("Buffer size must be >= 4, got {}", self.size));
        }

        if self.memory_type.is_cpu_visible() && self.usage.contains(KilnBufferUsage::SHADER_WRITE)
        {
            return validation_error(format!(
                "{:?} buffers cannot be written by shaders",
                self.memory_type
            ));
        }

        Ok(())
    }
}

/// Used to create a `KilnTexture`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnTextureDef {
    pub dimension: KilnTextureDimension,
    pub format: KilnFormat,
    pub extents: KilnExtents3D,
    pub mip_count: u32,
    pub sample_count: KilnSampleCount,
    pub usage: KilnTextureUsage,
    pub label: Option<String>,
}

impl Default for KilnTextureDef {
    fn default() -> Self {
        KilnTextureDef {
            dimension: KilnTextureDimension::Dim2D,
            format: KilnFormat::Undefined,
            extents: KilnExtents3D::default(),
            mip_count: 1,
            sample_count: KilnSampleCount::SampleCount1,
            usage: KilnTextureUsage::SHADER_READ,
            label: None,
        }
    }
}

impl KilnTextureDef {
    pub fn array_layer_count(&self) -> u32 {
        if self.dimension == KilnTextureDimension::Dim3D {
            1
        } else {
            self.extents.depth_or_array_layers
        }
    }

    pub fn depth(&self) -> u32 {
        if self.dimension == KilnTextureDimension::Dim3D {
            self.extents.depth_or_array_layers
        } else {
            1
        }
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_count * self.array_layer_count()
    }

    /// Native subresource index. Mips of a layer are contiguous.
    pub fn subresource_index(
        &self,
        mip_level: u32,
        array_layer: u32,
    ) -> u32 {
        mip_level + array_layer * self.mip_count
    }

    pub fn max_mip_count(&self) -> u32 {
        let largest = self
            .extents
            .width
            .max(self.extents.height)
            .max(self.depth())
            .max(1);
        32 - largest.leading_zeros()
    }

    pub fn verify(&self) -> KilnResult<()> {
        if self.format.is_undefined() {
            return validation_error("Texture format cannot be Undefined".to_string());
        }

        let extents = &self.extents;
        if extents.width < 1 || extents.height < 1 || extents.depth_or_array_layers < 1 {
            return validation_error(format!(
                "Texture extents must all be >= 1, got {:?}",
                extents
            ));
        }

        if self.mip_count < 1 || self.mip_count > self.max_mip_count() {
            return validation_error(format!(
                "Texture mip count must be in 1..={}, got {}",
                self.max_mip_count(),
                self.mip_count
            ));
        }

        if self.sample_count != KilnSampleCount::SampleCount1 && self.mip_count != 1 {
            return validation_error("Multisampled textures must have a single mip".to_string());
        }

        if self.dimension == KilnTextureDimension::Cube && extents.depth_or_array_layers % 6 != 0
        {
            return validation_error(format!(
                "Cube textures need a multiple of 6 layers, got {}",
                extents.depth_or_array_layers
            ));
        }

        if self.format.is_depth_stencil() && self.usage.contains(KilnTextureUsage::SHADER_WRITE) {
            return validation_error("Depth/stencil textures cannot be shader writable".to_string());
        }

        Ok(())
    }
}

/// Used to create a `KilnSampler`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnSamplerDef {
    pub min_filter: KilnFilterType,
    pub mag_filter: KilnFilterType,
    pub mip_filter: KilnFilterType,
    pub address_mode_u: KilnAddressMode,
    pub address_mode_v: KilnAddressMode,
    pub address_mode_w: KilnAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: u32,
    pub compare_op: Option<KilnCompareOp>,
    pub lod_min: f32,
    pub lod_max: f32,
    pub reduction: KilnSamplerReduction,
    pub label: Option<String>,
}

impl Default for KilnSamplerDef {
    fn default() -> Self {
        KilnSamplerDef {
            min_filter: KilnFilterType::Linear,
            mag_filter: KilnFilterType::Linear,
            mip_filter: KilnFilterType::Linear,
            address_mode_u: KilnAddressMode::ClampToEdge,
            address_mode_v: KilnAddressMode::ClampToEdge,
            address_mode_w: KilnAddressMode::ClampToEdge,
            mip_lod_bias: 0.0,
            max_anisotropy: 1,
            compare_op: None,
            lod_min: 0.0,
            lod_max: f32::MAX,
            reduction: KilnSamplerReduction::Standard,
            label: None,
        }
    }
}

impl KilnSamplerDef {
    pub fn verify(&self) -> KilnResult<()> {
        if self.max_anisotropy < 1 || self.max_anisotropy > 16 {
            return validation_error(format!(
                "Sampler max anisotropy must be in 1..=16, got {}",
                self.max_anisotropy
            ));
        }

        if self.lod_min > self.lod_max {
            return validation_error(format!(
                "Sampler lod_min {} is greater than lod_max {}",
                self.lod_min, self.lod_max
            ));
        }

        Ok(())
    }
}

/// The kind of resource a bind group layout slot expects
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnBindingKind {
    ConstantBuffer,
    /// Read-only structured/raw buffer
    Buffer,
    /// Read-write structured/raw buffer
    StorageBuffer,
    Texture,
    StorageTexture,
    Sampler,
}

impl KilnBindingKind {
    pub fn is_sampler(self) -> bool {
        self == KilnBindingKind::Sampler
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnBindGroupLayoutEntry {
    pub binding: u32,
    pub kind: KilnBindingKind,
    pub visibility: KilnShaderStageFlags,
    /// Number of array elements. Every element takes a descriptor slot.
    pub count: u32,
}

impl KilnBindGroupLayoutEntry {
    pub fn new(
        binding: u32,
        kind: KilnBindingKind,
        visibility: KilnShaderStageFlags,
    ) -> Self {
        KilnBindGroupLayoutEntry {
            binding,
            kind,
            visibility,
            count: 1,
        }
    }
}

/// Used to create a `KilnBindGroupLayout`
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnBindGroupLayoutDef {
    pub entries: Vec<KilnBindGroupLayoutEntry>,
    pub label: Option<String>,
}

impl KilnBindGroupLayoutDef {
    pub fn verify(&self) -> KilnResult<()> {
        let mut seen = fnv::FnvHashSet::default();
        for entry in &self.entries {
            if entry.count < 1 {
                return validation_error(format!(
                    "Binding {} has a count of 0",
                    entry.binding
                ));
            }

            if !seen.insert(entry.binding) {
                return validation_error(format!(
                    "Binding {} appears more than once in the layout",
                    entry.binding
                ));
            }
        }

        Ok(())
    }
}

/// A concrete resource bound to a bind group slot
#[derive(Clone, Debug)]
pub enum KilnBindingResource {
    ConstantBuffer {
        buffer: KilnBuffer,
        offset: u64,
        size: u64,
    },
    Buffer {
        buffer: KilnBuffer,
        offset: u64,
        size: u64,
    },
    StorageBuffer {
        buffer: KilnBuffer,
        offset: u64,
        size: u64,
    },
    Texture {
        texture: KilnTexture,
    },
    StorageTexture {
        texture: KilnTexture,
        mip_level: u32,
    },
    Sampler(KilnSampler),
}

impl KilnBindingResource {
    pub fn kind(&self) -> KilnBindingKind {
        match self {
            KilnBindingResource::ConstantBuffer { .. } => KilnBindingKind::ConstantBuffer,
            KilnBindingResource::Buffer { .. } => KilnBindingKind::Buffer,
            KilnBindingResource::StorageBuffer { .. } => KilnBindingKind::StorageBuffer,
            KilnBindingResource::Texture { .. } => KilnBindingKind::Texture,
            KilnBindingResource::StorageTexture { .. } => KilnBindingKind::StorageTexture,
            KilnBindingResource::Sampler(_) => KilnBindingKind::Sampler,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KilnBindGroupEntry {
    pub binding: u32,
    pub array_element: u32,
    pub resource: KilnBindingResource,
}

impl KilnBindGroupEntry {
    pub fn new(
        binding: u32,
        resource: KilnBindingResource,
    ) -> Self {
        KilnBindGroupEntry {
            binding,
            array_element: 0,
            resource,
        }
    }
}

/// Used to create a `KilnBindGroup`
#[derive(Clone, Debug)]
pub struct KilnBindGroupDef {
    pub layout: KilnBindGroupLayout,
    pub entries: Vec<KilnBindGroupEntry>,
    pub label: Option<String>,
}

impl KilnBindGroupDef {
    pub fn verify(&self) -> KilnResult<()> {
        if self.entries.is_empty() {
            return validation_error("Bind group must have at least one entry".to_string());
        }

        self.layout.verify_entries(&self.entries)
    }
}

/// Used to create a `KilnPipelineLayout`
#[derive(Clone, Debug, Default)]
pub struct KilnPipelineLayoutDef {
    pub bind_group_layouts: Vec<KilnBindGroupLayout>,
    /// Size of inline constants in bytes. Must be a multiple of 4.
    pub push_constant_size: u32,
    pub label: Option<String>,
}

impl KilnPipelineLayoutDef {
    pub fn verify(&self) -> KilnResult<()> {
        if self.bind_group_layouts.len() > crate::MAX_BIND_GROUPS {
            return validation_error(format!(
                "Pipeline layouts support at most {} bind groups, got {}",
                crate::MAX_BIND_GROUPS,
                self.bind_group_layouts.len()
            ));
        }

        if self.push_constant_size % 4 != 0 {
            return validation_error(format!(
                "Push constant size must be a multiple of 4, got {}",
                self.push_constant_size
            ));
        }

        Ok(())
    }
}

/// Compiled shader bytecode for one stage
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnShaderStageDef {
    pub stage: KilnShaderStageFlags,
    #[cfg_attr(feature = "serde-support", serde(with = "serde_bytes"))]
    pub bytecode: Vec<u8>,
    pub entry_point: String,
}

impl KilnShaderStageDef {
    pub fn verify(
        &self,
        expected_stage: KilnShaderStageFlags,
    ) -> KilnResult<()> {
        if self.stage != expected_stage {
            return validation_error(format!(
                "Expected a {:?} shader, got {:?}",
                expected_stage, self.stage
            ));
        }

        if self.bytecode.is_empty() {
            return validation_error(format!("{:?} shader bytecode is empty", self.stage));
        }

        if self.entry_point.is_empty() {
            return validation_error(format!("{:?} shader has no entry point", self.stage));
        }

        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnVertexAttribute {
    pub location: u32,
    pub format: KilnFormat,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnVertexBufferLayout {
    pub stride: u32,
    pub per_instance: bool,
    pub attributes: Vec<KilnVertexAttribute>,
}

/// Used to create a `KilnRenderPipeline`
#[derive(Clone, Debug)]
pub struct KilnRenderPipelineDef {
    pub layout: KilnPipelineLayout,
    pub vertex: Option<KilnShaderStageDef>,
    pub mesh: Option<KilnShaderStageDef>,
    pub fragment: Option<KilnShaderStageDef>,
    pub vertex_buffers: Vec<KilnVertexBufferLayout>,
    pub primitive_topology: KilnPrimitiveTopology,
    pub color_formats: Vec<KilnFormat>,
    pub depth_stencil_format: KilnFormat,
    pub sample_count: KilnSampleCount,
    pub label: Option<String>,
}

impl KilnRenderPipelineDef {
    pub fn verify(
        &self,
        mesh_shading_supported: bool,
    ) -> KilnResult<()> {
        match (&self.vertex, &self.mesh) {
            (Some(vertex), None) => vertex.verify(KilnShaderStageFlags::VERTEX)?,
            (None, Some(mesh)) => {
                if !mesh_shading_supported {
                    return validation_error(
                        "Mesh shader pipelines require KilnFeature::MeshShader".to_string(),
                    );
                }
                mesh.verify(KilnShaderStageFlags::MESH)?
            }
            (None, None) => {
                return validation_error(
                    "Render pipeline needs a vertex or mesh stage".to_string(),
                )
            }
            (Some(_), Some(_)) => {
                return validation_error(
                    "Render pipeline cannot have both a vertex and a mesh stage".to_string(),
                )
            }
        }

        if let Some(fragment) = &self.fragment {
            fragment.verify(KilnShaderStageFlags::FRAGMENT)?;
        }

        if self.color_formats.len() > crate::MAX_COLOR_ATTACHMENTS {
            return validation_error(format!(
                "Render pipelines support at most {} color attachments, got {}",
                crate::MAX_COLOR_ATTACHMENTS,
                self.color_formats.len()
            ));
        }

        for format in &self.color_formats {
            if format.is_undefined() || format.is_depth_stencil() {
                return validation_error(format!("{:?} is not a color format", format));
            }
        }

        if !self.depth_stencil_format.is_undefined() && !self.depth_stencil_format.is_depth_stencil()
        {
            return validation_error(format!(
                "{:?} is not a depth/stencil format",
                self.depth_stencil_format
            ));
        }

        Ok(())
    }
}

/// Used to create a `KilnComputePipeline`
#[derive(Clone, Debug)]
pub struct KilnComputePipelineDef {
    pub layout: KilnPipelineLayout,
    pub compute: KilnShaderStageDef,
    pub label: Option<String>,
}

impl KilnComputePipelineDef {
    pub fn verify(&self) -> KilnResult<()> {
        self.compute.verify(KilnShaderStageFlags::COMPUTE)
    }
}

/// Used to create a `KilnQueryHeap`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnQueryHeapDef {
    pub query_type: KilnQueryType,
    pub count: u32,
    pub label: Option<String>,
}

impl KilnQueryHeapDef {
    pub fn verify(&self) -> KilnResult<()> {
        if self.count == 0 || self.count > crate::MAX_QUERY_COUNT {
            return validation_error(format!(
                "Query count must be in 1..={}, got {}",
                crate::MAX_QUERY_COUNT,
                self.count
            ));
        }

        Ok(())
    }
}

/// Used to create a `KilnSwapChain`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnSwapChainDef {
    pub width: u32,
    pub height: u32,
    pub format: KilnFormat,
    pub present_mode: KilnPresentMode,
    pub label: Option<String>,
}

impl Default for KilnSwapChainDef {
    fn default() -> Self {
        KilnSwapChainDef {
            width: 0,
            height: 0,
            format: KilnFormat::B8G8R8A8Unorm,
            present_mode: KilnPresentMode::Fifo,
            label: None,
        }
    }
}

impl KilnSwapChainDef {
    pub fn verify(&self) -> KilnResult<()> {
        if self.width == 0 || self.height == 0 {
            return validation_error(format!(
                "Swap chain size must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }

        if self.format.is_undefined() {
            return validation_error("Swap chain format cannot be Undefined".to_string());
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct KilnColorAttachment {
    pub texture: KilnTexture,
    pub mip_level: u32,
    pub array_layer: u32,
    pub load_op: KilnLoadOp,
    pub store_op: KilnStoreOp,
    pub clear_value: KilnColorClearValue,
    /// Multisampled attachments are resolved into this texture when the pass ends
    pub resolve_target: Option<KilnTexture>,
    pub resolve_mip_level: u32,
    pub resolve_array_layer: u32,
}

impl KilnColorAttachment {
    pub fn new(texture: KilnTexture) -> Self {
        KilnColorAttachment {
            texture,
            mip_level: 0,
            array_layer: 0,
            load_op: KilnLoadOp::Load,
            store_op: KilnStoreOp::Store,
            clear_value: Default::default(),
            resolve_target: None,
            resolve_mip_level: 0,
            resolve_array_layer: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KilnDepthStencilAttachment {
    pub texture: KilnTexture,
    pub mip_level: u32,
    pub array_layer: u32,
    pub load_op: KilnLoadOp,
    pub store_op: KilnStoreOp,
    pub clear_value: KilnDepthStencilClearValue,
    pub read_only: bool,
}

/// Attachments for `KilnCommandBuffer::begin_render_pass`
#[derive(Clone, Debug, Default)]
pub struct KilnRenderPassDef {
    pub color_attachments: Vec<KilnColorAttachment>,
    pub depth_stencil_attachment: Option<KilnDepthStencilAttachment>,
    pub label: Option<String>,
}

impl KilnRenderPassDef {
    pub fn verify(&self) -> KilnResult<()> {
        if self.color_attachments.len() > crate::MAX_COLOR_ATTACHMENTS {
            return validation_error(format!(
                "Render passes support at most {} color attachments, got {}",
                crate::MAX_COLOR_ATTACHMENTS,
                self.color_attachments.len()
            ));
        }

        if self.color_attachments.is_empty() && self.depth_stencil_attachment.is_none() {
            return validation_error("Render pass has no attachments".to_string());
        }

        for attachment in &self.color_attachments {
            let def = attachment.texture.texture_def();
            if !def.usage.contains(KilnTextureUsage::RENDER_TARGET) || def.format.is_depth_stencil()
            {
                return validation_error(format!(
                    "Texture {:?} cannot be used as a color attachment",
                    def.label
                ));
            }

            if attachment.mip_level >= def.mip_count
                || attachment.array_layer >= def.array_layer_count()
            {
                return validation_error(format!(
                    "Color attachment mip {} layer {} is out of range",
                    attachment.mip_level, attachment.array_layer
                ));
            }
        }

        if let Some(attachment) = &self.depth_stencil_attachment {
            let def = attachment.texture.texture_def();
            if !def.usage.contains(KilnTextureUsage::RENDER_TARGET)
                || !def.format.is_depth_stencil()
            {
                return validation_error(format!(
                    "Texture {:?} cannot be used as a depth/stencil attachment",
                    def.label
                ));
            }

            if attachment.mip_level >= def.mip_count
                || attachment.array_layer >= def.array_layer_count()
            {
                return validation_error(format!(
                    "Depth/stencil attachment mip {} layer {} is out of range",
                    attachment.mip_level, attachment.array_layer
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture_def() -> KilnTextureDef {
        KilnTextureDef {
            format: KilnFormat::R8G8B8A8Unorm,
            extents: KilnExtents3D {
                width: 256,
                height: 128,
                depth_or_array_layers: 1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_buffer_def_minimum_size() {
        let mut def = KilnBufferDef {
            size: 3,
            ..Default::default()
        };
        assert!(matches!(def.verify(), Err(KilnError::ValidationError(_))));

        def.size = 4;
        assert!(def.verify().is_ok());
    }

    #[test]
    fn test_upload_buffer_cannot_be_shader_writable() {
        let def = KilnBufferDef {
            size: 64,
            memory_type: KilnMemoryType::Upload,
            usage: KilnBufferUsage::SHADER_WRITE,
            label: None,
        };
        assert!(matches!(def.verify(), Err(KilnError::ValidationError(_))));
    }

    #[test]
    fn test_texture_def_validation() {
        assert!(texture_def().verify().is_ok());

        let mut def = texture_def();
        def.format = KilnFormat::Undefined;
        assert!(def.verify().is_err());

        let mut def = texture_def();
        def.extents.height = 0;
        assert!(def.verify().is_err());

        let mut def = texture_def();
        def.mip_count = 9;
        assert!(def.verify().is_ok());
        def.mip_count = 10;
        assert!(def.verify().is_err());

        let mut def = texture_def();
        def.dimension = KilnTextureDimension::Cube;
        def.extents.depth_or_array_layers = 4;
        assert!(def.verify().is_err());
        def.extents.depth_or_array_layers = 12;
        assert!(def.verify().is_ok());
    }

    #[test]
    fn test_subresource_index() {
        let def = KilnTextureDef {
            mip_count: 4,
            extents: KilnExtents3D {
                width: 16,
                height: 16,
                depth_or_array_layers: 3,
            },
            ..texture_def()
        };

        assert_eq!(12, def.subresource_count());
        assert_eq!(0, def.subresource_index(0, 0));
        assert_eq!(3, def.subresource_index(3, 0));
        assert_eq!(9, def.subresource_index(1, 2));
    }

    #[test]
    fn test_bind_group_layout_duplicate_binding() {
        let def = KilnBindGroupLayoutDef {
            entries: vec![
                KilnBindGroupLayoutEntry::new(
                    0,
                    KilnBindingKind::Texture,
                    KilnShaderStageFlags::FRAGMENT,
                ),
                KilnBindGroupLayoutEntry::new(
                    0,
                    KilnBindingKind::Sampler,
                    KilnShaderStageFlags::FRAGMENT,
                ),
            ],
            label: None,
        };
        assert!(matches!(def.verify(), Err(KilnError::ValidationError(_))));
    }

    #[test]
    fn test_shader_stage_validation() {
        let stage = KilnShaderStageDef {
            stage: KilnShaderStageFlags::COMPUTE,
            bytecode: vec![],
            entry_point: "main".to_string(),
        };
        assert!(stage.verify(KilnShaderStageFlags::COMPUTE).is_err());

        let stage = KilnShaderStageDef {
            bytecode: vec![1, 2, 3, 4],
            ..stage
        };
        assert!(stage.verify(KilnShaderStageFlags::COMPUTE).is_ok());
        assert!(stage.verify(KilnShaderStageFlags::VERTEX).is_err());
    }

    #[test]
    fn test_query_heap_count_limits() {
        let mut def = KilnQueryHeapDef {
            query_type: KilnQueryType::Occlusion,
            count: 0,
            label: None,
        };
        assert!(def.verify().is_err());
        def.count = crate::MAX_QUERY_COUNT;
        assert!(def.verify().is_ok());
        def.count += 1;
        assert!(def.verify().is_err());
    }

    #[test]
    fn test_swap_chain_def_validation() {
        let mut def = KilnSwapChainDef {
            width: 1280,
            height: 720,
            ..Default::default()
        };
        assert!(def.verify().is_ok());
        def.height = 0;
        assert!(def.verify().is_err());
    }
}
