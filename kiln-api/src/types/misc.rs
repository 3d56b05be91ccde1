#[cfg(feature = "serde-support")]
use serde::{Deserialize, Serialize};

/// The native API a device is running on
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnBackendType {
    /// No-op backend that records every native call. Used for headless runs and tests.
    Null,
    D3D12,
    Vulkan,
}

/// Which backend the device should try to create
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnBackendPreference {
    /// Pick the best backend compiled into this build
    Default,
    Null,
    D3D12,
    Vulkan,
}

impl Default for KilnBackendPreference {
    fn default() -> Self {
        KilnBackendPreference::Default
    }
}

/// Controls if validation is enabled or not. The requirements/behaviors of validation is
/// API-specific.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnValidationMode {
    Disabled,
    Enabled,
    /// Enabled, and info-level messages from the native layer are logged as well
    Verbose,
    /// Enabled, plus GPU-based validation where the backend has it
    Gpu,
}

impl Default for KilnValidationMode {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        let validation_mode = KilnValidationMode::Enabled;
        #[cfg(not(debug_assertions))]
        let validation_mode = KilnValidationMode::Disabled;

        validation_mode
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnPowerPreference {
    Default,
    LowPower,
    HighPerformance,
}

impl Default for KilnPowerPreference {
    fn default() -> Self {
        KilnPowerPreference::Default
    }
}

/// What to do when a descriptor heap cannot fit an allocation
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnHeapOverflowPolicy {
    /// Return `KilnError::DescriptorHeapFull`
    Fail,
    /// Recreate the heap pair at the next power of two and copy the live descriptors over
    Grow,
}

impl Default for KilnHeapOverflowPolicy {
    fn default() -> Self {
        KilnHeapOverflowPolicy::Fail
    }
}

/// Used to indicate which type of queue to use. Some operations require certain types of queues.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnQueueType {
    /// Graphics queues support all operations
    Graphics,

    /// Compute queues can dispatch and copy, but cannot draw
    Compute,

    /// Copy queues only copy
    Copy,

    /// Only created when the backend reports video decode support
    VideoDecode,
}

impl KilnQueueType {
    pub const ALL: [KilnQueueType; 4] = [
        KilnQueueType::Graphics,
        KilnQueueType::Compute,
        KilnQueueType::Copy,
        KilnQueueType::VideoDecode,
    ];

    pub fn index(self) -> usize {
        match self {
            KilnQueueType::Graphics => 0,
            KilnQueueType::Compute => 1,
            KilnQueueType::Copy => 2,
            KilnQueueType::VideoDecode => 3,
        }
    }

    /// The native command list type. Stored in the top 8 bits of every fence value signaled on a
    /// queue of this type.
    pub fn command_list_type(self) -> u64 {
        match self {
            KilnQueueType::Graphics => 0,
            KilnQueueType::Compute => 2,
            KilnQueueType::Copy => 3,
            KilnQueueType::VideoDecode => 4,
        }
    }

    /// First fence value this queue type will ever signal is `fence_base() | 1`
    pub fn fence_base(self) -> u64 {
        self.command_list_type() << crate::FENCE_QUEUE_TYPE_SHIFT
    }

    /// Recovers the queue type a fence value was signaled on
    pub fn from_fence_value(fence_value: u64) -> Option<KilnQueueType> {
        let command_list_type = fence_value >> crate::FENCE_QUEUE_TYPE_SHIFT;
        KilnQueueType::ALL
            .iter()
            .copied()
            .find(|x| x.command_list_type() == command_list_type)
    }
}

/// Optional capabilities that may or may not be supported by a device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnFeature {
    /// Sync/access/layout barriers instead of single-state transitions
    EnhancedBarriers,
    /// Min/max sampler reduction
    SamplerMinMax,
    TimestampQuery,
    PipelineStatisticsQuery,
    MeshShader,
    RayTracing,
    Predication,
    VideoDecode,
    TextureCompressionBC,
    IndirectFirstInstance,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KilnFenceStatus {
    /// The fence value was signaled and the GPU has passed it
    Complete,
    /// The fence value was signaled but the GPU has not passed it yet
    Incomplete,
    /// The fence value has not been signaled on the queue yet
    Unsubmitted,
}

/// Where a resource's memory lives
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnMemoryType {
    /// Device-local, not CPU visible. Filled through the copy allocator.
    Private,
    /// CPU-writable, persistently mapped
    Upload,
    /// CPU-readable, persistently mapped
    Readback,
}

impl Default for KilnMemoryType {
    fn default() -> Self {
        KilnMemoryType::Private
    }
}

impl KilnMemoryType {
    pub fn is_cpu_visible(self) -> bool {
        self != KilnMemoryType::Private
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct KilnBufferUsage: u32 {
        const NONE = 0;
        const VERTEX = 1<<0;
        const INDEX = 1<<1;
        const CONSTANT = 1<<2;
        const SHADER_READ = 1<<3;
        const SHADER_WRITE = 1<<4;
        const INDIRECT = 1<<5;
        const PREDICATION = 1<<6;
        const RAY_TRACING = 1<<7;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct KilnTextureUsage: u32 {
        const NONE = 0;
        const SHADER_READ = 1<<0;
        const SHADER_WRITE = 1<<1;
        /// Color or depth/stencil attachment, depending on the format
        const RENDER_TARGET = 1<<2;
        const TRANSIENT = 1<<3;
        const SHADING_RATE = 1<<4;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct KilnShaderStageFlags: u32 {
        const NONE = 0;
        const VERTEX = 1<<0;
        const FRAGMENT = 1<<1;
        const COMPUTE = 1<<2;
        const AMPLIFICATION = 1<<3;
        const MESH = 1<<4;
        const ALL_GRAPHICS = 0x01 | 0x02 | 0x08 | 0x10;
        const ALL = 0x01 | 0x02 | 0x04 | 0x08 | 0x10;
    }
}

bitflags::bitflags! {
    /// What a format can be used for on this device
    #[derive(Default)]
    pub struct KilnFormatSupport: u32 {
        const NONE = 0;
        const SHADER_READ = 1<<0;
        const SHADER_WRITE = 1<<1;
        const RENDER_TARGET = 1<<2;
        const DEPTH_STENCIL = 1<<3;
        const BLENDABLE = 1<<4;
        const MULTISAMPLE = 1<<5;
        const VERTEX_BUFFER = 1<<6;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnTextureDimension {
    Dim1D,
    Dim2D,
    Dim3D,
    Cube,
}

impl Default for KilnTextureDimension {
    fn default() -> Self {
        KilnTextureDimension::Dim2D
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnSampleCount {
    SampleCount1,
    SampleCount2,
    SampleCount4,
    SampleCount8,
}

impl Default for KilnSampleCount {
    fn default() -> Self {
        KilnSampleCount::SampleCount1
    }
}

impl KilnSampleCount {
    pub fn as_u32(self) -> u32 {
        match self {
            KilnSampleCount::SampleCount1 => 1,
            KilnSampleCount::SampleCount2 => 2,
            KilnSampleCount::SampleCount4 => 4,
            KilnSampleCount::SampleCount8 => 8,
        }
    }
}

/// A 2d size for windows, textures, etc.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnExtents2D {
    pub width: u32,
    pub height: u32,
}

/// A 3d size for textures. For array and cube textures `depth_or_array_layers` is the layer count.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnExtents3D {
    pub width: u32,
    pub height: u32,
    pub depth_or_array_layers: u32,
}

impl Default for KilnExtents3D {
    fn default() -> Self {
        KilnExtents3D {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        }
    }
}

impl KilnExtents3D {
    pub fn to_2d(self) -> KilnExtents2D {
        KilnExtents2D {
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnPresentMode {
    Immediate,
    Mailbox,
    Fifo,
}

impl Default for KilnPresentMode {
    fn default() -> Self {
        KilnPresentMode::Fifo
    }
}

impl KilnPresentMode {
    pub fn back_buffer_count(self) -> u32 {
        match self {
            KilnPresentMode::Immediate | KilnPresentMode::Fifo => 2,
            KilnPresentMode::Mailbox => 3,
        }
    }

    pub fn sync_interval(self) -> u32 {
        match self {
            KilnPresentMode::Fifo => 1,
            KilnPresentMode::Immediate | KilnPresentMode::Mailbox => 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnQueryType {
    Occlusion,
    BinaryOcclusion,
    Timestamp,
    PipelineStatistics,
}

impl KilnQueryType {
    /// Bytes written per query by `resolve_query`
    pub fn result_size(self) -> u64 {
        match self {
            KilnQueryType::PipelineStatistics => 11 * 8,
            _ => 8,
        }
    }

    pub fn required_feature(self) -> Option<KilnFeature> {
        match self {
            KilnQueryType::Timestamp => Some(KilnFeature::TimestampQuery),
            KilnQueryType::PipelineStatistics => Some(KilnFeature::PipelineStatisticsQuery),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnIndexType {
    Uint16,
    Uint32,
}

impl KilnIndexType {
    pub fn index_size_in_bytes(self) -> u32 {
        match self {
            KilnIndexType::Uint16 => 2,
            KilnIndexType::Uint32 => 4,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnPrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

impl Default for KilnPrimitiveTopology {
    fn default() -> Self {
        KilnPrimitiveTopology::TriangleList
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnFilterType {
    Nearest,
    Linear,
}

impl Default for KilnFilterType {
    fn default() -> Self {
        KilnFilterType::Linear
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnAddressMode {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

impl Default for KilnAddressMode {
    fn default() -> Self {
        KilnAddressMode::ClampToEdge
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnCompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnSamplerReduction {
    Standard,
    Comparison,
    Minimum,
    Maximum,
}

impl Default for KilnSamplerReduction {
    fn default() -> Self {
        KilnSamplerReduction::Standard
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnLoadOp {
    DontCare,
    Load,
    Clear,
}

impl Default for KilnLoadOp {
    fn default() -> Self {
        KilnLoadOp::DontCare
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnStoreOp {
    DontCare,
    Store,
}

impl Default for KilnStoreOp {
    fn default() -> Self {
        KilnStoreOp::Store
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnColorClearValue(pub [f32; 4]);

#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub struct KilnDepthStencilClearValue {
    pub depth: f32,
    pub stencil: u32,
}

impl Default for KilnDepthStencilClearValue {
    fn default() -> Self {
        KilnDepthStencilClearValue {
            depth: 1.0,
            stencil: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct KilnViewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct KilnScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Information about the device, mostly limits, requirements (like memory alignment), and flags to
/// indicate whether certain features are supported
#[derive(Clone, Debug)]
pub struct KilnDeviceInfo {
    pub backend_type: KilnBackendType,
    pub adapter_name: String,
    pub max_bind_groups: u32,
    pub max_barrier_batch: u32,
    pub resource_heap_capacity: u32,
    pub sampler_heap_capacity: u32,
    pub min_constant_buffer_offset_alignment: u32,
    pub upload_texture_alignment: u32,
    pub upload_texture_row_alignment: u32,
    /// Ticks per second of timestamp queries
    pub timestamp_frequency: u64,
    pub supports_enhanced_barriers: bool,
    pub supports_video_decode: bool,
}
