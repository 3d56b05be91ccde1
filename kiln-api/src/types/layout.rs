//! Abstract texture layouts and buffer states, and their translation into the two native barrier
//! models: single resource states (legacy) and sync/access/layout triples (enhanced).

#[cfg(feature = "serde-support")]
use serde::{Deserialize, Serialize};

use crate::KilnQueueType;

/// How a texture subresource's memory is currently organized/accessible
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
pub enum KilnTextureLayout {
    Undefined,
    CopySource,
    CopyDest,
    ResolveSource,
    ResolveDest,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthWrite,
    DepthRead,
    Present,
    ShadingRateSurface,
}

impl Default for KilnTextureLayout {
    fn default() -> Self {
        KilnTextureLayout::Undefined
    }
}

bitflags::bitflags! {
    /// Legacy native resource states. A resource is in exactly one combination of these at a time
    /// and moves between them with transition barriers.
    pub struct KilnResourceState: u32 {
        const COMMON = 0;
        const PRESENT = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        const NON_PIXEL_SHADER_RESOURCE = 0x40;
        const PIXEL_SHADER_RESOURCE = 0x80;
        const SHADER_RESOURCE = 0x40 | 0x80;
        const STREAM_OUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const GENERIC_READ = 0x1 | 0x2 | 0x40 | 0x80 | 0x200 | 0x800;
        const VIDEO_DECODE_READ = 0x10000;
        const VIDEO_DECODE_WRITE = 0x20000;
        const SHADING_RATE_SOURCE = 0x1000000;
    }
}

impl KilnResourceState {
    /// States a queue of the given type is allowed to transition resources into. `COMMON` is
    /// always allowed.
    pub fn valid_states_for_queue(queue_type: KilnQueueType) -> KilnResourceState {
        match queue_type {
            KilnQueueType::Graphics => KilnResourceState::all(),
            KilnQueueType::Compute => {
                KilnResourceState::UNORDERED_ACCESS
                    | KilnResourceState::NON_PIXEL_SHADER_RESOURCE
                    | KilnResourceState::COPY_DEST
                    | KilnResourceState::COPY_SOURCE
            }
            KilnQueueType::Copy => KilnResourceState::COPY_DEST | KilnResourceState::COPY_SOURCE,
            KilnQueueType::VideoDecode => {
                KilnResourceState::VIDEO_DECODE_READ | KilnResourceState::VIDEO_DECODE_WRITE
            }
        }
    }

    pub fn is_valid_for_queue(
        self,
        queue_type: KilnQueueType,
    ) -> bool {
        KilnResourceState::valid_states_for_queue(queue_type).contains(self)
    }
}

bitflags::bitflags! {
    /// How a buffer is about to be used. Unlike textures, a buffer may be in several read states at
    /// once.
    #[derive(Default)]
    #[cfg_attr(feature = "serde-support", derive(Serialize, Deserialize))]
    pub struct KilnBufferStates: u32 {
        const UNDEFINED = 0;
        const VERTEX = 1<<0;
        const INDEX = 1<<1;
        const CONSTANT = 1<<2;
        const SHADER_READ = 1<<3;
        const SHADER_WRITE = 1<<4;
        const INDIRECT = 1<<5;
        const COPY_SOURCE = 1<<6;
        const COPY_DEST = 1<<7;
        const GENERIC_READ = 0x01 | 0x02 | 0x04 | 0x08 | 0x20 | 0x40;
    }
}

bitflags::bitflags! {
    /// Pipeline stages that must complete before (or wait for) a barrier in the enhanced model
    pub struct KilnBarrierSync: u32 {
        const NONE = 0;
        const ALL = 0x1;
        const DRAW = 0x2;
        const INDEX_INPUT = 0x4;
        const VERTEX_SHADING = 0x8;
        const PIXEL_SHADING = 0x10;
        const DEPTH_STENCIL = 0x20;
        const RENDER_TARGET = 0x40;
        const COMPUTE_SHADING = 0x80;
        const RAYTRACING = 0x100;
        const COPY = 0x200;
        const RESOLVE = 0x400;
        const EXECUTE_INDIRECT = 0x800;
        const ALL_SHADING = 0x1000;
        const VIDEO_DECODE = 0x100000;
    }
}

bitflags::bitflags! {
    /// Memory accesses made visible by a barrier in the enhanced model
    pub struct KilnBarrierAccess: u32 {
        const COMMON = 0;
        const VERTEX_BUFFER = 0x1;
        const CONSTANT_BUFFER = 0x2;
        const INDEX_BUFFER = 0x4;
        const RENDER_TARGET = 0x8;
        const UNORDERED_ACCESS = 0x10;
        const DEPTH_STENCIL_WRITE = 0x20;
        const DEPTH_STENCIL_READ = 0x40;
        const SHADER_RESOURCE = 0x80;
        const STREAM_OUTPUT = 0x100;
        const INDIRECT_ARGUMENT = 0x200;
        const COPY_DEST = 0x400;
        const COPY_SOURCE = 0x800;
        const RESOLVE_DEST = 0x1000;
        const RESOLVE_SOURCE = 0x2000;
        const SHADING_RATE_SOURCE = 0x40000;
        const VIDEO_DECODE_READ = 0x80000;
        const VIDEO_DECODE_WRITE = 0x100000;
        const NO_ACCESS = 0x80000000;
    }
}

/// Native texture layouts in the enhanced model
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KilnBarrierLayout {
    Undefined,
    Common,
    Present,
    RenderTarget,
    UnorderedAccess,
    DepthStencilWrite,
    DepthStencilRead,
    ShaderResource,
    CopySource,
    CopyDest,
    ResolveSource,
    ResolveDest,
    ShadingRateSource,
}

/// One side of an enhanced texture barrier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KilnTextureLayoutSync {
    pub layout: KilnBarrierLayout,
    pub sync: KilnBarrierSync,
    pub access: KilnBarrierAccess,
}

impl KilnTextureLayout {
    /// Legacy state for this layout. Shader resources are only pixel-visible on graphics queues.
    pub fn to_resource_state(
        self,
        queue_type: KilnQueueType,
    ) -> KilnResourceState {
        match self {
            KilnTextureLayout::Undefined => KilnResourceState::COMMON,
            KilnTextureLayout::CopySource => KilnResourceState::COPY_SOURCE,
            KilnTextureLayout::CopyDest => KilnResourceState::COPY_DEST,
            KilnTextureLayout::ResolveSource => KilnResourceState::RESOLVE_SOURCE,
            KilnTextureLayout::ResolveDest => KilnResourceState::RESOLVE_DEST,
            KilnTextureLayout::ShaderResource => {
                if queue_type == KilnQueueType::Graphics {
                    KilnResourceState::SHADER_RESOURCE
                } else {
                    KilnResourceState::NON_PIXEL_SHADER_RESOURCE
                }
            }
            KilnTextureLayout::UnorderedAccess => KilnResourceState::UNORDERED_ACCESS,
            KilnTextureLayout::RenderTarget => KilnResourceState::RENDER_TARGET,
            KilnTextureLayout::DepthWrite => KilnResourceState::DEPTH_WRITE,
            KilnTextureLayout::DepthRead => KilnResourceState::DEPTH_READ,
            KilnTextureLayout::Present => KilnResourceState::PRESENT,
            KilnTextureLayout::ShadingRateSurface => KilnResourceState::SHADING_RATE_SOURCE,
        }
    }

    /// Layout/sync/access for this layout in the enhanced model
    pub fn to_layout_sync(self) -> KilnTextureLayoutSync {
        let (layout, sync, access) = match self {
            KilnTextureLayout::Undefined => (
                KilnBarrierLayout::Undefined,
                KilnBarrierSync::NONE,
                KilnBarrierAccess::NO_ACCESS,
            ),
            KilnTextureLayout::CopySource => (
                KilnBarrierLayout::CopySource,
                KilnBarrierSync::COPY,
                KilnBarrierAccess::COPY_SOURCE,
            ),
            KilnTextureLayout::CopyDest => (
                KilnBarrierLayout::CopyDest,
                KilnBarrierSync::COPY,
                KilnBarrierAccess::COPY_DEST,
            ),
            KilnTextureLayout::ResolveSource => (
                KilnBarrierLayout::ResolveSource,
                KilnBarrierSync::RESOLVE,
                KilnBarrierAccess::RESOLVE_SOURCE,
            ),
            KilnTextureLayout::ResolveDest => (
                KilnBarrierLayout::ResolveDest,
                KilnBarrierSync::RESOLVE,
                KilnBarrierAccess::RESOLVE_DEST,
            ),
            KilnTextureLayout::ShaderResource => (
                KilnBarrierLayout::ShaderResource,
                KilnBarrierSync::ALL_SHADING,
                KilnBarrierAccess::SHADER_RESOURCE,
            ),
            KilnTextureLayout::UnorderedAccess => (
                KilnBarrierLayout::UnorderedAccess,
                KilnBarrierSync::ALL_SHADING,
                KilnBarrierAccess::UNORDERED_ACCESS,
            ),
            KilnTextureLayout::RenderTarget => (
                KilnBarrierLayout::RenderTarget,
                KilnBarrierSync::RENDER_TARGET,
                KilnBarrierAccess::RENDER_TARGET,
            ),
            KilnTextureLayout::DepthWrite => (
                KilnBarrierLayout::DepthStencilWrite,
                KilnBarrierSync::DEPTH_STENCIL,
                KilnBarrierAccess::DEPTH_STENCIL_WRITE,
            ),
            KilnTextureLayout::DepthRead => (
                KilnBarrierLayout::DepthStencilRead,
                KilnBarrierSync::DEPTH_STENCIL,
                KilnBarrierAccess::DEPTH_STENCIL_READ,
            ),
            KilnTextureLayout::Present => (
                KilnBarrierLayout::Present,
                KilnBarrierSync::ALL,
                KilnBarrierAccess::COMMON,
            ),
            KilnTextureLayout::ShadingRateSurface => (
                KilnBarrierLayout::ShadingRateSource,
                KilnBarrierSync::PIXEL_SHADING,
                KilnBarrierAccess::SHADING_RATE_SOURCE,
            ),
        };

        KilnTextureLayoutSync {
            layout,
            sync,
            access,
        }
    }
}

impl KilnBufferStates {
    pub fn to_resource_state(
        self,
        queue_type: KilnQueueType,
    ) -> KilnResourceState {
        let mut state = KilnResourceState::COMMON;
        if self.intersects(KilnBufferStates::VERTEX | KilnBufferStates::CONSTANT) {
            state |= KilnResourceState::VERTEX_AND_CONSTANT_BUFFER;
        }
        if self.contains(KilnBufferStates::INDEX) {
            state |= KilnResourceState::INDEX_BUFFER;
        }
        if self.contains(KilnBufferStates::SHADER_READ) {
            state |= KilnResourceState::NON_PIXEL_SHADER_RESOURCE;
            if queue_type == KilnQueueType::Graphics {
                state |= KilnResourceState::PIXEL_SHADER_RESOURCE;
            }
        }
        if self.contains(KilnBufferStates::SHADER_WRITE) {
            state |= KilnResourceState::UNORDERED_ACCESS;
        }
        if self.contains(KilnBufferStates::INDIRECT) {
            state |= KilnResourceState::INDIRECT_ARGUMENT;
        }
        if self.contains(KilnBufferStates::COPY_SOURCE) {
            state |= KilnResourceState::COPY_SOURCE;
        }
        if self.contains(KilnBufferStates::COPY_DEST) {
            state |= KilnResourceState::COPY_DEST;
        }

        state
    }

    pub fn to_sync_access(self) -> (KilnBarrierSync, KilnBarrierAccess) {
        if self.is_empty() {
            return (KilnBarrierSync::NONE, KilnBarrierAccess::NO_ACCESS);
        }

        let mut sync = KilnBarrierSync::NONE;
        let mut access = KilnBarrierAccess::COMMON;
        if self.contains(KilnBufferStates::VERTEX) {
            sync |= KilnBarrierSync::VERTEX_SHADING;
            access |= KilnBarrierAccess::VERTEX_BUFFER;
        }
        if self.contains(KilnBufferStates::CONSTANT) {
            sync |= KilnBarrierSync::ALL_SHADING;
            access |= KilnBarrierAccess::CONSTANT_BUFFER;
        }
        if self.contains(KilnBufferStates::INDEX) {
            sync |= KilnBarrierSync::INDEX_INPUT;
            access |= KilnBarrierAccess::INDEX_BUFFER;
        }
        if self.contains(KilnBufferStates::SHADER_READ) {
            sync |= KilnBarrierSync::ALL_SHADING;
            access |= KilnBarrierAccess::SHADER_RESOURCE;
        }
        if self.contains(KilnBufferStates::SHADER_WRITE) {
            sync |= KilnBarrierSync::ALL_SHADING;
            access |= KilnBarrierAccess::UNORDERED_ACCESS;
        }
        if self.contains(KilnBufferStates::INDIRECT) {
            sync |= KilnBarrierSync::EXECUTE_INDIRECT;
            access |= KilnBarrierAccess::INDIRECT_ARGUMENT;
        }
        if self.contains(KilnBufferStates::COPY_SOURCE) {
            sync |= KilnBarrierSync::COPY;
            access |= KilnBarrierAccess::COPY_SOURCE;
        }
        if self.contains(KilnBufferStates::COPY_DEST) {
            sync |= KilnBarrierSync::COPY;
            access |= KilnBarrierAccess::COPY_DEST;
        }

        (sync, access)
    }
}
