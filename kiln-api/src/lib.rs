//! Backend-agnostic GPU device, command and resource layer.
//!
//! `KilnDevice` is the entry point. It owns one queue per queue type, paces frames with
//! `commit_frame` and defers destruction of every native object until the GPU can no longer be
//! using it. Resources are cheap-to-clone handles that retire their native object when the last
//! clone is dropped.
//!
//! Only the null backend is compiled in. It performs no GPU work, records every native call and
//! can inject failures, which makes it suitable for headless runs and tests.

pub mod backends;

mod error;
pub use error::*;

mod types;
pub use types::*;

pub mod descriptor_heap;
pub use descriptor_heap::*;

pub mod device_context;
pub use device_context::*;

pub mod barrier;
pub use barrier::*;

pub mod buffer;
pub use buffer::*;

pub mod texture;
pub use texture::*;

pub mod sampler;
pub use sampler::*;

pub mod bind_group_layout;
pub use bind_group_layout::*;

pub mod bind_group;
pub use bind_group::*;

pub mod pipeline_layout;
pub use pipeline_layout::*;

pub mod pipeline;
pub use pipeline::*;

pub mod query_heap;
pub use query_heap::*;

pub mod command_buffer;
pub use command_buffer::*;

pub mod queue;
pub use queue::*;

pub mod upload;
pub use upload::*;

pub mod swapchain;
pub use swapchain::*;

pub mod device;
pub use device::*;

/// Frames the CPU may record ahead of the GPU. Retired objects wait this many frames before they
/// are destroyed.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Pending barriers are flushed to the command list in batches of this size
pub const MAX_BARRIER_BATCH: usize = 16;

pub const MAX_BIND_GROUPS: usize = 4;
pub const MAX_COLOR_ATTACHMENTS: usize = 8;
pub const MAX_QUERY_COUNT: u32 = 4096;
pub const MAX_SAMPLER_HEAP_CAPACITY: u32 = 2048;

/// Smallest staging buffer the copy allocator creates
pub const MIN_UPLOAD_CONTEXT_SIZE: u64 = 64 * 1024;

/// Fence values carry the command list type of their queue above this bit
pub const FENCE_QUEUE_TYPE_SHIFT: u32 = 56;
