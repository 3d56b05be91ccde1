//! Lowest level crate of `kiln`. Includes the generation-checked slab that backs the device's
//! object arena, the frame-delayed retirement queue and some basic memory helpers

pub mod slab;

pub mod memory;

mod retirement_queue;
pub use retirement_queue::RetirementQueue;
