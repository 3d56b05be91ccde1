//! Slab storage where every slot is stamped with a generation so that stale keys never resolve
//! to a later occupant of the same slot.

mod gen_slab;
pub use gen_slab::GenSlab;
pub use gen_slab::GenSlabKey;

/// Raw index of a slot within a slab
pub type SlabIndexT = u32;

/// Counter bumped every time a slot is reused
pub type GenerationIndex = u32;

/// A single slot: an optional value and the generation of the value currently (or most recently)
/// stored in it
pub(crate) struct Generation<T> {
    value: Option<T>,
    generation_index: GenerationIndex,
}

impl<T> Generation<T> {
    pub(crate) fn new() -> Self {
        Generation {
            value: None,
            generation_index: 0,
        }
    }

    pub(crate) fn generation_index(&self) -> GenerationIndex {
        self.generation_index
    }

    pub(crate) fn is_none(&self) -> bool {
        self.value.is_none()
    }

    /// Store a value in the empty slot, returning the generation it was stored under
    pub(crate) fn allocate(
        &mut self,
        value: T,
    ) -> GenerationIndex {
        assert!(self.value.is_none());
        self.generation_index = self.generation_index.wrapping_add(1);
        self.value = Some(value);
        self.generation_index
    }

    /// Take the value out if it is still the given generation
    pub(crate) fn free(
        &mut self,
        generation_index: GenerationIndex,
    ) -> Option<T> {
        if self.generation_index == generation_index {
            self.value.take()
        } else {
            None
        }
    }

    pub(crate) fn exists(
        &self,
        generation_index: GenerationIndex,
    ) -> bool {
        self.generation_index == generation_index && self.value.is_some()
    }

    pub(crate) fn get(
        &self,
        generation_index: GenerationIndex,
    ) -> Option<&T> {
        if self.generation_index == generation_index {
            self.value.as_ref()
        } else {
            None
        }
    }

    pub(crate) fn get_mut(
        &mut self,
        generation_index: GenerationIndex,
    ) -> Option<&mut T> {
        if self.generation_index == generation_index {
            self.value.as_mut()
        } else {
            None
        }
    }

    pub(crate) fn get_unchecked(&self) -> Option<&T> {
        self.value.as_ref()
    }
}
