use super::Generation;
use super::GenerationIndex;
use super::SlabIndexT;
use std::marker::PhantomData;

/// Handle into a `GenSlab`. Holds the slot index and the generation the value was stored under.
pub struct GenSlabKey<T> {
    index: SlabIndexT,
    generation_index: GenerationIndex,
    phantom_data: PhantomData<T>,
}

impl<T> GenSlabKey<T> {
    fn new(
        index: SlabIndexT,
        generation_index: GenerationIndex,
    ) -> GenSlabKey<T> {
        GenSlabKey::<T> {
            index,
            generation_index,
            phantom_data: PhantomData,
        }
    }

    pub fn index(&self) -> SlabIndexT {
        self.index
    }

    pub fn generation_index(&self) -> GenerationIndex {
        self.generation_index
    }
}

impl<T> Clone for GenSlabKey<T> {
    fn clone(&self) -> Self {
        GenSlabKey::new(self.index, self.generation_index)
    }
}

impl<T> Copy for GenSlabKey<T> {}

impl<T> Eq for GenSlabKey<T> {}

impl<T> PartialEq for GenSlabKey<T> {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.index == other.index && self.generation_index == other.generation_index
    }
}

impl<T> std::hash::Hash for GenSlabKey<T> {
    fn hash<H: std::hash::Hasher>(
        &self,
        state: &mut H,
    ) {
        self.index.hash(state);
        self.generation_index.hash(state);
    }
}

impl<T> std::fmt::Debug for GenSlabKey<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter,
    ) -> std::fmt::Result {
        write!(f, "GenSlabKey({}v{})", self.index, self.generation_index)
    }
}

/// A slab where each slot carries a generation counter.
///
/// The generation of a slot is bumped whenever a value is stored in it, so a key that outlives
/// its value can never be used to reach whatever is stored there later.
pub struct GenSlab<T> {
    storage: Vec<Generation<T>>,
    free_list: Vec<SlabIndexT>,
}

impl<T> Default for GenSlab<T> {
    fn default() -> Self {
        Self::with_capacity(32)
    }
}

impl<T> GenSlab<T> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: SlabIndexT) -> Self {
        let mut storage = Vec::with_capacity(capacity as usize);
        let mut free_list = Vec::with_capacity(capacity as usize);

        // Pushed in reverse so that slot 0 is handed out first
        for index in (0..capacity).rev() {
            storage.push(Generation::<T>::new());
            free_list.push(index);
        }

        GenSlab { storage, free_list }
    }

    /// Store a value, returning a key that resolves to it until it is freed
    pub fn allocate(
        &mut self,
        value: T,
    ) -> GenSlabKey<T> {
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.storage[index as usize];
            assert!(slot.is_none());
            let generation_index = slot.allocate(value);
            GenSlabKey::new(index, generation_index)
        } else {
            let mut slot = Generation::new();
            let generation_index = slot.allocate(value);
            let index = self.storage.len() as SlabIndexT;
            self.storage.push(slot);
            GenSlabKey::new(index, generation_index)
        }
    }

    /// Remove and return the value. Panics if the key is stale or was already freed.
    pub fn free(
        &mut self,
        slab_key: &GenSlabKey<T>,
    ) -> T {
        let value = self
            .storage
            .get_mut(slab_key.index as usize)
            .and_then(|slot| slot.free(slab_key.generation_index));

        match value {
            Some(value) => {
                self.free_list.push(slab_key.index);
                value
            }
            None => panic!("tried to free a none value"),
        }
    }

    pub fn exists(
        &self,
        slab_key: &GenSlabKey<T>,
    ) -> bool {
        self.storage
            .get(slab_key.index as usize)
            .map(|slot| slot.exists(slab_key.generation_index))
            .unwrap_or(false)
    }

    pub fn get(
        &self,
        slab_key: &GenSlabKey<T>,
    ) -> Option<&T> {
        self.storage
            .get(slab_key.index as usize)
            .and_then(|slot| slot.get(slab_key.generation_index))
    }

    pub fn get_mut(
        &mut self,
        slab_key: &GenSlabKey<T>,
    ) -> Option<&mut T> {
        self.storage
            .get_mut(slab_key.index as usize)
            .and_then(|slot| slot.get_mut(slab_key.generation_index))
    }

    /// Iterate all live values along with the keys that currently resolve to them
    pub fn iter(&self) -> impl Iterator<Item = (GenSlabKey<T>, &T)> {
        self.storage
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.get_unchecked().map(|value| {
                    (
                        GenSlabKey::new(index as SlabIndexT, slot.generation_index()),
                        value,
                    )
                })
            })
    }

    /// Number of live values
    pub fn count(&self) -> usize {
        self.storage.len() - self.free_list.len()
    }

    /// Remove every live value. Keys issued before this call no longer resolve.
    pub fn drain(&mut self) -> Vec<T> {
        let mut values = Vec::with_capacity(self.count());
        for (index, slot) in self.storage.iter_mut().enumerate() {
            let generation_index = slot.generation_index();
            if let Some(value) = slot.free(generation_index) {
                self.free_list.push(index as SlabIndexT);
                values.push(value);
            }
        }

        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TestObject {
        id: u32,
    }

    impl TestObject {
        fn new(id: u32) -> Self {
            TestObject { id }
        }
    }

    #[test]
    fn test_allocate_free_one() {
        let mut slab = GenSlab::<TestObject>::new();
        let key = slab.allocate(TestObject::new(123));

        assert_eq!(1, slab.count());
        assert_eq!(TestObject::new(123), slab.free(&key));
        assert_eq!(0, slab.count());
    }

    #[test]
    #[should_panic(expected = "tried to free a none value")]
    fn test_double_free() {
        let mut slab = GenSlab::<TestObject>::new();
        let key = slab.allocate(TestObject::new(123));
        slab.free(&key);
        slab.free(&key);
    }

    #[test]
    fn test_allocate_free_many_reverse_order() {
        let mut slab = GenSlab::<TestObject>::with_capacity(4);
        let keys: Vec<_> = (0..100).map(|i| slab.allocate(TestObject::new(i))).collect();
        assert_eq!(100, slab.count());

        for key in keys.iter().rev() {
            slab.free(key);
        }

        assert_eq!(0, slab.count());
    }

    #[test]
    fn test_stale_key_does_not_resolve() {
        let mut slab = GenSlab::<TestObject>::new();
        let first_key = slab.allocate(TestObject::new(1));
        slab.free(&first_key);

        let second_key = slab.allocate(TestObject::new(2));

        assert_eq!(first_key.index(), second_key.index());
        assert_ne!(first_key.generation_index(), second_key.generation_index());
        assert!(!slab.exists(&first_key));
        assert!(slab.get(&first_key).is_none());
        assert!(slab.get_mut(&first_key).is_none());
        assert_eq!(2, slab.get(&second_key).unwrap().id);
    }

    #[test]
    #[should_panic(expected = "tried to free a none value")]
    fn test_free_stale_key() {
        let mut slab = GenSlab::<TestObject>::new();
        let first_key = slab.allocate(TestObject::new(1));
        slab.free(&first_key);
        let _second_key = slab.allocate(TestObject::new(2));
        slab.free(&first_key);
    }

    #[test]
    fn test_get_mut() {
        let mut slab = GenSlab::<TestObject>::new();
        let key = slab.allocate(TestObject::new(5));
        slab.get_mut(&key).unwrap().id = 6;
        assert_eq!(6, slab.get(&key).unwrap().id);
    }

    #[test]
    fn test_iter_returns_live_keys() {
        let mut slab = GenSlab::<TestObject>::new();
        let a = slab.allocate(TestObject::new(1));
        let b = slab.allocate(TestObject::new(2));
        let c = slab.allocate(TestObject::new(3));
        slab.free(&b);

        let live: Vec<_> = slab.iter().map(|(key, value)| (key, value.id)).collect();
        assert_eq!(vec![(a, 1), (c, 3)], live);
    }

    #[test]
    fn test_drain() {
        let mut slab = GenSlab::<TestObject>::new();
        let a = slab.allocate(TestObject::new(1));
        slab.allocate(TestObject::new(2));

        let drained = slab.drain();
        assert_eq!(2, drained.len());
        assert_eq!(0, slab.count());
        assert!(!slab.exists(&a));

        // Slots are reusable after a drain
        let d = slab.allocate(TestObject::new(4));
        assert_eq!(4, slab.get(&d).unwrap().id);
    }
}
