use crate::backends::{KilnNativeDescriptor, KilnNativeDescriptorHeap, KilnNativeDevice};
use crate::*;
use fnv::FnvHashSet;
use std::sync::Mutex;

// https://graphics.stanford.edu/~seander/bithacks.html#RoundUpPowerOf2
fn next_power_of_two(mut v: u32) -> u32 {
    v = v.saturating_sub(1);
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v.saturating_add(1)
}

/// Hands out contiguous runs of slots from a fixed-capacity heap. Slots past `bump` have never
/// been handed out. Released runs go to a sorted free list and are merged with their neighbors.
#[derive(Debug)]
pub struct KilnRangeAllocator {
    capacity: u32,
    bump: u32,
    // (first, count), sorted by first, never adjacent
    free_ranges: Vec<(u32, u32)>,
    allocated_count: u32,
}

impl KilnRangeAllocator {
    pub fn new(capacity: u32) -> Self {
        KilnRangeAllocator {
            capacity,
            bump: 0,
            free_ranges: Default::default(),
            allocated_count: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// One past the highest slot ever handed out and not yet returned to the bump region
    pub fn high_water_mark(&self) -> u32 {
        self.bump
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated_count
    }

    pub fn allocate(
        &mut self,
        count: u32,
    ) -> Option<u32> {
        debug_assert!(count > 0);

        if self.capacity - self.bump >= count {
            let first = self.bump;
            self.bump += count;
            self.allocated_count += count;
            return Some(first);
        }

        let index = self.free_ranges.iter().position(|(_, x)| *x >= count)?;
        let (first, free_count) = self.free_ranges[index];
        if free_count == count {
            self.free_ranges.remove(index);
        } else {
            self.free_ranges[index] = (first + count, free_count - count);
        }

        self.allocated_count += count;
        Some(first)
    }

    pub fn release(
        &mut self,
        first: u32,
        count: u32,
    ) -> KilnResult<()> {
        let end = first
            .checked_add(count)
            .filter(|end| count > 0 && *end <= self.bump)
            .ok_or_else(|| {
                KilnError::PreconditionViolation(format!(
                    "Released descriptor range {}..+{} was never allocated",
                    first, count
                ))
            })?;

        let index = self.free_ranges.partition_point(|(x, _)| *x < first);
        let overlaps_previous = index > 0 && {
            let (prev_first, prev_count) = self.free_ranges[index - 1];
            prev_first + prev_count > first
        };
        let overlaps_next = index < self.free_ranges.len() && self.free_ranges[index].0 < end;
        if overlaps_previous || overlaps_next {
            return Err(KilnError::PreconditionViolation(format!(
                "Descriptor range {}..{} was released twice",
                first, end
            )));
        }

        self.free_ranges.insert(index, (first, count));
        self.allocated_count -= count;

        // Merge with the next range, then with the previous one
        if index + 1 < self.free_ranges.len() && self.free_ranges[index + 1].0 == end {
            self.free_ranges[index].1 += self.free_ranges[index + 1].1;
            self.free_ranges.remove(index + 1);
        }

        let mut merged = index;
        if index > 0 {
            let (prev_first, prev_count) = self.free_ranges[index - 1];
            if prev_first + prev_count == first {
                self.free_ranges[index - 1].1 += self.free_ranges[index].1;
                self.free_ranges.remove(index);
                merged = index - 1;
            }
        }

        // A free range touching the bump pointer goes back into the bump region
        if merged + 1 == self.free_ranges.len() {
            let (last_first, last_count) = self.free_ranges[merged];
            if last_first + last_count == self.bump {
                self.bump = last_first;
                self.free_ranges.pop();
            }
        }

        Ok(())
    }

    pub fn grow(
        &mut self,
        new_capacity: u32,
    ) {
        assert!(new_capacity >= self.capacity);
        self.capacity = new_capacity;
    }
}

/// Result of `KilnDescriptorHeap::allocate`
#[derive(Debug)]
pub struct KilnDescriptorAllocation {
    pub first: u32,
    /// Native heaps replaced because the pair grew. They may still be referenced by command lists
    /// in flight and must go through the retirement queue.
    pub replaced_heaps: Vec<KilnNativeDescriptorHeap>,
}

struct KilnDescriptorHeapInner {
    cpu_heap: KilnNativeDescriptorHeap,
    gpu_heap: KilnNativeDescriptorHeap,
    allocator: KilnRangeAllocator,
    generation: u32,
}

/// A CPU-only staging heap and a shader-visible heap of the same capacity. Descriptors are written
/// into the staging heap and copied into the shader-visible heap at the same index.
pub struct KilnDescriptorHeap {
    device: KilnNativeDevice,
    heap_type: KilnDescriptorHeapType,
    overflow_policy: KilnHeapOverflowPolicy,
    max_capacity: u32,
    inner: Mutex<KilnDescriptorHeapInner>,
}

impl std::fmt::Debug for KilnDescriptorHeap {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("KilnDescriptorHeap")
            .field("heap_type", &self.heap_type)
            .field("capacity", &inner.allocator.capacity())
            .field("allocated", &inner.allocator.allocated_count())
            .field("generation", &inner.generation)
            .finish()
    }
}

impl KilnDescriptorHeap {
    pub fn new(
        device: &KilnNativeDevice,
        heap_type: KilnDescriptorHeapType,
        capacity: u32,
        overflow_policy: KilnHeapOverflowPolicy,
    ) -> KilnResult<Self> {
        let cpu_heap = device.create_descriptor_heap(heap_type, capacity, false)?;
        let gpu_heap = match device.create_descriptor_heap(heap_type, capacity, true) {
            Ok(heap) => heap,
            Err(e) => {
                device.destroy(cpu_heap.into());
                return Err(e);
            }
        };

        let max_capacity = if heap_type == KilnDescriptorHeapType::Sampler {
            crate::MAX_SAMPLER_HEAP_CAPACITY
        } else {
            u32::MAX
        };

        Ok(KilnDescriptorHeap {
            device: device.clone(),
            heap_type,
            overflow_policy,
            max_capacity,
            inner: Mutex::new(KilnDescriptorHeapInner {
                cpu_heap,
                gpu_heap,
                allocator: KilnRangeAllocator::new(capacity),
                generation: 0,
            }),
        })
    }

    pub fn heap_type(&self) -> KilnDescriptorHeapType {
        self.heap_type
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().unwrap().allocator.capacity()
    }

    pub fn allocated_count(&self) -> u32 {
        self.inner.lock().unwrap().allocator.allocated_count()
    }

    /// The shader-visible heap and its generation. The generation changes whenever the heap is
    /// replaced by a larger one.
    pub fn shader_visible_heap(&self) -> (KilnNativeDescriptorHeap, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.gpu_heap, inner.generation)
    }

    pub fn allocate(
        &self,
        count: u32,
    ) -> KilnResult<KilnDescriptorAllocation> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(first) = inner.allocator.allocate(count) {
            return Ok(KilnDescriptorAllocation {
                first,
                replaced_heaps: Vec::default(),
            });
        }

        let capacity = inner.allocator.capacity();
        let new_capacity = next_power_of_two(capacity.saturating_add(count)).min(self.max_capacity);
        if self.overflow_policy == KilnHeapOverflowPolicy::Fail
            || new_capacity - inner.allocator.high_water_mark() < count
        {
            return Err(KilnError::DescriptorHeapFull {
                heap: self.heap_type,
                requested: count,
                capacity,
            });
        }

        let replaced_heaps = self.grow(&mut *inner, new_capacity)?;
        let first = inner
            .allocator
            .allocate(count)
            .ok_or_else(|| KilnError::DescriptorHeapFull {
                heap: self.heap_type,
                requested: count,
                capacity: new_capacity,
            })?;

        Ok(KilnDescriptorAllocation {
            first,
            replaced_heaps,
        })
    }

    fn grow(
        &self,
        inner: &mut KilnDescriptorHeapInner,
        new_capacity: u32,
    ) -> KilnResult<Vec<KilnNativeDescriptorHeap>> {
        log::debug!(
            "Growing {:?} descriptor heap {} -> {}",
            self.heap_type,
            inner.allocator.capacity(),
            new_capacity
        );

        let cpu_heap = self
            .device
            .create_descriptor_heap(self.heap_type, new_capacity, false)?;
        let gpu_heap = match self
            .device
            .create_descriptor_heap(self.heap_type, new_capacity, true)
        {
            Ok(heap) => heap,
            Err(e) => {
                self.device.destroy(cpu_heap.into());
                return Err(e);
            }
        };

        // The staging heap mirrors the shader-visible one, so both new heaps are filled from it
        let used = inner.allocator.high_water_mark();
        if used > 0 {
            self.device
                .copy_descriptors(cpu_heap, 0, inner.cpu_heap, 0, used);
            self.device
                .copy_descriptors(gpu_heap, 0, inner.cpu_heap, 0, used);
        }

        let old_cpu_heap = std::mem::replace(&mut inner.cpu_heap, cpu_heap);
        let old_gpu_heap = std::mem::replace(&mut inner.gpu_heap, gpu_heap);
        inner.allocator.grow(new_capacity);
        inner.generation += 1;

        Ok(vec![old_cpu_heap, old_gpu_heap])
    }

    pub fn release(
        &self,
        first: u32,
        count: u32,
    ) -> KilnResult<()> {
        self.inner.lock().unwrap().allocator.release(first, count)
    }

    /// Write a contiguous table starting at `first` and publish it to the shader-visible heap with
    /// a single copy
    pub fn write_table(
        &self,
        first: u32,
        descriptors: &[KilnNativeDescriptor],
    ) {
        if descriptors.is_empty() {
            return;
        }

        let inner = self.inner.lock().unwrap();
        for (i, descriptor) in descriptors.iter().enumerate() {
            self.device
                .write_descriptor(inner.cpu_heap, first + i as u32, descriptor);
        }

        self.device.copy_descriptors(
            inner.gpu_heap,
            first,
            inner.cpu_heap,
            first,
            descriptors.len() as u32,
        );
    }
}

impl Drop for KilnDescriptorHeap {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap();
        self.device.destroy(inner.cpu_heap.into());
        self.device.destroy(inner.gpu_heap.into());
    }
}

struct KilnViewDescriptorAllocatorInner {
    blocks: Vec<KilnNativeDescriptorHeap>,
    free_list: Vec<u32>,
    allocated: FnvHashSet<u32>,
}

/// Single CPU-only descriptors for render target and depth/stencil views. Storage grows a block at
/// a time and is never shrunk.
pub struct KilnViewDescriptorAllocator {
    device: KilnNativeDevice,
    heap_type: KilnDescriptorHeapType,
    block_size: u32,
    inner: Mutex<KilnViewDescriptorAllocatorInner>,
}

impl KilnViewDescriptorAllocator {
    pub fn new(
        device: &KilnNativeDevice,
        heap_type: KilnDescriptorHeapType,
        block_size: u32,
    ) -> Self {
        KilnViewDescriptorAllocator {
            device: device.clone(),
            heap_type,
            block_size,
            inner: Mutex::new(KilnViewDescriptorAllocatorInner {
                blocks: Default::default(),
                free_list: Default::default(),
                allocated: Default::default(),
            }),
        }
    }

    pub fn heap_type(&self) -> KilnDescriptorHeapType {
        self.heap_type
    }

    pub fn allocated_count(&self) -> usize {
        self.inner.lock().unwrap().allocated.len()
    }

    /// Allocates a slot and writes the view into it. Returns the slot index.
    pub fn allocate(
        &self,
        descriptor: &KilnNativeDescriptor,
    ) -> KilnResult<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.free_list.is_empty() {
            let block = self
                .device
                .create_descriptor_heap(self.heap_type, self.block_size, false)?;
            let first = inner.blocks.len() as u32 * self.block_size;
            inner.blocks.push(block);
            inner.free_list.extend((first..first + self.block_size).rev());
        }

        // free_list is non-empty here
        let index = inner.free_list.pop().unwrap_or_default();
        inner.allocated.insert(index);

        let block = inner.blocks[(index / self.block_size) as usize];
        self.device
            .write_descriptor(block, index % self.block_size, descriptor);

        Ok(index)
    }

    pub fn release(
        &self,
        index: u32,
    ) -> KilnResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.allocated.remove(&index) {
            return Err(KilnError::PreconditionViolation(format!(
                "{:?} view descriptor {} is not allocated",
                self.heap_type, index
            )));
        }

        inner.free_list.push(index);
        Ok(())
    }
}

impl Drop for KilnViewDescriptorAllocator {
    fn drop(&mut self) {
        let inner = self.inner.lock().unwrap();
        for block in &inner.blocks {
            self.device.destroy((*block).into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::null::NullDevice;
    use std::sync::Arc;

    fn null_device() -> (Arc<NullDevice>, KilnNativeDevice) {
        let null = Arc::new(NullDevice::new(&Default::default()));
        let device = KilnNativeDevice::Null(null.clone());
        (null, device)
    }

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(5), 8);
        assert_eq!(next_power_of_two(8), 8);
        assert_eq!(next_power_of_two(9), 16);
    }

    #[test]
    fn test_range_allocator_bump_then_first_fit() {
        let mut allocator = KilnRangeAllocator::new(16);
        assert_eq!(allocator.allocate(4), Some(0));
        assert_eq!(allocator.allocate(4), Some(4));
        assert_eq!(allocator.allocate(8), Some(8));
        assert_eq!(allocator.allocate(1), None);

        allocator.release(4, 4).unwrap();
        assert_eq!(allocator.allocate(2), Some(4));
        assert_eq!(allocator.allocate(2), Some(6));
        assert_eq!(allocator.allocated_count(), 16);
    }

    #[test]
    fn test_range_allocator_coalesces() {
        let mut allocator = KilnRangeAllocator::new(12);
        assert_eq!(allocator.allocate(4), Some(0));
        assert_eq!(allocator.allocate(4), Some(4));
        assert_eq!(allocator.allocate(4), Some(8));

        allocator.release(0, 4).unwrap();
        allocator.release(8, 4).unwrap();
        // Touching the bump pointer returned the tail to the bump region
        assert_eq!(allocator.high_water_mark(), 8);

        allocator.release(4, 4).unwrap();
        assert_eq!(allocator.high_water_mark(), 0);
        assert_eq!(allocator.allocate(12), Some(0));
    }

    #[test]
    fn test_range_allocator_double_release() {
        let mut allocator = KilnRangeAllocator::new(16);
        allocator.allocate(4).unwrap();
        allocator.allocate(4).unwrap();
        allocator.release(0, 4).unwrap();

        assert!(matches!(
            allocator.release(0, 4),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(matches!(
            allocator.release(2, 4),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert!(matches!(
            allocator.release(8, 4),
            Err(KilnError::PreconditionViolation(_))
        ));
    }

    #[test]
    fn test_heap_full_with_fail_policy() {
        let (_null, device) = null_device();
        let heap = KilnDescriptorHeap::new(
            &device,
            KilnDescriptorHeapType::Resource,
            8,
            KilnHeapOverflowPolicy::Fail,
        )
        .unwrap();

        assert_eq!(heap.allocate(4).unwrap().first, 0);
        assert_eq!(heap.allocate(4).unwrap().first, 4);
        match heap.allocate(4) {
            Err(KilnError::DescriptorHeapFull {
                heap,
                requested,
                capacity,
            }) => {
                assert_eq!(heap, KilnDescriptorHeapType::Resource);
                assert_eq!(requested, 4);
                assert_eq!(capacity, 8);
            }
            x => panic!("unexpected result {:?}", x),
        }
    }

    #[test]
    fn test_heap_grow_copies_contents() {
        let (null, device) = null_device();
        let heap = KilnDescriptorHeap::new(
            &device,
            KilnDescriptorHeapType::Resource,
            8,
            KilnHeapOverflowPolicy::Grow,
        )
        .unwrap();

        let first = heap.allocate(8).unwrap();
        assert!(first.replaced_heaps.is_empty());
        heap.write_table(
            first.first,
            &vec![KilnNativeDescriptor::NullShaderResourceView; 8],
        );

        let (old_gpu_heap, old_generation) = heap.shader_visible_heap();
        let second = heap.allocate(4).unwrap();
        assert_eq!(second.first, 8);
        assert_eq!(second.replaced_heaps.len(), 2);
        assert!(second.replaced_heaps.contains(&old_gpu_heap));
        assert_eq!(heap.capacity(), 16);

        let (new_gpu_heap, new_generation) = heap.shader_visible_heap();
        assert_ne!(old_generation, new_generation);
        assert_eq!(
            null.descriptor(new_gpu_heap, 7),
            Some(KilnNativeDescriptor::NullShaderResourceView)
        );
        assert!(null.validation_errors().is_empty());
    }

    #[test]
    fn test_sampler_heap_does_not_grow_past_limit() {
        let (_null, device) = null_device();
        let heap = KilnDescriptorHeap::new(
            &device,
            KilnDescriptorHeapType::Sampler,
            crate::MAX_SAMPLER_HEAP_CAPACITY,
            KilnHeapOverflowPolicy::Grow,
        )
        .unwrap();

        heap.allocate(crate::MAX_SAMPLER_HEAP_CAPACITY).unwrap();
        assert!(matches!(
            heap.allocate(1),
            Err(KilnError::DescriptorHeapFull { .. })
        ));
    }

    #[test]
    fn test_view_descriptor_allocator_grows_in_blocks() {
        let (null, device) = null_device();
        let allocator =
            KilnViewDescriptorAllocator::new(&device, KilnDescriptorHeapType::RenderTarget, 2);

        let a = allocator
            .allocate(&KilnNativeDescriptor::NullShaderResourceView)
            .unwrap();
        let b = allocator
            .allocate(&KilnNativeDescriptor::NullShaderResourceView)
            .unwrap();
        let c = allocator
            .allocate(&KilnNativeDescriptor::NullShaderResourceView)
            .unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(
            null.live_object_count(crate::backends::null::NullObjectKind::DescriptorHeap),
            2
        );

        allocator.release(b).unwrap();
        assert!(matches!(
            allocator.release(b),
            Err(KilnError::PreconditionViolation(_))
        ));
        assert_eq!(
            allocator
                .allocate(&KilnNativeDescriptor::NullShaderResourceView)
                .unwrap(),
            1
        );

        drop(allocator);
        assert_eq!(
            null.live_object_count(crate::backends::null::NullObjectKind::DescriptorHeap),
            0
        );
    }
}
