pub fn round_size_up_to_alignment_u32(
    size: u32,
    required_alignment: u32,
) -> u32 {
    assert!(required_alignment > 0);
    ((size + required_alignment - 1) / required_alignment) * required_alignment
}

pub fn round_size_up_to_alignment_u64(
    size: u64,
    required_alignment: u64,
) -> u64 {
    assert!(required_alignment > 0);
    ((size + required_alignment - 1) / required_alignment) * required_alignment
}

/// Smallest power of two that is >= size, with a floor of `minimum`
pub fn next_power_of_two_at_least(
    size: u64,
    minimum: u64,
) -> u64 {
    size.max(1).next_power_of_two().max(minimum)
}

pub fn slice_size_in_bytes<T>(slice: &[T]) -> usize {
    std::mem::size_of::<T>() * slice.len()
}

/// View a slice of plain-old-data as bytes
pub fn slice_as_bytes<T: Copy>(slice: &[T]) -> &[u8] {
    let ptr = slice.as_ptr() as *const u8;
    unsafe { std::slice::from_raw_parts(ptr, slice_size_in_bytes(slice)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_to_alignment() {
        assert_eq!(0, round_size_up_to_alignment_u32(0, 256));
        assert_eq!(256, round_size_up_to_alignment_u32(1, 256));
        assert_eq!(256, round_size_up_to_alignment_u64(256, 256));
        assert_eq!(512, round_size_up_to_alignment_u64(257, 256));
    }

    #[test]
    fn test_next_power_of_two_at_least() {
        assert_eq!(65536, next_power_of_two_at_least(100, 65536));
        assert_eq!(65536, next_power_of_two_at_least(0, 65536));
        assert_eq!(131072, next_power_of_two_at_least(65537, 65536));
        assert_eq!(1 << 20, next_power_of_two_at_least(1 << 20, 65536));
    }

    #[test]
    fn test_slice_as_bytes() {
        let data = [1u32, 2u32];
        assert_eq!(8, slice_as_bytes(&data).len());
        assert_eq!(8, slice_size_in_bytes(&data));
    }
}
