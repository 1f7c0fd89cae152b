//! Helpers for LSB-first packed validity bitmaps

/// Number of bytes needed to hold `bits` bits
#[inline]
pub fn bytes_for(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Read bit `i`
///
/// Panics if `i / 8` is outside `bytes`; callers bounds-check first.
#[inline]
pub fn get_bit(bytes: &[u8], i: usize) -> bool {
    bytes[i / 8] & (1 << (i % 8)) != 0
}

/// Set bit `i` to one
#[inline]
pub fn set_bit(bytes: &mut [u8], i: usize) {
    bytes[i / 8] |= 1 << (i % 8);
}

/// Clear bit `i`
#[inline]
pub fn unset_bit(bytes: &mut [u8], i: usize) {
    bytes[i / 8] &= !(1 << (i % 8));
}

/// Count the set bits in `[offset, offset + len)`
///
/// Whole bytes inside the range are counted with a popcount; only the
/// partial bytes at either edge are walked bit by bit.
pub fn count_set_bits(bytes: &[u8], offset: usize, len: usize) -> usize {
    let end = offset + len;
    let mut count = 0;
    let mut i = offset;

    while i < end && i % 8 != 0 {
        count += usize::from(get_bit(bytes, i));
        i += 1;
    }

    let whole_end = end - end % 8;
    if i < whole_end {
        count += bytes[i / 8..whole_end / 8]
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum::<usize>();
        i = whole_end;
    }

    while i < end {
        count += usize::from(get_bit(bytes, i));
        i += 1;
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bit_roundtrip() {
        let mut bytes = vec![0u8; 2];
        set_bit(&mut bytes, 0);
        set_bit(&mut bytes, 9);
        assert_eq!(bytes, vec![0b0000_0001, 0b0000_0010]);
        assert!(get_bit(&bytes, 9));
        unset_bit(&mut bytes, 9);
        assert!(!get_bit(&bytes, 9));
    }

    #[test]
    fn test_count_within_single_byte() {
        let bytes = [0b1011_0110u8];
        assert_eq!(count_set_bits(&bytes, 1, 3), 2);
        assert_eq!(count_set_bits(&bytes, 0, 8), 5);
        assert_eq!(count_set_bits(&bytes, 4, 0), 0);
    }

    proptest! {
        #[test]
        fn count_matches_naive(
            bytes in proptest::collection::vec(any::<u8>(), 1..32),
            start in 0usize..64,
            len in 0usize..256,
        ) {
            let bits = bytes.len() * 8;
            let offset = start.min(bits);
            let len = len.min(bits - offset);
            let naive = (offset..offset + len).filter(|&i| get_bit(&bytes, i)).count();
            prop_assert_eq!(count_set_bits(&bytes, offset, len), naive);
        }
    }
}
