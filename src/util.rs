//! Address/size alignment helpers and the hash function used by the
//! dictionaries. Mirrors the small set of bit tricks the allocator leans on
//! throughout its hot paths.

/// Default alignment the allocator guarantees for every allocation, matching
/// what a conforming C++ `operator new` promises for types without an
/// `alignas` requirement.
pub const DEFAULT_ALLOCATION_ALIGNMENT: usize = 16;

#[inline]
pub fn is_pow2(size: usize) -> bool {
    size > 0 && (size & (size - 1)) == 0
}

#[inline]
pub fn is_address_aligned(address: *const u8, alignment: usize) -> bool {
    let addr = address as usize;
    addr % alignment == 0
}

#[inline]
pub fn is_size_a_multiple_of(input: usize, multiple: usize) -> bool {
    input % multiple == 0
}

/// Rounds `input` up to the next multiple of `multiple`, which must be a
/// power of two.
#[inline]
pub fn round_up_to_multiple_of_pow2(input: usize, multiple: usize) -> usize {
    debug_assert!(is_pow2(multiple));
    (input + multiple - 1) & !(multiple - 1)
}

/// Classic bit-propagation round-up-to-power-of-two. `0` rounds up to `1`.
#[inline]
pub fn round_up_to_pow2(mut input: usize) -> usize {
    if input == 0 {
        return 1;
    }
    input -= 1;
    input |= input >> 1;
    input |= input >> 2;
    input |= input >> 4;
    input |= input >> 8;
    input |= input >> 16;
    #[cfg(target_pointer_width = "64")]
    {
        input |= input >> 32;
    }
    input + 1
}

/// MurmurHash3's 64-bit finalizer, used as-is as the hash function for both
/// dictionaries (segment-id/size-class keys are already well distributed
/// 64-bit integers, so the finalizer alone is sufficient mixing).
#[inline]
pub fn murmur_hash3_finalize(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_detection() {
        assert!(is_pow2(1));
        assert!(is_pow2(2));
        assert!(is_pow2(1024));
        assert!(!is_pow2(0));
        assert!(!is_pow2(3));
        assert!(!is_pow2(1023));
    }

    #[test]
    fn round_up_pow2() {
        assert_eq!(round_up_to_pow2(0), 1);
        assert_eq!(round_up_to_pow2(1), 1);
        assert_eq!(round_up_to_pow2(2), 2);
        assert_eq!(round_up_to_pow2(17), 32);
        assert_eq!(round_up_to_pow2(1024), 1024);
        assert_eq!(round_up_to_pow2(1025), 2048);
    }

    #[test]
    fn multiple_rounding() {
        assert_eq!(round_up_to_multiple_of_pow2(1, 4096), 4096);
        assert_eq!(round_up_to_multiple_of_pow2(4096, 4096), 4096);
        assert_eq!(round_up_to_multiple_of_pow2(4097, 4096), 8192);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(murmur_hash3_finalize(42), murmur_hash3_finalize(42));
        assert_ne!(murmur_hash3_finalize(42), murmur_hash3_finalize(43));
    }
}
