//! Radix sort for `u32` keys.

/// Sorts `keys` ascending with a 3-pass (10/11/11 bit) LSD radix sort.
///
/// `scratch` must be at least as long as `keys`; it is clobbered. Cheaper
/// than a comparison sort for the pending-index batches the page pool sorts
/// every frame.
pub fn radix_sort_u32(keys: &mut [u32], scratch: &mut [u32]) {
    assert!(scratch.len() >= keys.len());
    let num = keys.len();
    let scratch = &mut scratch[..num];

    let mut histogram0 = [0u32; 1024];
    let mut histogram1 = [0u32; 2048];
    let mut histogram2 = [0u32; 2048];

    for &k in keys.iter() {
        histogram0[(k & 1023) as usize] += 1;
        histogram1[((k >> 10) & 2047) as usize] += 1;
        histogram2[(k >> 21) as usize] += 1;
    }

    // Exclusive prefix sums turn counts into output offsets.
    let mut sum0 = 0;
    let mut sum1 = 0;
    let mut sum2 = 0;
    for i in 0..2048 {
        if i < 1024 {
            let t = histogram0[i];
            histogram0[i] = sum0;
            sum0 += t;
        }
        let t = histogram1[i];
        histogram1[i] = sum1;
        sum1 += t;
        let t = histogram2[i];
        histogram2[i] = sum2;
        sum2 += t;
    }

    for i in 0..num {
        let k = keys[i];
        let bucket = (k & 1023) as usize;
        scratch[histogram0[bucket] as usize] = k;
        histogram0[bucket] += 1;
    }
    for i in 0..num {
        let k = scratch[i];
        let bucket = ((k >> 10) & 2047) as usize;
        keys[histogram1[bucket] as usize] = k;
        histogram1[bucket] += 1;
    }
    for i in 0..num {
        let k = keys[i];
        let bucket = (k >> 21) as usize;
        scratch[histogram2[bucket] as usize] = k;
        histogram2[bucket] += 1;
    }

    keys.copy_from_slice(scratch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_comparison_sort() {
        let mut keys: Vec<u32> = (0..997u32)
            .map(|i| i.wrapping_mul(2654435761) ^ (i << 7))
            .collect();
        let mut scratch = vec![0u32; keys.len()];
        let mut expected = keys.clone();
        expected.sort_unstable();

        radix_sort_u32(&mut keys, &mut scratch);
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_empty_and_single() {
        let mut empty: [u32; 0] = [];
        radix_sort_u32(&mut empty, &mut []);

        let mut one = [42u32];
        let mut scratch = [0u32];
        radix_sort_u32(&mut one, &mut scratch);
        assert_eq!(one, [42]);
    }

    #[test]
    fn test_high_bits() {
        let mut keys = [!0u32, 0, 0x8000_0000, 0x7fff_ffff, 1 << 21, 1 << 10];
        let mut scratch = [0u32; 6];
        radix_sort_u32(&mut keys, &mut scratch);
        assert_eq!(keys, [0, 1 << 10, 1 << 21, 0x7fff_ffff, 0x8000_0000, !0]);
    }
}
