//! Partition selection for produced records.
//!
//! Keyed records use Kafka's default partitioner, so a key maps to the same
//! partition as it would from the Java client. Keyless records always go to
//! partition 0.

/// Pick the partition for a record on a topic with `partition_count` partitions.
#[must_use]
pub fn partition_for(key: Option<&[u8]>, partition_count: usize) -> i32 {
    match key {
        Some(key) if partition_count > 1 => {
            let positive = (murmur2(key) as u32) & 0x7fff_ffff;
            (positive % partition_count as u32) as i32
        }
        _ => 0,
    }
}

/// 32-bit murmur2 with Kafka's seed.
#[must_use]
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_murmur2_matches_kafka() {
        let cases: [(&[u8], i32); 6] = [
            (b"21", -973_932_308),
            (b"foobar", -790_332_482),
            (b"a-little-bit-long-string", -985_981_536),
            (b"a-little-bit-longer-string", -1_486_304_829),
            (
                b"lkjh234lh9fiuh90y23oiuhsafujhadof229phr9h19h89h8",
                -58_897_971,
            ),
            (b"abc", 479_470_107),
        ];
        for (input, expected) in cases {
            assert_eq!(murmur2(input), expected, "{:?}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn test_keyless_goes_to_partition_zero() {
        assert_eq!(partition_for(None, 12), 0);
    }

    #[test]
    fn test_single_partition() {
        assert_eq!(partition_for(Some(b"anything"), 1), 0);
        assert_eq!(partition_for(Some(b"anything"), 0), 0);
    }

    #[test]
    fn test_keyed_partition() {
        assert_eq!(partition_for(Some(b"a-little-bit-long-string"), 3), 2);
        assert_eq!(partition_for(Some(b"foobar"), 3), 0);
    }

    proptest! {
        #[test]
        fn partition_in_range(key in proptest::collection::vec(any::<u8>(), 0..64), count in 1usize..128) {
            let partition = partition_for(Some(&key), count);
            prop_assert!(partition >= 0);
            prop_assert!((partition as usize) < count);
        }

        #[test]
        fn partition_is_stable(key in proptest::collection::vec(any::<u8>(), 0..64), count in 1usize..128) {
            prop_assert_eq!(partition_for(Some(&key), count), partition_for(Some(&key), count));
        }
    }
}
