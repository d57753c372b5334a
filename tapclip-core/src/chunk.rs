//! Chunk arithmetic: split a payload of `total` bytes into `max_chunk_len` slices.
//! Last chunk is the remainder, never padded.

use std::ops::Range;

use crate::integrity::CHUNK_HASH_LEN;

/// Chunk identifier: index plus byte range within the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkId {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }
}

/// `ceil(total / max_chunk_len)`; zero when either is zero.
pub fn chunk_count(total: u32, max_chunk_len: u32) -> u32 {
    if max_chunk_len == 0 {
        return 0;
    }
    total.div_ceil(max_chunk_len)
}

/// Chunk `index` of a payload, or `None` past the end.
pub fn chunk_at(index: u32, total: u32, max_chunk_len: u32) -> Option<ChunkId> {
    if index >= chunk_count(total, max_chunk_len) {
        return None;
    }
    let start = u64::from(index) * u64::from(max_chunk_len);
    let end = (start + u64::from(max_chunk_len)).min(u64::from(total));
    Some(ChunkId { index, start, end })
}

/// Every chunk of a payload in ascending order.
pub fn split_into_chunks(total: u32, max_chunk_len: u32) -> Vec<ChunkId> {
    (0..chunk_count(total, max_chunk_len))
        .filter_map(|i| chunk_at(i, total, max_chunk_len))
        .collect()
}

/// Chunk length for a link: the transport's frame capacity clamped to `hard_cap`,
/// minus room for the chunk hash. `None` if nothing would be left for data.
pub fn negotiate_chunk_len(transport_capacity: u32, hard_cap: u32) -> Option<u32> {
    let frame = transport_capacity.min(hard_cap);
    frame.checked_sub(CHUNK_HASH_LEN).filter(|&n| n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn split_chunks() {
        let chunks = split_into_chunks(100, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 30);
        assert_eq!(chunks[3].start, 90);
        assert_eq!(chunks[3].end, 100);
        assert_eq!(chunks[3].len(), 10);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(90, 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].end, 90);
    }

    #[test]
    fn split_single_chunk() {
        let chunks = split_into_chunks(5, 1020);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range(), 0..5);
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(0, 30).is_empty());
        assert_eq!(chunk_count(0, 30), 0);
        assert_eq!(chunk_count(10, 0), 0);
    }

    #[test]
    fn ten_thousand_bytes_in_1024_chunks() {
        assert_eq!(chunk_count(10_000, 1024), 10);
        let last = chunk_at(9, 10_000, 1024).unwrap();
        assert_eq!(last.range(), 9216..10_000);
        assert!(chunk_at(10, 10_000, 1024).is_none());
    }

    #[test]
    fn chunk_lengths_sum_to_total() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let total: u32 = rng.gen_range(0..50_000);
            let max: u32 = rng.gen_range(1..3_000);
            let chunks = split_into_chunks(total, max);
            assert_eq!(chunks.len() as u32, total.div_ceil(max));
            let sum: usize = chunks.iter().map(ChunkId::len).sum();
            assert_eq!(sum, total as usize);
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= max as usize));
        }
    }

    #[test]
    fn negotiation_clamps_and_reserves_hash() {
        assert_eq!(negotiate_chunk_len(65_279, 1024), Some(1020));
        assert_eq!(negotiate_chunk_len(261, 1024), Some(257));
        assert_eq!(negotiate_chunk_len(4, 1024), None);
        assert_eq!(negotiate_chunk_len(0, 1024), None);
    }
}
