//! Message Codec for Segment Chains
//!
//! ## Purpose
//!
//! Converts between a contiguous payload and the segment chain that travels
//! through a ring as a single handle. Payloads up to the jumbo ceiling are
//! accepted; anything larger is rejected before a single segment is taken
//! from the pool.
//!
//! ## Architecture Role
//!
//! ```text
//! write: payload → split → [seg 0] → [seg 1] → … → ring slot (head handle)
//! read:  ring slot → reassemble → single segment view  (zero copy)
//!                              └→ scratch buffer copy  (multi-segment)
//! ```
//!
//! ## Chain Layout
//!
//! - Every segment records its own `data_len` and the index of the next one.
//! - The head segment also records `pkt_len` (total bytes) and `nb_segs`.
//! - Segments are pool indices, never addresses, so a chain built by one
//!   process reads the same in another.
//!
//! ## Scratch Buffer
//!
//! Multi-segment payloads are copied into a [`ScratchBuffer`] owned by the
//! reading side. The slice handed back borrows it, so the next reassembly
//! (or dropping the buffer) invalidates it.

use tracing::trace;

use crate::error::{ChannelError, Result};
use crate::pool::{SegmentId, SegmentMeta, SegmentPool, NO_NEXT};
use shmq_config::limits::JUMBO_CEILING;

/// Reusable reassembly buffer for one reading thread
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    bytes: Vec<u8>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity reserved so far; grows to the largest payload seen
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    fn reset(&mut self, total: usize) -> &mut Vec<u8> {
        self.bytes.clear();
        self.bytes.reserve(total);
        &mut self.bytes
    }
}

/// Segments needed for a payload of `len` bytes
pub fn segments_for(len: usize, segment_capacity: usize) -> usize {
    len.div_ceil(segment_capacity).max(1)
}

/// Copy `payload` into a freshly allocated segment chain
///
/// Either the whole chain is built or every segment taken is returned.
pub fn split(pool: &SegmentPool, payload: &[u8]) -> Result<SegmentId> {
    if payload.len() > JUMBO_CEILING {
        return Err(ChannelError::oversized(payload.len(), JUMBO_CEILING));
    }
    let capacity = pool.segment_capacity();
    let count = segments_for(payload.len(), capacity);

    let mut chain = Vec::with_capacity(count);
    for _ in 0..count {
        match pool.allocate() {
            Some(id) => chain.push(id),
            None => {
                for id in &chain {
                    pool.free(*id);
                }
                return Err(ChannelError::resource_exhausted(
                    "segment pool",
                    format!(
                        "{} needs {} segments for {} bytes, got {}",
                        pool.name(),
                        count,
                        payload.len(),
                        chain.len()
                    ),
                ));
            }
        }
    }

    if let Err(e) = fill(pool, &chain, payload) {
        for id in &chain {
            pool.free(*id);
        }
        return Err(e);
    }

    trace!("Split {} bytes into {} segments", payload.len(), count);
    Ok(chain[0])
}

fn fill(pool: &SegmentPool, chain: &[SegmentId], payload: &[u8]) -> Result<()> {
    let mut chunks = payload.chunks(pool.segment_capacity());
    for (position, id) in chain.iter().enumerate() {
        let chunk = chunks.next().unwrap_or(&[]);
        // SAFETY: the segment was allocated by the caller and is not yet published.
        let data = unsafe { pool.data_mut(*id)? };
        data[..chunk.len()].copy_from_slice(chunk);

        let head = position == 0;
        let meta = SegmentMeta {
            data_len: chunk.len() as u32,
            pkt_len: if head { payload.len() as u32 } else { 0 },
            nb_segs: if head { chain.len() as u32 } else { 1 },
            next: chain.get(position + 1).map_or(NO_NEXT, |next| next.index()),
        };
        pool.set_meta(*id, meta)?;
    }
    Ok(())
}

/// View the payload of the chain starting at `head`
///
/// Single segments are returned in place; longer chains are copied into
/// `scratch`. The chain itself is left untouched either way.
pub fn reassemble<'a>(
    pool: &'a SegmentPool,
    head: SegmentId,
    scratch: &'a mut ScratchBuffer,
) -> Result<&'a [u8]> {
    let capacity = pool.segment_capacity();
    let meta = pool.meta(head)?;

    if meta.next == NO_NEXT {
        let len = meta.data_len as usize;
        if len > capacity {
            return Err(ChannelError::corrupted(format!(
                "segment {} claims {} bytes",
                head.index(),
                len
            )));
        }
        return Ok(&pool.data(head)?[..len]);
    }

    let total = meta.pkt_len as usize;
    if total > JUMBO_CEILING {
        return Err(ChannelError::oversized(total, JUMBO_CEILING));
    }

    let buffer = scratch.reset(total);
    let mut current = Some(head);
    let mut segments = 0u32;
    while let Some(id) = current {
        let meta = pool.meta(id)?;
        let len = meta.data_len as usize;
        if len > capacity || buffer.len() + len > total || segments >= pool.capacity() {
            return Err(ChannelError::corrupted(format!(
                "chain from segment {} overruns its declared {} bytes",
                head.index(),
                total
            )));
        }
        buffer.extend_from_slice(&pool.data(id)?[..len]);
        segments += 1;
        current = meta.next_segment();
    }

    if buffer.len() != total {
        return Err(ChannelError::corrupted(format!(
            "chain from segment {} holds {} of {} bytes",
            head.index(),
            buffer.len(),
            total
        )));
    }
    trace!("Reassembled {} bytes from {} segments", total, segments);
    Ok(&buffer[..])
}

/// Return every segment of a message to the pool
pub fn free_message(pool: &SegmentPool, head: SegmentId) -> usize {
    pool.free_chain(head)
}

/// Return a batch of messages to the pool
pub fn free_messages(pool: &SegmentPool, heads: &[SegmentId]) -> usize {
    heads.iter().map(|head| pool.free_chain(*head)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shmq_config::limits::SEGMENT_CAPACITY;
    use tempfile::{tempdir, TempDir};

    fn pool(segments: u32) -> (TempDir, SegmentPool) {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), "CODEC_POOL", segments).unwrap();
        (dir, pool)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_round_trip_boundaries() {
        let (_dir, pool) = pool(512);
        let mut scratch = ScratchBuffer::new();
        for len in [
            1,
            SEGMENT_CAPACITY - 1,
            SEGMENT_CAPACITY,
            SEGMENT_CAPACITY + 1,
            JUMBO_CEILING,
        ] {
            let data = payload(len);
            let head = split(&pool, &data).unwrap();
            assert_eq!(pool.meta(head).unwrap().pkt_len as usize, len);
            assert_eq!(reassemble(&pool, head, &mut scratch).unwrap(), &data[..]);
            assert_eq!(free_message(&pool, head), segments_for(len, SEGMENT_CAPACITY));
        }
        assert_eq!(pool.available(), 512);
    }

    #[test]
    fn test_single_segment_is_zero_copy() {
        let (_dir, pool) = pool(4);
        let mut scratch = ScratchBuffer::new();
        let head = split(&pool, b"hello").unwrap();

        let view = reassemble(&pool, head, &mut scratch).unwrap();
        assert_eq!(view, b"hello");
        assert_eq!(view.as_ptr(), pool.data(head).unwrap().as_ptr());
        assert_eq!(scratch.capacity(), 0);
    }

    #[test]
    fn test_empty_payload_uses_one_segment() {
        let (_dir, pool) = pool(2);
        let mut scratch = ScratchBuffer::new();
        let head = split(&pool, &[]).unwrap();
        assert_eq!(pool.available(), 1);
        assert!(reassemble(&pool, head, &mut scratch).unwrap().is_empty());
    }

    #[test]
    fn test_oversize_rejected_without_allocation() {
        let (_dir, pool) = pool(8);
        let data = vec![0u8; JUMBO_CEILING + 1];
        let err = split(&pool, &data).unwrap_err();
        assert!(matches!(err, ChannelError::OversizedPayload { .. }));
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_exhaustion_releases_partial_chain() {
        let (_dir, pool) = pool(2);
        let data = payload(SEGMENT_CAPACITY * 2 + 1);
        let err = split(&pool, &data).unwrap_err();
        assert_eq!(err.category(), "resource_exhausted");
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_corrupted_total_length() {
        let (_dir, pool) = pool(4);
        let mut scratch = ScratchBuffer::new();
        let head = split(&pool, &payload(SEGMENT_CAPACITY + 10)).unwrap();

        let mut meta = pool.meta(head).unwrap();
        meta.pkt_len = (JUMBO_CEILING + 1) as u32;
        pool.set_meta(head, meta).unwrap();
        assert!(matches!(
            reassemble(&pool, head, &mut scratch),
            Err(ChannelError::OversizedPayload { .. })
        ));

        meta.pkt_len = 5;
        pool.set_meta(head, meta).unwrap();
        assert!(matches!(
            reassemble(&pool, head, &mut scratch),
            Err(ChannelError::Corrupted { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_split_reassemble(data in proptest::collection::vec(any::<u8>(), 0..4 * SEGMENT_CAPACITY)) {
            let (_dir, pool) = pool(8);
            let mut scratch = ScratchBuffer::new();
            let head = split(&pool, &data).unwrap();
            prop_assert_eq!(reassemble(&pool, head, &mut scratch).unwrap(), &data[..]);
            free_message(&pool, head);
            prop_assert_eq!(pool.available(), 8);
        }
    }
}
