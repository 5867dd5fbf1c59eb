//! Read-only journal access for dump and replay

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::warn;
use zerocopy::FromBytes;

use super::layout::{entry_offset, file_len, EntryRef, JournalEntry, JournalHeader};
use super::Journal;
use crate::error::{ChannelError, JournalOp, Result};
use crate::ring::{ahead_of, Role};

#[derive(Debug)]
pub struct JournalReader {
    path: PathBuf,
    mmap: Mmap,
    header: JournalHeader,
}

impl JournalReader {
    pub fn open(dir: &Path, channel: &str) -> Result<Self> {
        Self::open_path(&Journal::path_for(dir, channel))
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ChannelError::not_found("journal", path.display().to_string())
            } else {
                ChannelError::journal(JournalOp::Open, path, e)
            }
        })?;
        // SAFETY: read-only view; writers only ever extend the file.
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| ChannelError::journal(JournalOp::Map, path, e))?;

        let header = JournalHeader::read_from_prefix(&mmap[..]).ok_or_else(|| {
            ChannelError::corrupted(format!("journal {:?} shorter than its header", path))
        })?;
        header
            .validate()
            .map_err(|message| ChannelError::corrupted(format!("journal {:?}: {}", path, message)))?;
        if (mmap.len() as u64) < file_len(header.mask) {
            return Err(ChannelError::corrupted(format!(
                "journal {:?} truncated below mask {:#x}",
                path, header.mask
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &JournalHeader {
        &self.header
    }

    pub fn mask(&self) -> u32 {
        self.header.mask
    }

    /// Registered endpoint names and tails of one side
    pub fn endpoints(&self, role: Role) -> Vec<(String, u32)> {
        self.header.records(role)[..self.header.count(role)]
            .iter()
            .map(|record| (record.name(), record.tail))
            .collect()
    }

    /// Unacknowledged span: slowest consumer to furthest producer
    pub fn default_range(&self) -> (u32, u32) {
        (
            self.header.max_tail(Role::Consumer),
            self.header.max_tail(Role::Producer),
        )
    }

    pub fn entry(&self, position: u32) -> Result<EntryRef<'_>> {
        let index = position & self.header.mask;
        self.mmap
            .get(entry_offset(index)..)
            .and_then(JournalEntry::ref_from_prefix)
            .map(EntryRef::from_entry)
            .ok_or_else(|| {
                ChannelError::corrupted(format!("journal {:?} entry {} out of map", self.path, index))
            })
    }

    /// Entries between `start` and `end`, defaulting to [`Self::default_range`]
    ///
    /// Only the newest `mask + 1` positions can still be on disk, so longer
    /// ranges are clipped at the front.
    pub fn range(&self, start: Option<u32>, end: Option<u32>) -> Result<Vec<(u32, EntryRef<'_>)>> {
        let (default_start, default_end) = self.default_range();
        let end = match end {
            Some(end) if ahead_of(end, default_end) => default_end,
            Some(end) => end,
            None => default_end,
        };
        let mut start = start.unwrap_or(default_start);
        if ahead_of(start, end) {
            return Ok(Vec::new());
        }
        let span = self.header.mask.wrapping_add(1);
        if end.wrapping_sub(start) > span {
            let clipped = end.wrapping_sub(span);
            warn!(
                "Journal {:?} holds {} entries, skipping positions {}..{}",
                self.path, span, start, clipped
            );
            start = clipped;
        }

        (0..end.wrapping_sub(start))
            .map(|offset| {
                let position = start.wrapping_add(offset);
                self.entry(position).map(|entry| (position, entry))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::journal::JournalOptions;
    use crate::pool::SegmentPool;
    use tempfile::tempdir;

    #[test]
    fn test_missing_journal_is_not_found() {
        let dir = tempdir().unwrap();
        let err = JournalReader::open(dir.path(), "NOPE").unwrap_err();
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let dir = tempdir().unwrap();
        std::fs::write(Journal::path_for(dir.path(), "BAD"), vec![0xAB; 4096]).unwrap();
        let err = JournalReader::open(dir.path(), "BAD").unwrap_err();
        assert_eq!(err.category(), "corrupted");
    }

    #[test]
    fn test_default_range_spans_unacknowledged() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), "READER_POOL", 8).unwrap();
        let options = JournalOptions {
            initial_mask: 7,
            sync: true,
        };
        let mut producer = Journal::open(dir.path(), "P_Q", Role::Producer, 0, "P_0", options).unwrap();
        let mut consumer = Journal::open(dir.path(), "P_Q", Role::Consumer, 0, "Q_0", options).unwrap();

        for (i, word) in [b"aa", b"bb", b"cc"].iter().enumerate() {
            let head = codec::split(&pool, *word).unwrap();
            producer.append(&pool, &[head], i as u32 + 1, 1).unwrap();
            pool.free_chain(head);
        }
        consumer.mark_read(1).unwrap();

        let reader = JournalReader::open(dir.path(), "P_Q").unwrap();
        assert_eq!(reader.default_range(), (1, 3));
        let entries = reader.range(None, None).unwrap();
        let payloads: Vec<_> = entries.iter().map(|(pos, e)| (*pos, e.payload)).collect();
        assert_eq!(payloads, vec![(1, &b"bb"[..]), (2, &b"cc"[..])]);

        assert_eq!(reader.range(Some(0), Some(1)).unwrap()[0].1.payload, b"aa");
        assert!(reader.range(Some(5), None).unwrap().is_empty());
    }

    #[test]
    fn test_range_across_position_wrap() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), "READER_POOL", 8).unwrap();
        let options = JournalOptions {
            initial_mask: 7,
            sync: false,
        };
        let mut producer = Journal::open(dir.path(), "P_Q", Role::Producer, 0, "P_0", options).unwrap();
        let mut consumer = Journal::open(dir.path(), "P_Q", Role::Consumer, 0, "Q_0", options).unwrap();

        let heads = [
            codec::split(&pool, b"last").unwrap(),
            codec::split(&pool, b"first").unwrap(),
        ];
        producer.append(&pool, &heads, 1, 2).unwrap();
        consumer.mark_read(u32::MAX).unwrap();

        let reader = JournalReader::open(dir.path(), "P_Q").unwrap();
        assert_eq!(reader.default_range(), (u32::MAX, 1));
        let entries = reader.range(None, None).unwrap();
        let payloads: Vec<_> = entries.iter().map(|(pos, e)| (*pos, e.payload)).collect();
        assert_eq!(payloads, vec![(u32::MAX, &b"last"[..]), (0, &b"first"[..])]);
    }

    #[test]
    fn test_range_clipped_to_capacity() {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), "READER_POOL", 8).unwrap();
        let options = JournalOptions {
            initial_mask: 3,
            sync: false,
        };
        let mut producer = Journal::open(dir.path(), "P_Q", Role::Producer, 0, "P_0", options).unwrap();
        let head = codec::split(&pool, b"z").unwrap();
        producer.append(&pool, &[head], 10, 1).unwrap();

        let reader = JournalReader::open(dir.path(), "P_Q").unwrap();
        let entries = reader.range(Some(0), None).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].0, 6);
    }
}
