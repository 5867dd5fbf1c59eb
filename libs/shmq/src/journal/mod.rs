//! Memory-Mapped Channel Journal
//!
//! ## Purpose
//!
//! Mirrors the head segment of every message written to a channel into a
//! file, together with the last position each endpoint acknowledged, so
//! an operator can inspect or replay a channel after a crash.
//!
//! ## Growth
//!
//! The entry array is indexed by `position & mask`. When live entries pass
//! [`JOURNAL_GROW_RATIO`] of the array the writer takes the file lock and
//! doubles it (`mask = (mask << 1) | 1`). If another process already grew
//! the file, the writer adopts the on-disk mask and remaps instead. Every
//! grow bumps the header generation; other mappings compare it on each
//! operation and remap when stale.
//!
//! ## Durability
//!
//! With `sync` set every append and acknowledgement waits for msync on the
//! touched ranges. Otherwise flushes are scheduled asynchronously.

mod layout;
mod lock;
mod reader;

pub use layout::{
    entry_offset, file_len, EndpointRecord, EntryRef, JournalEntry, JournalHeader, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
pub use lock::JournalLock;
pub use reader::JournalReader;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, info, warn};
use zerocopy::FromBytes;

use crate::error::{ChannelError, JournalOp, Result};
use crate::pool::{SegmentId, SegmentPool};
use crate::ring::Role;
use shmq_config::limits::{JOURNAL_GROW_RATIO, MAX_ENDPOINTS, SEGMENT_CAPACITY};

/// Largest mask a journal will grow to
const MAX_JOURNAL_MASK: u32 = (1 << 24) - 1;

#[derive(Debug, Clone, Copy)]
pub struct JournalOptions {
    pub initial_mask: u32,
    pub sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalState {
    Opened { mask: u32 },
    Growing { from: u32 },
    Closed,
}

/// One endpoint's handle on a channel journal
pub struct Journal {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    mask: u32,
    generation: u32,
    role: Role,
    endpoint: usize,
    sync: bool,
    state: JournalState,
    grows: u32,
}

impl Journal {
    pub fn path_for(dir: &Path, channel: &str) -> PathBuf {
        dir.join(format!("{}.journal", channel))
    }

    /// Open or create the journal of `channel` for one registered endpoint
    pub fn open(
        dir: &Path,
        channel: &str,
        role: Role,
        endpoint: usize,
        endpoint_name: &str,
        options: JournalOptions,
    ) -> Result<Self> {
        if endpoint >= MAX_ENDPOINTS {
            return Err(ChannelError::invalid_argument(format!(
                "journal endpoint {} out of range",
                endpoint
            )));
        }
        if !options.initial_mask.wrapping_add(1).is_power_of_two() {
            return Err(ChannelError::invalid_argument(format!(
                "journal mask {:#x} is not a power of two minus one",
                options.initial_mask
            )));
        }

        let path = Self::path_for(dir, channel);
        std::fs::create_dir_all(dir).map_err(|e| ChannelError::journal(JournalOp::Open, dir, e))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o660)
            .open(&path)
            .map_err(|e| ChannelError::journal(JournalOp::Open, &path, e))?;

        let lock = JournalLock::acquire(&file, &path)?;
        let len = file
            .metadata()
            .map_err(|e| ChannelError::journal(JournalOp::Open, &path, e))?
            .len();

        let mut mmap = if len < JournalHeader::SIZE as u64 {
            initialize(&file, &path, options.initial_mask)?
        } else {
            let mut mmap = map(&file, &path)?;
            let initialized = JournalHeader::ref_from_prefix(&mmap[..])
                .map(|h| h.is_initialized())
                .unwrap_or(false);
            if !initialized {
                // Creator died between ftruncate and the header write.
                warn!("Journal {:?} has no header, reinitializing", path);
                mmap = initialize(&file, &path, options.initial_mask)?;
            }
            mmap
        };

        let header = header_mut(&mut mmap, &path)?;
        header.validate().map_err(|message| {
            ChannelError::corrupted(format!("journal {:?}: {}", path, message))
        })?;
        let mask = header.mask;
        let generation = header.generation;
        if header.count(role) <= endpoint {
            header.set_count(role, endpoint + 1);
        }
        header.records_mut(role)[endpoint].set_name(endpoint_name);

        if (mmap.len() as u64) < file_len(mask) {
            return Err(ChannelError::corrupted(format!(
                "journal {:?} is {} bytes, mask {:#x} needs {}",
                path,
                mmap.len(),
                mask,
                file_len(mask)
            )));
        }
        mmap.flush_range(0, JournalHeader::SIZE)
            .map_err(|e| ChannelError::journal(JournalOp::Sync, &path, e))?;
        drop(lock);

        debug!(
            "Opened journal {:?} as {} {} (mask {:#x}, generation {})",
            path,
            role.as_str(),
            endpoint,
            mask,
            generation
        );
        Ok(Self {
            path,
            file,
            mmap,
            mask,
            generation,
            role,
            endpoint,
            sync: options.sync,
            state: JournalState::Opened { mask },
            grows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn state(&self) -> JournalState {
        self.state
    }

    /// Grows performed through this handle
    pub fn grow_count(&self) -> u32 {
        self.grows
    }

    /// Record messages just enqueued, ending at ring position `tail`
    ///
    /// `live_entries` is the ring occupancy after the enqueue and drives
    /// the grow decision.
    pub fn append(
        &mut self,
        pool: &SegmentPool,
        heads: &[SegmentId],
        tail: u32,
        live_entries: u32,
    ) -> Result<()> {
        self.ensure_role(Role::Producer)?;
        self.refresh()?;
        if f64::from(live_entries) / (f64::from(self.mask) + 1.0) > JOURNAL_GROW_RATIO {
            self.grow()?;
        }

        let start = tail.wrapping_sub(heads.len() as u32);
        for (offset, head) in heads.iter().enumerate() {
            let meta = pool.meta(*head)?;
            let data = pool.data(*head)?;
            let len = (meta.data_len as usize).min(SEGMENT_CAPACITY);
            let index = start.wrapping_add(offset as u32) & self.mask;

            let entry = self.entry_mut(index)?;
            entry.len = len as u32;
            entry.has_more = u8::from(meta.next_segment().is_some());
            entry.payload[..len].copy_from_slice(&data[..len]);
            self.flush_range(entry_offset(index), JournalEntry::SIZE)?;
        }

        let endpoint = self.endpoint;
        self.header_mut()?.producers[endpoint].tail = tail;
        self.flush_range(0, JournalHeader::SIZE)
    }

    /// Record that this consumer finished everything before `tail`
    pub fn mark_read(&mut self, tail: u32) -> Result<()> {
        self.ensure_role(Role::Consumer)?;
        self.refresh()?;
        let endpoint = self.endpoint;
        self.header_mut()?.consumers[endpoint].tail = tail;
        self.flush_range(0, JournalHeader::SIZE)
    }

    /// View the entry stored for ring position `position`
    pub fn entry(&self, position: u32) -> Result<EntryRef<'_>> {
        let offset = entry_offset(position & self.mask);
        let entry = self
            .mmap
            .get(offset..)
            .and_then(JournalEntry::ref_from_prefix)
            .ok_or_else(|| {
                ChannelError::corrupted(format!("journal {:?} entry {} out of map", self.path, position))
            })?;
        Ok(EntryRef::from_entry(entry))
    }

    /// Remap if another process grew the file
    pub fn refresh(&mut self) -> Result<()> {
        if self.state == JournalState::Closed {
            return Err(ChannelError::invalid_argument(format!(
                "journal {:?} is closed",
                self.path
            )));
        }
        let (mask, generation) = {
            let header = self.header()?;
            (header.mask, header.generation)
        };
        if mask == self.mask && generation == self.generation {
            return Ok(());
        }
        if (self.mmap.len() as u64) < file_len(mask) {
            self.mmap = map(&self.file, &self.path)?;
        }
        debug!(
            "Journal {:?} moved to mask {:#x} generation {}",
            self.path, mask, generation
        );
        self.mask = mask;
        self.generation = generation;
        self.state = JournalState::Opened { mask };
        Ok(())
    }

    /// Flush everything and refuse further operations
    pub fn close(&mut self) -> Result<()> {
        if self.state == JournalState::Closed {
            return Ok(());
        }
        self.mmap
            .flush()
            .map_err(|e| ChannelError::journal(JournalOp::Sync, &self.path, e))?;
        self.state = JournalState::Closed;
        Ok(())
    }

    fn grow(&mut self) -> Result<()> {
        let from = self.mask;
        if from >= MAX_JOURNAL_MASK {
            warn!("Journal {:?} already at its largest mask {:#x}", self.path, from);
            return Ok(());
        }
        self.state = JournalState::Growing { from };
        let result = self.grow_locked(from);
        self.state = JournalState::Opened { mask: self.mask };
        result
    }

    fn grow_locked(&mut self, from: u32) -> Result<()> {
        let _lock = JournalLock::acquire(&self.file, &self.path)?;

        let on_disk = self.header()?.mask;
        if on_disk > from {
            self.mmap = map(&self.file, &self.path)?;
            let (mask, generation) = {
                let header = self.header()?;
                (header.mask, header.generation)
            };
            self.mask = mask;
            self.generation = generation;
            info!(
                "Journal {:?} was grown elsewhere, adopted mask {:#x}",
                self.path, self.mask
            );
            return Ok(());
        }

        let to = (from << 1) | 1;
        self.file
            .set_len(file_len(to))
            .map_err(|e| ChannelError::journal(JournalOp::Truncate, &self.path, e))?;
        self.mmap = map(&self.file, &self.path)?;

        let header = self.header_mut()?;
        header.mask = to;
        header.generation = header.generation.wrapping_add(1);
        let generation = header.generation;
        self.mmap
            .flush_range(0, JournalHeader::SIZE)
            .map_err(|e| ChannelError::journal(JournalOp::Sync, &self.path, e))?;

        self.mask = to;
        self.generation = generation;
        self.grows += 1;
        info!("Grew journal {:?} from {:#x} to {:#x}", self.path, from, to);
        Ok(())
    }

    fn ensure_role(&self, role: Role) -> Result<()> {
        if self.role != role {
            return Err(ChannelError::invalid_argument(format!(
                "journal {:?} opened as {}, not {}",
                self.path,
                self.role.as_str(),
                role.as_str()
            )));
        }
        Ok(())
    }

    fn header(&self) -> Result<&JournalHeader> {
        JournalHeader::ref_from_prefix(&self.mmap[..])
            .ok_or_else(|| ChannelError::corrupted(format!("journal {:?} header unmapped", self.path)))
    }

    fn header_mut(&mut self) -> Result<&mut JournalHeader> {
        header_mut(&mut self.mmap, &self.path)
    }

    fn entry_mut(&mut self, index: u32) -> Result<&mut JournalEntry> {
        let path = &self.path;
        self.mmap
            .get_mut(entry_offset(index)..)
            .and_then(JournalEntry::mut_from_prefix)
            .ok_or_else(|| ChannelError::corrupted(format!("journal {:?} entry {} out of map", path, index)))
    }

    fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        let result = if self.sync {
            self.mmap.flush_range(offset, len)
        } else {
            self.mmap.flush_async_range(offset, len)
        };
        result.map_err(|e| ChannelError::journal(JournalOp::Sync, &self.path, e))
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("role", &self.role)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish()
    }
}

fn map(file: &File, path: &Path) -> Result<MmapMut> {
    // SAFETY: the file stays open for the lifetime of the mapping and is
    // only ever extended, never truncated below a mapped length.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| ChannelError::journal(JournalOp::Map, path, e))
}

fn initialize(file: &File, path: &Path, mask: u32) -> Result<MmapMut> {
    file.set_len(file_len(mask))
        .map_err(|e| ChannelError::journal(JournalOp::Truncate, path, e))?;
    let mut mmap = map(file, path)?;
    *header_mut(&mut mmap, path)? = JournalHeader::new(mask);
    info!("Created journal {:?} with mask {:#x}", path, mask);
    Ok(mmap)
}

fn header_mut<'a>(mmap: &'a mut MmapMut, path: &Path) -> Result<&'a mut JournalHeader> {
    JournalHeader::mut_from_prefix(&mut mmap[..])
        .ok_or_else(|| ChannelError::corrupted(format!("journal {:?} header unmapped", path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, SegmentPool) {
        let dir = tempdir().unwrap();
        let pool = SegmentPool::create(dir.path(), "JOURNAL_POOL", 16).unwrap();
        (dir, pool)
    }

    fn options(initial_mask: u32) -> JournalOptions {
        JournalOptions {
            initial_mask,
            sync: false,
        }
    }

    #[test]
    fn test_append_records_head_segment() {
        let (dir, pool) = setup();
        let mut journal =
            Journal::open(dir.path(), "P_Q", Role::Producer, 0, "P_0", options(15)).unwrap();

        let head = codec::split(&pool, b"hello").unwrap();
        journal.append(&pool, &[head], 1, 1).unwrap();

        let entry = journal.entry(0).unwrap();
        assert_eq!(entry.len, 5);
        assert!(!entry.has_more);
        assert_eq!(entry.payload, b"hello");

        let long = vec![7u8; SEGMENT_CAPACITY + 1];
        let head = codec::split(&pool, &long).unwrap();
        journal.append(&pool, &[head], 2, 2).unwrap();
        let entry = journal.entry(1).unwrap();
        assert_eq!(entry.len as usize, SEGMENT_CAPACITY);
        assert!(entry.has_more);
    }

    #[test]
    fn test_roles_are_enforced() {
        let (dir, pool) = setup();
        let mut consumer =
            Journal::open(dir.path(), "P_Q", Role::Consumer, 0, "Q_0", options(15)).unwrap();
        let head = codec::split(&pool, b"x").unwrap();
        assert!(consumer.append(&pool, &[head], 1, 1).is_err());
        consumer.mark_read(1).unwrap();

        let reader = JournalReader::open(dir.path(), "P_Q").unwrap();
        assert_eq!(reader.endpoints(Role::Consumer), vec![("Q_0".to_string(), 1)]);
    }

    #[test]
    fn test_grow_past_ratio() {
        let (dir, pool) = setup();
        let mut journal =
            Journal::open(dir.path(), "P_Q", Role::Producer, 0, "P_0", options(15)).unwrap();
        let head = codec::split(&pool, b"m").unwrap();

        for tail in 1..=12u32 {
            journal.append(&pool, &[head], tail, tail).unwrap();
        }
        assert_eq!(journal.mask(), 15);

        journal.append(&pool, &[head], 13, 13).unwrap();
        assert_eq!(journal.mask(), 31);
        assert_eq!(journal.generation(), 1);
        assert_eq!(journal.grow_count(), 1);
        assert_eq!(journal.state(), JournalState::Opened { mask: 31 });

        let len = std::fs::metadata(journal.path()).unwrap().len();
        assert_eq!(len, file_len(31));
    }

    #[test]
    fn test_other_handles_adopt_growth() {
        let (dir, pool) = setup();
        let mut writer =
            Journal::open(dir.path(), "P_Q", Role::Producer, 0, "P_0", options(3)).unwrap();
        let mut peer =
            Journal::open(dir.path(), "P_Q", Role::Producer, 1, "P_1", options(3)).unwrap();
        let mut consumer =
            Journal::open(dir.path(), "P_Q", Role::Consumer, 0, "Q_0", options(3)).unwrap();
        let head = codec::split(&pool, b"m").unwrap();

        writer.append(&pool, &[head], 4, 4).unwrap();
        assert_eq!(writer.mask(), 7);

        consumer.mark_read(2).unwrap();
        assert_eq!(consumer.mask(), 7);

        // The peer saw the old mask and decides to grow; it adopts the
        // refreshed mask first, then grows from there.
        peer.append(&pool, &[head], 5, 7).unwrap();
        assert_eq!(peer.mask(), 15);
        assert_eq!(peer.generation(), 2);
    }

    #[test]
    fn test_reopen_keeps_mask_and_names() {
        let (dir, pool) = setup();
        {
            let mut journal =
                Journal::open(dir.path(), "P_Q", Role::Producer, 2, "P_7", options(3)).unwrap();
            let head = codec::split(&pool, b"m").unwrap();
            journal.append(&pool, &[head], 4, 4).unwrap();
            journal.close().unwrap();
            assert!(journal.refresh().is_err());
        }
        let journal =
            Journal::open(dir.path(), "P_Q", Role::Producer, 2, "P_7", options(0x7FF)).unwrap();
        assert_eq!(journal.mask(), 7);

        let reader = JournalReader::open(dir.path(), "P_Q").unwrap();
        let producers = reader.endpoints(Role::Producer);
        assert_eq!(producers.len(), 3);
        assert_eq!(producers[2], ("P_7".to_string(), 4));
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let dir = tempdir().unwrap();
        let err = Journal::open(dir.path(), "P_Q", Role::Producer, MAX_ENDPOINTS, "P_0", options(15))
            .unwrap_err();
        assert_eq!(err.category(), "invalid_argument");
        assert!(Journal::open(dir.path(), "P_Q", Role::Producer, 0, "P_0", options(10)).is_err());
    }

    #[test]
    fn test_open_failure_is_reported_as_open() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let err = Journal::open(&blocker, "P_Q", Role::Producer, 0, "P_0", options(15)).unwrap_err();
        assert!(matches!(err, ChannelError::Journal { op: JournalOp::Open, .. }));
    }
}
