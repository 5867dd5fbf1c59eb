//! Shared-memory segment pool
//!
//! Fixed-capacity buffer segments in one mapped file, addressed by index so
//! chains mean the same thing in every process. The free list is an
//! ordinary [`ShmRing`] named `MP_{pool}` holding segment handles.
//!
//! A segment is owned by whoever allocated or dequeued it. Ownership moves
//! between processes through ring publication, which orders the segment
//! writes before the reader's loads.

use memmap2::MmapMut;
use std::fs::{self, OpenOptions};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, Result};
use crate::ring::ShmRing;
use shmq_config::limits::{names::POOL_RING_PREFIX, SEGMENT_CAPACITY};

pub const POOL_MAGIC: u64 = u64::from_le_bytes(*b"SHMQPOOL");
pub const POOL_VERSION: u32 = 1;

/// `next` value of the last segment in a chain
pub const NO_NEXT: u32 = u32::MAX;

const POOL_FILE_EXT: &str = "pool";
const INIT_WAIT: Duration = Duration::from_secs(1);
const FILL_BATCH: usize = 256;

/// Index of a segment inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentId(u32);

impl SegmentId {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }

    /// Value stored in a ring slot; never the tombstone
    pub fn handle(&self) -> u64 {
        u64::from(self.0) + 1
    }

    pub fn from_handle(handle: u64) -> Option<Self> {
        handle
            .checked_sub(1)
            .and_then(|index| u32::try_from(index).ok())
            .map(Self)
    }
}

/// Per-segment bookkeeping stored in front of the payload bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Bytes used in this segment
    pub data_len: u32,
    /// Total payload bytes, meaningful on the chain head
    pub pkt_len: u32,
    /// Segments in the chain, meaningful on the chain head
    pub nb_segs: u32,
    /// Next segment index or [`NO_NEXT`]
    pub next: u32,
}

impl SegmentMeta {
    pub fn next_segment(&self) -> Option<SegmentId> {
        (self.next != NO_NEXT).then_some(SegmentId(self.next))
    }
}

#[repr(C, align(64))]
struct PoolHeader {
    magic: AtomicU64,
    version: u32,
    segments: u32,
    segment_capacity: u32,
    _reserved: u32,
}

const HEADER_LEN: usize = size_of::<PoolHeader>();
const STRIDE: usize = size_of::<SegmentMeta>() + SEGMENT_CAPACITY;

/// A mapped segment pool
pub struct SegmentPool {
    name: String,
    path: PathBuf,
    mmap: MmapMut,
    free: ShmRing,
    segments: u32,
}

impl std::fmt::Debug for SegmentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentPool")
            .field("name", &self.name)
            .field("segments", &self.segments)
            .field("available", &self.available())
            .finish()
    }
}

impl SegmentPool {
    pub fn path_for(root: &Path, name: &str) -> PathBuf {
        root.join(format!("{}.{}", name, POOL_FILE_EXT))
    }

    /// Name of the ring holding the free list of pool `name`
    pub fn free_ring_name(name: &str) -> String {
        format!("{}{}", POOL_RING_PREFIX, name)
    }

    fn mapped_len(segments: u32) -> usize {
        HEADER_LEN + segments as usize * STRIDE
    }

    /// Create a pool of `segments` free segments
    pub fn create(root: &Path, name: &str, segments: u32) -> Result<Self> {
        if segments == 0 || segments > crate::ring::MAX_RING_CAPACITY {
            return Err(ChannelError::invalid_argument(format!(
                "pool {} cannot hold {} segments",
                name, segments
            )));
        }
        fs::create_dir_all(root)
            .map_err(|e| ChannelError::io(format!("Failed to create shm root {:?}", root), e))?;

        let path = Self::path_for(root, name);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ChannelError::already_exists(name));
            }
            Err(e) => return Err(ChannelError::io(format!("Failed to create pool {:?}", path), e)),
        };
        file.set_len(Self::mapped_len(segments) as u64)
            .map_err(|e| ChannelError::io(format!("Failed to size pool {:?}", path), e))?;
        // SAFETY: freshly created file, sized above.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| ChannelError::io(format!("Failed to map pool {:?}", path), e))?;

        let header = mmap.as_mut_ptr() as *mut PoolHeader;
        // SAFETY: the header is not visible to other processes until the
        // magic is published.
        unsafe {
            (*header).version = POOL_VERSION;
            (*header).segments = segments;
            (*header).segment_capacity = SEGMENT_CAPACITY as u32;
        }

        // A free-list ring without its pool file is left over from a crash.
        let ring_name = Self::free_ring_name(name);
        let capacity = segments.next_power_of_two();
        let free = match ShmRing::create(root, &ring_name, capacity) {
            Err(e) if e.is_already_exists() => {
                warn!("Replacing stale free list {} of pool {}", ring_name, name);
                ShmRing::remove(root, &ring_name)?;
                ShmRing::create(root, &ring_name, capacity)?
            }
            other => other?,
        };

        let handles: Vec<u64> = (0..segments).map(|i| SegmentId(i).handle()).collect();
        for chunk in handles.chunks(FILL_BATCH) {
            free.enqueue(chunk, None)?;
        }

        let pool = Self {
            name: name.to_string(),
            path,
            mmap,
            free,
            segments,
        };
        pool.header().magic.store(POOL_MAGIC, Ordering::Release);
        info!("Created segment pool {} with {} segments", name, segments);
        Ok(pool)
    }

    /// Map an existing pool
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        let path = Self::path_for(root, name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChannelError::not_found("pool", name));
            }
            Err(e) => return Err(ChannelError::io(format!("Failed to open pool {:?}", path), e)),
        };

        let started = Instant::now();
        while file.metadata()?.len() < HEADER_LEN as u64 {
            if started.elapsed() > INIT_WAIT {
                return Err(ChannelError::corrupted(format!("pool {} has no header", name)));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        // SAFETY: layout validated below before any segment access.
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| ChannelError::io(format!("Failed to map pool {:?}", path), e))?;

        let header = mmap.as_ptr() as *const PoolHeader;
        // SAFETY: the mapping holds at least HEADER_LEN bytes.
        let magic = unsafe { &(*header).magic };
        while magic.load(Ordering::Acquire) != POOL_MAGIC {
            if started.elapsed() > INIT_WAIT {
                return Err(ChannelError::corrupted(format!("pool {} has a bad magic", name)));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        // SAFETY: immutable after the magic is published.
        let (version, segments, segment_capacity) =
            unsafe { ((*header).version, (*header).segments, (*header).segment_capacity) };
        if version != POOL_VERSION
            || segment_capacity as usize != SEGMENT_CAPACITY
            || mmap.len() < Self::mapped_len(segments)
        {
            return Err(ChannelError::corrupted(format!(
                "pool {} layout mismatch (version {}, segment capacity {})",
                name, version, segment_capacity
            )));
        }

        let free = ShmRing::open(root, &Self::free_ring_name(name))?;
        debug!("Opened segment pool {} ({} segments)", name, segments);
        Ok(Self {
            name: name.to_string(),
            path,
            mmap,
            free,
            segments,
        })
    }

    pub fn open_or_create(root: &Path, name: &str, segments: u32) -> Result<Self> {
        match Self::open(root, name) {
            Err(ChannelError::NotFound { .. }) => match Self::create(root, name, segments) {
                Err(e) if e.is_already_exists() => Self::open(root, name),
                other => other,
            },
            other => other,
        }
    }

    /// Unlink the pool and its free list
    pub fn remove(root: &Path, name: &str) -> Result<()> {
        let path = Self::path_for(root, name);
        fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ChannelError::not_found("pool", name),
            _ => ChannelError::io(format!("Failed to remove pool {:?}", path), e),
        })?;
        ShmRing::remove(root, &Self::free_ring_name(name))
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: mapping is at least HEADER_LEN bytes; only the magic is
        // written after creation.
        unsafe { &*(self.mmap.as_ptr() as *const PoolHeader) }
    }

    fn segment_ptr(&self, id: SegmentId) -> Result<*mut u8> {
        if id.0 >= self.segments {
            return Err(ChannelError::corrupted(format!(
                "segment {} outside pool {} of {} segments",
                id.0, self.name, self.segments
            )));
        }
        let offset = HEADER_LEN + id.0 as usize * STRIDE;
        // SAFETY: offset + STRIDE <= mapped_len(segments) <= mmap.len().
        Ok(unsafe { self.mmap.as_ptr().add(offset) as *mut u8 })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segments in the pool
    pub fn capacity(&self) -> u32 {
        self.segments
    }

    /// Segments currently free
    pub fn available(&self) -> u32 {
        self.free.count()
    }

    pub fn segment_capacity(&self) -> usize {
        SEGMENT_CAPACITY
    }

    /// Take one free segment, `None` when the pool is exhausted
    pub fn allocate(&self) -> Option<SegmentId> {
        let mut handle = [0u64; 1];
        match self.free.try_dequeue(&mut handle, None) {
            Ok(true) => SegmentId::from_handle(handle[0]),
            Ok(false) => None,
            Err(e) => {
                error!("Free list of pool {} failed: {}", self.name, e);
                None
            }
        }
    }

    /// Return one segment to the pool
    pub fn free(&self, id: SegmentId) {
        if id.0 >= self.segments {
            error!("Ignoring free of segment {} outside pool {}", id.0, self.name);
            return;
        }
        if let Err(e) = self.free.enqueue(&[id.handle()], None) {
            error!("Failed to return segment {} to pool {}: {}", id.0, self.name, e);
        }
    }

    /// Return every segment of the chain starting at `head`
    ///
    /// Stops at a broken link. Returns the number of segments freed.
    pub fn free_chain(&self, head: SegmentId) -> usize {
        let mut freed = 0usize;
        let mut current = Some(head);
        while let Some(id) = current {
            if freed >= self.segments as usize {
                error!("Chain from segment {} in pool {} loops", head.0, self.name);
                break;
            }
            current = match self.meta(id) {
                Ok(meta) => meta.next_segment(),
                Err(e) => {
                    error!("Stopped freeing chain from segment {}: {}", head.0, e);
                    break;
                }
            };
            self.free(id);
            freed += 1;
        }
        freed
    }

    pub fn meta(&self, id: SegmentId) -> Result<SegmentMeta> {
        let base = self.segment_ptr(id)?;
        // SAFETY: in bounds, SegmentMeta is plain data at the segment start.
        Ok(unsafe { ptr::read_volatile(base as *const SegmentMeta) })
    }

    pub fn set_meta(&self, id: SegmentId, meta: SegmentMeta) -> Result<()> {
        let base = self.segment_ptr(id)?;
        // SAFETY: in bounds; the caller owns the segment.
        unsafe { ptr::write_volatile(base as *mut SegmentMeta, meta) };
        Ok(())
    }

    /// Payload bytes of a segment, full capacity
    pub fn data(&self, id: SegmentId) -> Result<&[u8]> {
        let base = self.segment_ptr(id)?;
        // SAFETY: in bounds; payload follows the metadata.
        Ok(unsafe {
            std::slice::from_raw_parts(base.add(size_of::<SegmentMeta>()), SEGMENT_CAPACITY)
        })
    }

    /// Writable payload bytes of a segment
    ///
    /// # Safety
    ///
    /// The caller must own `id` (allocated it and not yet published or
    /// freed it) and must not hold another slice of the same segment.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self, id: SegmentId) -> Result<&mut [u8]> {
        let base = self.segment_ptr(id)?;
        Ok(std::slice::from_raw_parts_mut(
            base.add(size_of::<SegmentMeta>()),
            SEGMENT_CAPACITY,
        ))
    }
}
