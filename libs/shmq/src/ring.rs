//! Shared-memory ring
//!
//! A named, fixed-capacity multi-producer/multi-consumer ring living in a
//! file under the shm root. Every attached process maps the same file, so
//! everything below the control block header is either an atomic or only
//! touched under the registry word.
//!
//! ## Layout
//!
//! ```text
//! +--------------------+  offset 0
//! | RingHeader         |  magic, capacity, mask, name,
//! |                    |  producer head/tail, consumer head/tail,
//! |                    |  registry word, producer and consumer endpoint tables
//! +--------------------+  size_of::<RingHeader>()
//! | [AtomicU64; cap]   |  message handles (segment index + 1, 0 = tombstone)
//! +--------------------+
//! ```
//!
//! ## Positions
//!
//! Head and tail counters are free-running `u32` values compared with
//! wrapping arithmetic. A producer reserves `[head, head + n)` with a CAS on
//! the producer head, fills the slots, then publishes by moving the producer
//! tail once every earlier reservation has been published. Consumers do the
//! same on their side. A consumer that dequeues with an endpoint index keeps
//! its reservation open until [`ShmRing::read_complete`], so the slots cannot
//! be overwritten while the message is still being processed.
//!
//! Each endpoint slot records the reservation it is working on
//! (`tail` = start, `head` = end). After an unclean restart those two values
//! are what the registry uses to work out whether the endpoint left the ring
//! stuck.

use memmap2::MmapMut;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::cell::UnsafeCell;
use std::fs::{self, OpenOptions};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use std::{ptr, slice};
use tracing::{debug, info, warn};

use crate::error::{ChannelError, Result};
use shmq_config::limits::{CHANNEL_NAME_LEN, ENDPOINT_NAME_LEN, MAX_ENDPOINTS};

pub const RING_MAGIC: u64 = u64::from_le_bytes(*b"SHMQRING");
pub const RING_VERSION: u32 = 1;

/// Largest capacity a ring accepts
pub const MAX_RING_CAPACITY: u32 = 1 << 30;

/// Handle value left in a slot whose message was abandoned
pub const TOMBSTONE: u64 = 0;

const RING_FILE_EXT: &str = "ring";
const INIT_WAIT: Duration = Duration::from_secs(1);
const SPINS_BEFORE_YIELD: u32 = 1_024;
const SPINS_BETWEEN_STALE_CHECKS: u64 = 1 << 20;

/// Side of a ring an endpoint works on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }
}

#[repr(C, align(64))]
struct HeadTail {
    head: AtomicU32,
    tail: AtomicU32,
}

#[repr(C, align(64))]
struct RegistryWord {
    owner: AtomicU32,
}

/// One registered endpoint, shared by every attached process
#[repr(C)]
pub struct EndpointSlot {
    name: UnsafeCell<[u8; ENDPOINT_NAME_LEN]>,
    pid: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    sleep: AtomicU32,
    restore: AtomicU32,
    restore_start: AtomicU32,
}

impl EndpointSlot {
    /// Display name, `{process}_{instance}`
    pub fn name(&self) -> String {
        // SAFETY: the name is written once under the registry word before the
        // slot becomes visible through the table count and only overwritten
        // with identical bytes afterwards.
        let bytes = unsafe { ptr::read_volatile(self.name.get()) };
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    /// End of the reservation this endpoint last made
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// Last position this endpoint acknowledged
    pub fn tail(&self) -> u32 {
        self.tail.load(Ordering::Acquire)
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleep.load(Ordering::Acquire) != 0
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleep.store(u32::from(sleeping), Ordering::Release);
    }

    /// Clear the sleep flag, returning whether it was set
    pub fn take_sleeping(&self) -> bool {
        self.sleep.swap(0, Ordering::AcqRel) != 0
    }

    /// Offset a pending restore starts from
    pub fn restore_start(&self) -> Option<u32> {
        (self.restore.load(Ordering::Acquire) != 0)
            .then(|| self.restore_start.load(Ordering::Acquire))
    }

    pub(crate) fn mark_restore(&self, start: u32) {
        self.restore_start.store(start, Ordering::Release);
        self.restore.store(1, Ordering::Release);
    }

    fn take_restore(&self) -> Option<u32> {
        let start = self.restore_start.load(Ordering::Acquire);
        (self.restore.swap(0, Ordering::AcqRel) != 0).then_some(start)
    }

    pub(crate) fn set_pid(&self, pid: u32, _guard: &RegistryGuard<'_>) {
        self.pid.store(pid, Ordering::Release);
    }

    fn set_name(&self, name: &str, _guard: &RegistryGuard<'_>) {
        let mut bytes = [0u8; ENDPOINT_NAME_LEN];
        let len = name.len().min(ENDPOINT_NAME_LEN - 1);
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        // SAFETY: the registry guard serializes every writer of this field.
        unsafe { ptr::write_volatile(self.name.get(), bytes) };
    }

    pub(crate) fn set_reservation(&self, start: u32, end: u32) {
        self.tail.store(start, Ordering::Relaxed);
        self.head.store(end, Ordering::Release);
    }
}

/// Fixed table of endpoints for one side of a ring
#[repr(C, align(64))]
pub struct EndpointTable {
    count: AtomicU32,
    slots: [EndpointSlot; MAX_ENDPOINTS],
}

impl EndpointTable {
    pub fn len(&self) -> usize {
        (self.count.load(Ordering::Acquire) as usize).min(MAX_ENDPOINTS)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&EndpointSlot> {
        (index < self.len()).then(|| &self.slots[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointSlot> {
        self.slots[..self.len()].iter()
    }

    /// Append a slot named `name` positioned at `position`
    ///
    /// Returns `None` when the table is full.
    pub(crate) fn push(&self, name: &str, position: u32, guard: &RegistryGuard<'_>) -> Option<usize> {
        let index = self.len();
        if index >= MAX_ENDPOINTS {
            return None;
        }
        let slot = &self.slots[index];
        slot.set_name(name, guard);
        slot.sleep.store(0, Ordering::Relaxed);
        slot.restore.store(0, Ordering::Relaxed);
        slot.set_reservation(position, position);
        self.count.store(index as u32 + 1, Ordering::Release);
        Some(index)
    }
}

#[repr(C)]
struct RingHeader {
    magic: AtomicU64,
    version: u32,
    capacity: u32,
    mask: u32,
    _reserved: u32,
    name: [u8; CHANNEL_NAME_LEN],
    prod: HeadTail,
    cons: HeadTail,
    registry: RegistryWord,
    producers: EndpointTable,
    consumers: EndpointTable,
}

const HEADER_LEN: usize = size_of::<RingHeader>();

/// Held while mutating an endpoint table
pub struct RegistryGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

/// A mapped shared-memory ring
pub struct ShmRing {
    name: String,
    path: PathBuf,
    mmap: MmapMut,
}

impl std::fmt::Debug for ShmRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRing")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish()
    }
}

impl ShmRing {
    /// File backing the ring `name` under `root`
    pub fn path_for(root: &Path, name: &str) -> PathBuf {
        root.join(format!("{}.{}", name, RING_FILE_EXT))
    }

    /// Bytes mapped for a ring of `capacity` slots
    pub fn mapped_len(capacity: u32) -> usize {
        HEADER_LEN + capacity as usize * size_of::<AtomicU64>()
    }

    /// Create a ring, failing with `AlreadyExists` if the file is present
    pub fn create(root: &Path, name: &str, capacity: u32) -> Result<Self> {
        validate_name(name)?;
        if capacity == 0 || !capacity.is_power_of_two() || capacity > MAX_RING_CAPACITY {
            return Err(ChannelError::invalid_argument(format!(
                "ring capacity {:#x} must be a power of two in 1..={:#x}",
                capacity, MAX_RING_CAPACITY
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
            Err(e) => {
                return Err(ChannelError::io(format!("Failed to create ring {:?}", path), e));
            }
        };

        file.set_len(Self::mapped_len(capacity) as u64)
            .map_err(|e| ChannelError::io(format!("Failed to size ring {:?}", path), e))?;
        // SAFETY: the file was just created by us and sized above; other
        // processes only access it through the same layout.
        let mut mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| ChannelError::io(format!("Failed to map ring {:?}", path), e))?;

        let header = mmap.as_mut_ptr() as *mut RingHeader;
        // SAFETY: the mapping is zero-filled and nobody else can observe the
        // immutable fields before the magic is published below.
        unsafe {
            (*header).version = RING_VERSION;
            (*header).capacity = capacity;
            (*header).mask = capacity - 1;
            (&mut (*header).name)[..name.len()].copy_from_slice(name.as_bytes());
        }

        let ring = Self {
            name: name.to_string(),
            path,
            mmap,
        };
        ring.header().magic.store(RING_MAGIC, Ordering::Release);
        info!("Created ring {} with {} slots at {:?}", name, capacity, ring.path);
        Ok(ring)
    }

    /// Map an existing ring, failing with `NotFound` if absent
    pub fn open(root: &Path, name: &str) -> Result<Self> {
        validate_name(name)?;
        let path = Self::path_for(root, name);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ChannelError::not_found("ring", name));
            }
            Err(e) => return Err(ChannelError::io(format!("Failed to open ring {:?}", path), e)),
        };

        // A creator may still be sizing the file.
        let started = Instant::now();
        while file.metadata()?.len() < HEADER_LEN as u64 {
            if started.elapsed() > INIT_WAIT {
                return Err(ChannelError::corrupted(format!(
                    "ring {} is shorter than its header",
                    name
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        // SAFETY: see `create`; the layout is validated below before use.
        let mmap = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| ChannelError::io(format!("Failed to map ring {:?}", path), e))?;
        let ring = Self {
            name: name.to_string(),
            path,
            mmap,
        };

        while ring.header().magic.load(Ordering::Acquire) != RING_MAGIC {
            if started.elapsed() > INIT_WAIT {
                return Err(ChannelError::corrupted(format!("ring {} has a bad magic", name)));
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let header = ring.header();
        if header.version != RING_VERSION {
            return Err(ChannelError::corrupted(format!(
                "ring {} has version {}, expected {}",
                name, header.version, RING_VERSION
            )));
        }
        if !header.capacity.is_power_of_two()
            || header.mask != header.capacity - 1
            || ring.mmap.len() < Self::mapped_len(header.capacity)
        {
            return Err(ChannelError::corrupted(format!(
                "ring {} has an inconsistent capacity {:#x}",
                name, header.capacity
            )));
        }
        let stored = header.name.split(|b| *b == 0).next().unwrap_or_default();
        if stored != name.as_bytes() {
            return Err(ChannelError::corrupted(format!(
                "ring file {:?} belongs to {:?}",
                ring.path,
                String::from_utf8_lossy(stored)
            )));
        }

        debug!("Opened ring {} ({} slots)", name, header.capacity);
        Ok(ring)
    }

    /// Open `name`, creating it with `capacity` slots if absent
    ///
    /// Losing a creation race to another process counts as success.
    pub fn open_or_create(root: &Path, name: &str, capacity: u32) -> Result<Self> {
        match Self::open(root, name) {
            Err(ChannelError::NotFound { .. }) => match Self::create(root, name, capacity) {
                Err(e) if e.is_already_exists() => Self::open(root, name),
                other => other,
            },
            other => other,
        }
    }

    /// Unlink the backing file; existing mappings stay valid
    pub fn remove(root: &Path, name: &str) -> Result<()> {
        let path = Self::path_for(root, name);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("Removed ring {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ChannelError::not_found("ring", name))
            }
            Err(e) => Err(ChannelError::io(format!("Failed to remove ring {:?}", path), e)),
        }
    }

    /// Ring names found under `root`
    pub fn list(root: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(ChannelError::io(format!("Failed to list {:?}", root), e)),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RING_FILE_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the mapping is page aligned and at least HEADER_LEN bytes
        // (checked in `open`, sized in `create`). Fields mutated after
        // creation are atomics or guarded by the registry word.
        unsafe { &*(self.mmap.as_ptr() as *const RingHeader) }
    }

    fn slots(&self) -> &[AtomicU64] {
        // SAFETY: the slot array follows the header and the mapping covers
        // `mapped_len(capacity)` bytes; HEADER_LEN is a multiple of 64.
        unsafe {
            slice::from_raw_parts(
                self.mmap.as_ptr().add(HEADER_LEN) as *const AtomicU64,
                self.capacity() as usize,
            )
        }
    }

    fn side(&self, role: Role) -> &HeadTail {
        match role {
            Role::Producer => &self.header().prod,
            Role::Consumer => &self.header().cons,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    pub fn mask(&self) -> u32 {
        self.header().mask
    }

    /// Channel-wide head for one side
    pub fn head(&self, role: Role) -> u32 {
        self.side(role).head.load(Ordering::Acquire)
    }

    /// Channel-wide tail for one side
    pub fn tail(&self, role: Role) -> u32 {
        self.side(role).tail.load(Ordering::Acquire)
    }

    /// Published messages not yet released by consumers
    pub fn count(&self) -> u32 {
        self.tail(Role::Producer).wrapping_sub(self.tail(Role::Consumer))
    }

    /// Published messages no consumer has reserved yet
    pub fn readable(&self) -> u32 {
        self.tail(Role::Producer).wrapping_sub(self.head(Role::Consumer))
    }

    pub fn free_count(&self) -> u32 {
        self.capacity()
            .wrapping_add(self.tail(Role::Consumer))
            .wrapping_sub(self.head(Role::Producer))
    }

    pub fn endpoints(&self, role: Role) -> &EndpointTable {
        match role {
            Role::Producer => &self.header().producers,
            Role::Consumer => &self.header().consumers,
        }
    }

    /// Handle stored at a free-running position
    pub fn peek(&self, position: u32) -> u64 {
        self.slots()[(position & self.mask()) as usize].load(Ordering::Acquire)
    }

    /// Force a side's head to `position`, returning the previous head
    pub(crate) fn rewind_head(&self, role: Role, position: u32) -> u32 {
        self.side(role).head.swap(position, Ordering::AcqRel)
    }

    /// Move both sides of an empty ring to `position`
    #[cfg(test)]
    pub(crate) fn set_position(&self, position: u32) {
        let header = self.header();
        for side in [&header.prod, &header.cons] {
            side.head.store(position, Ordering::Release);
            side.tail.store(position, Ordering::Release);
        }
    }

    /// Take the registry word, spinning while another endpoint holds it
    ///
    /// A word held by a process that no longer exists is taken over.
    pub fn lock_registry(&self) -> RegistryGuard<'_> {
        let me = std::process::id();
        let word = &self.header().registry.owner;
        let mut spins: u64 = 0;
        loop {
            match word.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return RegistryGuard { word },
                Err(owner) => {
                    spins += 1;
                    if spins % SPINS_BETWEEN_STALE_CHECKS == 0
                        && owner != 0
                        && owner != me
                        && !process_alive(owner)
                        && word
                            .compare_exchange(owner, me, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                    {
                        warn!(
                            "Took over registry of ring {} from dead process {}",
                            self.name, owner
                        );
                        return RegistryGuard { word };
                    }
                    backoff(spins);
                }
            }
        }
    }

    /// Enqueue every handle or none of them
    ///
    /// With an endpoint index the producer slot records the reservation.
    pub fn enqueue(&self, handles: &[u64], endpoint: Option<usize>) -> Result<()> {
        let n = u32::try_from(handles.len())
            .map_err(|_| ChannelError::invalid_argument("too many handles in one enqueue"))?;
        if n == 0 {
            return Ok(());
        }
        let slot = self.endpoint_slot(Role::Producer, endpoint)?;
        let header = self.header();

        let (start, end) = loop {
            let head = header.prod.head.load(Ordering::Acquire);
            let cons_tail = header.cons.tail.load(Ordering::Acquire);
            let free = header.capacity.wrapping_add(cons_tail).wrapping_sub(head);
            if n > free {
                return Err(ChannelError::resource_exhausted(
                    "channel",
                    format!("{}: {} free slots, {} requested", self.name, free, n),
                ));
            }
            let next = head.wrapping_add(n);
            if header
                .prod
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (head, next);
            }
        };

        if let Some(slot) = slot {
            slot.set_reservation(start, end);
        }
        let slots = self.slots();
        for (offset, handle) in handles.iter().enumerate() {
            let position = start.wrapping_add(offset as u32) & header.mask;
            slots[position as usize].store(*handle, Ordering::Relaxed);
        }
        publish(&header.prod.tail, start, end);
        if let Some(slot) = slot {
            slot.tail.store(end, Ordering::Release);
        }
        Ok(())
    }

    /// Dequeue exactly `out.len()` handles, `false` if not enough are published
    ///
    /// Without an endpoint index the slots are released immediately. With
    /// one, they stay reserved until [`ShmRing::read_complete`].
    pub fn try_dequeue(&self, out: &mut [u64], endpoint: Option<usize>) -> Result<bool> {
        let n = u32::try_from(out.len())
            .map_err(|_| ChannelError::invalid_argument("too many handles in one dequeue"))?;
        if n == 0 {
            return Ok(true);
        }
        let slot = self.endpoint_slot(Role::Consumer, endpoint)?;
        let header = self.header();

        let (start, end) = loop {
            let head = header.cons.head.load(Ordering::Acquire);
            let prod_tail = header.prod.tail.load(Ordering::Acquire);
            if n > prod_tail.wrapping_sub(head) {
                return Ok(false);
            }
            let next = head.wrapping_add(n);
            if header
                .cons
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (head, next);
            }
        };

        let slots = self.slots();
        for (offset, handle) in out.iter_mut().enumerate() {
            let position = start.wrapping_add(offset as u32) & header.mask;
            *handle = slots[position as usize].load(Ordering::Relaxed);
        }

        match slot {
            Some(slot) => slot.set_reservation(start, end),
            None => publish(&header.cons.tail, start, end),
        }
        Ok(true)
    }

    /// Release the consumer reservation of `endpoint`
    pub fn read_complete(&self, endpoint: usize) -> Result<()> {
        let slot = self
            .endpoint_slot(Role::Consumer, Some(endpoint))?
            .ok_or_else(|| ChannelError::invalid_argument("missing consumer endpoint"))?;
        let (start, end) = (slot.tail(), slot.head());
        if start != end {
            publish(&self.header().cons.tail, start, end);
            slot.tail.store(end, Ordering::Release);
        }
        Ok(())
    }

    /// Publish a producer reservation left behind by a crashed predecessor
    ///
    /// The abandoned slots are tombstoned so consumers skip them. Returns
    /// the number of sealed slots, `None` if no restore was pending.
    pub fn seal_producer(&self, endpoint: usize) -> Result<Option<u32>> {
        let Some(slot) = self.endpoint_slot(Role::Producer, Some(endpoint))? else {
            return Ok(None);
        };
        let Some(start) = slot.take_restore() else {
            return Ok(None);
        };
        let end = slot.head();
        let len = end.wrapping_sub(start);
        let header = self.header();
        if len == 0 || len > header.capacity {
            slot.tail.store(end, Ordering::Release);
            return Ok(Some(0));
        }

        let slots = self.slots();
        for offset in 0..len {
            let position = start.wrapping_add(offset) & header.mask;
            slots[position as usize].store(TOMBSTONE, Ordering::Relaxed);
        }
        if !publish_sealed(&header.prod.tail, start, end) {
            warn!(
                "Ring {} producer tail moved past {} before restore; nothing to seal",
                self.name, start
            );
            return Ok(Some(0));
        }
        slot.tail.store(end, Ordering::Release);
        Ok(Some(len))
    }

    /// Release a consumer reservation left behind by a crashed predecessor
    ///
    /// Handles of the abandoned messages are appended to `abandoned` so the
    /// caller can return their segments. Returns `None` if no restore was
    /// pending.
    pub fn seal_consumer(&self, endpoint: usize, abandoned: &mut Vec<u64>) -> Result<Option<u32>> {
        let Some(slot) = self.endpoint_slot(Role::Consumer, Some(endpoint))? else {
            return Ok(None);
        };
        let Some(start) = slot.take_restore() else {
            return Ok(None);
        };
        let end = slot.head();
        let len = end.wrapping_sub(start);
        let header = self.header();
        if len == 0 || len > header.capacity {
            slot.tail.store(end, Ordering::Release);
            return Ok(Some(0));
        }

        // Collect before releasing: once the tail moves producers may reuse the slots.
        let slots = self.slots();
        let handles: Vec<u64> = (0..len)
            .map(|offset| {
                let position = start.wrapping_add(offset) & header.mask;
                slots[position as usize].load(Ordering::Acquire)
            })
            .filter(|handle| *handle != TOMBSTONE)
            .collect();

        if !publish_sealed(&header.cons.tail, start, end) {
            warn!(
                "Ring {} consumer tail moved past {} before restore; nothing to seal",
                self.name, start
            );
            return Ok(Some(0));
        }
        abandoned.extend(handles);
        slot.tail.store(end, Ordering::Release);
        Ok(Some(len))
    }

    fn endpoint_slot(&self, role: Role, endpoint: Option<usize>) -> Result<Option<&EndpointSlot>> {
        match endpoint {
            None => Ok(None),
            Some(index) => self.endpoints(role).get(index).map(Some).ok_or_else(|| {
                ChannelError::invalid_argument(format!(
                    "{} endpoint {} is not registered on {}",
                    role.as_str(),
                    index,
                    self.name
                ))
            }),
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() >= CHANNEL_NAME_LEN || name.contains('/') || name.contains('\0') {
        return Err(ChannelError::invalid_argument(format!(
            "invalid channel name {:?}",
            name
        )));
    }
    Ok(())
}

/// Wait for earlier reservations on this side, then publish ours
fn publish(tail: &AtomicU32, start: u32, end: u32) {
    let mut spins: u64 = 0;
    while tail.load(Ordering::Acquire) != start {
        spins += 1;
        backoff(spins);
    }
    tail.store(end, Ordering::Release);
}

/// Publish an abandoned reservation once every earlier one is published
///
/// `false` when the tail is already past `start`.
fn publish_sealed(tail: &AtomicU32, start: u32, end: u32) -> bool {
    let mut spins: u64 = 0;
    loop {
        let current = tail.load(Ordering::Acquire);
        if current == start {
            tail.store(end, Ordering::Release);
            return true;
        }
        if ahead_of(current, start) {
            return false;
        }
        spins += 1;
        backoff(spins);
    }
}

/// Whether free-running position `a` is past `b`
///
/// Positions wrap at 2^32, so they are compared by signed distance.
pub fn ahead_of(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn backoff(spins: u64) {
    if spins < u64::from(SPINS_BEFORE_YIELD) {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// Whether a process with `pid` still exists
pub fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn push_endpoint(ring: &ShmRing, role: Role, name: &str) -> usize {
        let guard = ring.lock_registry();
        ring.endpoints(role).push(name, ring.tail(role), &guard).unwrap()
    }

    #[test]
    fn test_header_is_cache_aligned() {
        assert_eq!(HEADER_LEN % 64, 0);
        assert_eq!(size_of::<EndpointSlot>(), ENDPOINT_NAME_LEN + 24);
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 16).unwrap();
        assert_eq!(ring.capacity(), 16);
        assert_eq!(ring.mask(), 15);

        let reopened = ShmRing::open(dir.path(), "P_Q").unwrap();
        assert_eq!(reopened.capacity(), 16);
        assert_eq!(ShmRing::list(dir.path()).unwrap(), vec!["P_Q".to_string()]);

        // The header remembers which channel the file was created for.
        fs::copy(ShmRing::path_for(dir.path(), "P_Q"), ShmRing::path_for(dir.path(), "P_R")).unwrap();
        let err = ShmRing::open(dir.path(), "P_R").unwrap_err();
        assert_eq!(err.category(), "corrupted");
    }

    #[test]
    fn test_create_rejects_bad_arguments() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            ShmRing::create(dir.path(), "P_Q", 12),
            Err(ChannelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            ShmRing::create(dir.path(), "", 16),
            Err(ChannelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            ShmRing::open(dir.path(), "missing"),
            Err(ChannelError::NotFound { .. })
        ));
    }

    #[test]
    fn test_create_race_is_benign() {
        let dir = tempdir().unwrap();
        let _first = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        let err = ShmRing::create(dir.path(), "P_Q", 8).unwrap_err();
        assert!(err.is_already_exists());

        let ring = ShmRing::open_or_create(dir.path(), "P_Q", 32).unwrap();
        assert_eq!(ring.capacity(), 8);
    }

    #[test]
    fn test_fifo_and_full() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 4).unwrap();

        ring.enqueue(&[1, 2, 3], None).unwrap();
        ring.enqueue(&[4], None).unwrap();
        let err = ring.enqueue(&[5], None).unwrap_err();
        assert_eq!(err.category(), "resource_exhausted");
        assert_eq!(ring.count(), 4);

        let mut out = [0u64; 2];
        assert!(ring.try_dequeue(&mut out, None).unwrap());
        assert_eq!(out, [1, 2]);
        ring.enqueue(&[5, 6], None).unwrap();

        let mut rest = [0u64; 4];
        assert!(ring.try_dequeue(&mut rest, None).unwrap());
        assert_eq!(rest, [3, 4, 5, 6]);
        assert!(!ring.try_dequeue(&mut out, None).unwrap());
    }

    #[test]
    fn test_tracked_consumer_holds_slots_until_complete() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 2).unwrap();
        let producer = push_endpoint(&ring, Role::Producer, "P_0");
        let consumer = push_endpoint(&ring, Role::Consumer, "Q_0");

        ring.enqueue(&[7, 8], Some(producer)).unwrap();
        assert_eq!(ring.endpoints(Role::Producer).get(producer).unwrap().tail(), 2);

        let mut out = [0u64; 1];
        assert!(ring.try_dequeue(&mut out, Some(consumer)).unwrap());
        assert_eq!(out[0], 7);
        assert!(ring.enqueue(&[9], Some(producer)).is_err());

        ring.read_complete(consumer).unwrap();
        let slot = ring.endpoints(Role::Consumer).get(consumer).unwrap();
        assert_eq!((slot.tail(), slot.head()), (1, 1));
        ring.enqueue(&[9], Some(producer)).unwrap();
    }

    #[test]
    fn test_unregistered_endpoint_is_rejected() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 2).unwrap();
        assert!(matches!(
            ring.enqueue(&[1], Some(3)),
            Err(ChannelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_seal_consumer_releases_abandoned_reservation() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        let crashed = push_endpoint(&ring, Role::Consumer, "Q_0");
        let peer = push_endpoint(&ring, Role::Consumer, "Q_1");

        ring.enqueue(&[11, 12, 13], None).unwrap();
        let mut out = [0u64; 1];
        assert!(ring.try_dequeue(&mut out, Some(crashed)).unwrap());
        assert!(ring.try_dequeue(&mut out, Some(peer)).unwrap());

        ring.endpoints(Role::Consumer).get(crashed).unwrap().mark_restore(0);
        let mut abandoned = Vec::new();
        assert_eq!(ring.seal_consumer(crashed, &mut abandoned).unwrap(), Some(1));
        assert_eq!(abandoned, vec![11]);
        assert_eq!(ring.tail(Role::Consumer), 1);

        ring.read_complete(peer).unwrap();
        assert_eq!(ring.tail(Role::Consumer), 2);
        assert_eq!(ring.seal_consumer(crashed, &mut abandoned).unwrap(), None);
    }

    #[test]
    fn test_seal_producer_tombstones_abandoned_slots() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        let crashed = push_endpoint(&ring, Role::Producer, "P_0");

        // Reservation made but never published.
        ring.header().prod.head.store(2, Ordering::Release);
        ring.endpoints(Role::Producer).get(crashed).unwrap().set_reservation(0, 2);
        ring.endpoints(Role::Producer).get(crashed).unwrap().mark_restore(0);

        assert_eq!(ring.seal_producer(crashed).unwrap(), Some(2));
        assert_eq!(ring.tail(Role::Producer), 2);
        assert_eq!(ring.peek(0), TOMBSTONE);
        assert_eq!(ring.peek(1), TOMBSTONE);
    }

    #[test]
    fn test_seal_waits_for_earlier_reservations() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        let peer = push_endpoint(&ring, Role::Consumer, "Q_1");
        let crashed = push_endpoint(&ring, Role::Consumer, "Q_0");

        ring.enqueue(&[21, 22], None).unwrap();
        let mut out = [0u64; 1];
        assert!(ring.try_dequeue(&mut out, Some(peer)).unwrap());
        assert!(ring.try_dequeue(&mut out, Some(crashed)).unwrap());
        ring.endpoints(Role::Consumer).get(crashed).unwrap().mark_restore(1);

        std::thread::scope(|s| {
            let sealing = s.spawn(|| {
                let mut abandoned = Vec::new();
                let sealed = ring.seal_consumer(crashed, &mut abandoned).unwrap();
                (sealed, abandoned)
            });
            std::thread::sleep(std::time::Duration::from_millis(20));
            assert_eq!(ring.tail(Role::Consumer), 0);
            ring.read_complete(peer).unwrap();
            assert_eq!(sealing.join().unwrap(), (Some(1), vec![22]));
        });
        assert_eq!(ring.tail(Role::Consumer), 2);
    }

    #[test]
    fn test_positions_compare_across_wrap() {
        assert!(ahead_of(5, 3));
        assert!(!ahead_of(3, 5));
        assert!(!ahead_of(7, 7));
        assert!(ahead_of(2, u32::MAX - 1));
        assert!(!ahead_of(u32::MAX - 1, 2));
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }
}
