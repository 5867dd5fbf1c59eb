//! On-disk journal layout
//!
//! ```text
//! +---------------------------+  offset 0
//! | JournalHeader             |  magic, version, endpoint counts, mask,
//! |                           |  generation, consumer and producer records
//! +---------------------------+  JournalHeader::SIZE
//! | JournalEntry[mask + 1]    |  indexed by position & mask
//! +---------------------------+
//! ```
//!
//! All fields are native-endian and naturally aligned with no padding, so
//! the structs can be viewed in place inside the mapping.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::ring::{ahead_of, Role};
use shmq_config::limits::{ENDPOINT_NAME_LEN, MAX_ENDPOINTS, SEGMENT_CAPACITY};

pub const JOURNAL_MAGIC: [u8; 4] = *b"SQJL";
pub const JOURNAL_VERSION: u32 = 1;

/// Last acknowledged position of one endpoint
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct EndpointRecord {
    pub name: [u8; ENDPOINT_NAME_LEN],
    pub tail: u32,
}

impl EndpointRecord {
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(ENDPOINT_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; ENDPOINT_NAME_LEN];
        let len = name.len().min(ENDPOINT_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct JournalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub consumer_count: u16,
    pub producer_count: u16,
    /// Entries minus one, always a power of two minus one
    pub mask: u32,
    /// Bumped on every grow so mapped readers notice
    pub generation: u32,
    pub reserved: u32,
    pub consumers: [EndpointRecord; MAX_ENDPOINTS],
    pub producers: [EndpointRecord; MAX_ENDPOINTS],
}

impl JournalHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(mask: u32) -> Self {
        let mut header = Self::new_zeroed();
        header.magic = JOURNAL_MAGIC;
        header.version = JOURNAL_VERSION;
        header.mask = mask;
        header
    }

    pub fn is_initialized(&self) -> bool {
        self.magic != [0; 4]
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.magic != JOURNAL_MAGIC {
            return Err(format!("Invalid magic: {:?}", self.magic));
        }
        if self.version != JOURNAL_VERSION {
            return Err(format!("Unsupported version: {}", self.version));
        }
        if !self.mask.wrapping_add(1).is_power_of_two() {
            return Err(format!("Mask {:#x} is not a power of two minus one", self.mask));
        }
        if self.consumer_count as usize > MAX_ENDPOINTS || self.producer_count as usize > MAX_ENDPOINTS {
            return Err(format!(
                "Endpoint counts {}/{} exceed {}",
                self.consumer_count, self.producer_count, MAX_ENDPOINTS
            ));
        }
        Ok(())
    }

    pub fn records(&self, role: Role) -> &[EndpointRecord; MAX_ENDPOINTS] {
        match role {
            Role::Producer => &self.producers,
            Role::Consumer => &self.consumers,
        }
    }

    pub fn records_mut(&mut self, role: Role) -> &mut [EndpointRecord; MAX_ENDPOINTS] {
        match role {
            Role::Producer => &mut self.producers,
            Role::Consumer => &mut self.consumers,
        }
    }

    pub fn count(&self, role: Role) -> usize {
        match role {
            Role::Producer => self.producer_count as usize,
            Role::Consumer => self.consumer_count as usize,
        }
    }

    pub fn set_count(&mut self, role: Role, count: usize) {
        let count = count.min(MAX_ENDPOINTS) as u16;
        match role {
            Role::Producer => self.producer_count = count,
            Role::Consumer => self.consumer_count = count,
        }
    }

    /// Highest recorded tail among the registered endpoints of one side
    pub fn max_tail(&self, role: Role) -> u32 {
        self.records(role)[..self.count(role)]
            .iter()
            .map(|r| r.tail)
            .reduce(|newest, tail| if ahead_of(tail, newest) { tail } else { newest })
            .unwrap_or(0)
    }
}

/// One mirrored message head segment
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct JournalEntry {
    pub len: u32,
    /// Non-zero when the message continued past this segment
    pub has_more: u8,
    pub reserved: [u8; 3],
    pub payload: [u8; SEGMENT_CAPACITY],
}

impl JournalEntry {
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Borrowed view of a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub len: u32,
    pub has_more: bool,
    pub payload: &'a [u8],
}

impl<'a> EntryRef<'a> {
    pub(crate) fn from_entry(entry: &'a JournalEntry) -> Self {
        let len = (entry.len as usize).min(SEGMENT_CAPACITY);
        Self {
            len: entry.len,
            has_more: entry.has_more != 0,
            payload: &entry.payload[..len],
        }
    }
}

/// File size needed for a journal with `mask`
pub fn file_len(mask: u32) -> u64 {
    JournalHeader::SIZE as u64 + (u64::from(mask) + 1) * JournalEntry::SIZE as u64
}

/// Byte offset of the entry at `index` (already masked)
pub fn entry_offset(index: u32) -> usize {
    JournalHeader::SIZE + index as usize * JournalEntry::SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(std::mem::size_of::<EndpointRecord>(), ENDPOINT_NAME_LEN + 4);
        assert_eq!(JournalHeader::SIZE, 24 + 2 * MAX_ENDPOINTS * (ENDPOINT_NAME_LEN + 4));
        assert_eq!(JournalEntry::SIZE, 8 + SEGMENT_CAPACITY);
        assert_eq!(JournalHeader::SIZE % 4, 0);
    }

    #[test]
    fn test_header_validation() {
        let header = JournalHeader::new(0x7FF);
        assert!(header.validate().is_ok());
        assert!(header.is_initialized());

        let mut bad = header;
        bad.mask = 0x800;
        assert!(bad.validate().is_err());
        assert!(!JournalHeader::new_zeroed().is_initialized());
    }

    #[test]
    fn test_max_tail_ignores_unregistered_records() {
        let mut header = JournalHeader::new(15);
        header.consumers[0].tail = 4;
        header.consumers[1].tail = 9;
        header.consumers[2].tail = 100;
        header.set_count(Role::Consumer, 2);
        assert_eq!(header.max_tail(Role::Consumer), 9);
        assert_eq!(header.max_tail(Role::Producer), 0);

        header.consumers[1].tail = u32::MAX;
        header.consumers[0].tail = 2;
        assert_eq!(header.max_tail(Role::Consumer), 2);
    }

    #[test]
    fn test_record_names() {
        let mut record = EndpointRecord::new_zeroed();
        record.set_name("P_0");
        assert_eq!(record.name(), "P_0");
    }
}
