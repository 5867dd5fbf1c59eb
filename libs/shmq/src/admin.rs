//! Operator surface over channels, pools and journals
//!
//! Everything here acts on the shared files directly, without registering
//! as an endpoint, so it is safe to run against a live system for listing
//! and dumping. Delete, reset and restore change channel contents and are
//! meant for stopped or stuck systems.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, warn};

use crate::codec::{self, ScratchBuffer};
use crate::error::{ChannelError, Result};
use crate::journal::JournalReader;
use crate::pool::{SegmentId, SegmentPool};
use crate::ring::{process_alive, Role, ShmRing, TOMBSTONE};
use shmq_config::limits::names::{COMMAND_CHANNEL, POOL_RING_PREFIX};
use shmq_config::ManagerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Channel,
    /// Free list of a segment pool
    Pool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub pid: u32,
    pub tail: u32,
    pub alive: bool,
    pub sleeping: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub name: String,
    pub kind: ChannelKind,
    pub capacity: u32,
    /// Messages in flight, or segments in use for a pool
    pub used: u32,
    pub usage_percent: f64,
    pub producers: Vec<EndpointStatus>,
    pub consumers: Vec<EndpointStatus>,
}

/// One live message of a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelEntry {
    pub position: u32,
    pub segment: Option<u32>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalRecord {
    pub position: u32,
    pub len: u32,
    pub has_more: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalDump {
    pub path: PathBuf,
    pub mask: u32,
    pub generation: u32,
    pub producers: Vec<(String, u32)>,
    pub consumers: Vec<(String, u32)>,
    pub records: Vec<JournalRecord>,
}

pub struct ChannelAdmin {
    config: ManagerConfig,
}

impl ChannelAdmin {
    pub fn new(config: ManagerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create the data and command pools if they do not exist yet
    pub fn init_pools(&self) -> Result<(SegmentPool, SegmentPool)> {
        let pools = &self.config.pools;
        let data = SegmentPool::open_or_create(&self.config.shm_root, &pools.data, pools.data_segments)?;
        let command =
            SegmentPool::open_or_create(&self.config.shm_root, &pools.command, pools.command_segments)?;
        info!(
            "Pools ready: {} ({} segments), {} ({} segments)",
            data.name(),
            data.capacity(),
            command.name(),
            command.capacity()
        );
        Ok((data, command))
    }

    /// Create an empty channel; an existing one is reported as `AlreadyExists`
    pub fn create_channel(&self, name: &str, capacity: u32) -> Result<ShmRing> {
        let capacity = if capacity == 0 {
            self.config.default_capacity
        } else {
            capacity
        };
        ShmRing::create(&self.config.shm_root, name, capacity)
    }

    /// Drain a channel, free its messages and unlink it
    ///
    /// Returns the capacity the channel had.
    pub fn delete_channel(&self, name: &str) -> Result<u32> {
        let ring = ShmRing::open(&self.config.shm_root, name)?;
        let capacity = ring.capacity();
        let dropped = self.drain(&ring)?;
        drop(ring);
        ShmRing::remove(&self.config.shm_root, name)?;
        info!("Deleted channel {} ({} slots, {} messages dropped)", name, capacity, dropped);
        Ok(capacity)
    }

    /// Drop every queued message of a channel, keeping the channel
    pub fn reset_channel(&self, name: &str) -> Result<usize> {
        let ring = ShmRing::open(&self.config.shm_root, name)?;
        let dropped = self.drain(&ring)?;
        info!("Reset channel {} ({} messages dropped)", name, dropped);
        Ok(dropped)
    }

    /// Copy out the messages between two positions without consuming them
    ///
    /// Defaults to everything published and not yet released.
    pub fn dump_channel(&self, name: &str, start: Option<u32>, end: Option<u32>) -> Result<Vec<ChannelEntry>> {
        let ring = ShmRing::open(&self.config.shm_root, name)?;
        let pool = self.pool_for(name)?;
        let start = start.unwrap_or_else(|| ring.tail(Role::Consumer));
        let end = end.unwrap_or_else(|| ring.tail(Role::Producer));
        let span = end.wrapping_sub(start);
        if span > ring.capacity() {
            return Err(ChannelError::invalid_argument(format!(
                "range {}..{} spans more than the {} slots of {}",
                start,
                end,
                ring.capacity(),
                name
            )));
        }

        let mut scratch = ScratchBuffer::new();
        let mut entries = Vec::with_capacity(span as usize);
        for offset in 0..span {
            let position = start.wrapping_add(offset);
            let segment = SegmentId::from_handle(ring.peek(position));
            let payload = match segment {
                Some(head) => match codec::reassemble(&pool, head, &mut scratch) {
                    Ok(view) => view.to_vec(),
                    Err(e) => {
                        warn!("Position {} of {} unreadable: {}", position, name, e);
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };
            entries.push(ChannelEntry {
                position,
                segment: segment.map(|id| id.index()),
                payload,
            });
        }
        Ok(entries)
    }

    /// Status of every channel and pool under the shm root
    pub fn list_channels(&self) -> Result<Vec<ChannelStatus>> {
        let mut statuses = Vec::new();
        for name in ShmRing::list(&self.config.shm_root)? {
            let ring = match ShmRing::open(&self.config.shm_root, &name) {
                Ok(ring) => ring,
                Err(e) => {
                    warn!("Skipping channel {}: {}", name, e);
                    continue;
                }
            };

            // Only a ring backed by a pool file is a free list; `MP_Q` may
            // just as well be the channel of a writer named `MP`.
            let pool_name = name
                .strip_prefix(POOL_RING_PREFIX)
                .filter(|pool| SegmentPool::path_for(&self.config.shm_root, pool).exists());
            let status = match pool_name {
                Some(pool_name) => {
                    let pool = match SegmentPool::open(&self.config.shm_root, pool_name) {
                        Ok(pool) => pool,
                        Err(e) => {
                            warn!("Skipping pool {}: {}", pool_name, e);
                            continue;
                        }
                    };
                    let used = pool.capacity().saturating_sub(pool.available());
                    ChannelStatus {
                        name: pool_name.to_string(),
                        kind: ChannelKind::Pool,
                        capacity: pool.capacity(),
                        used,
                        usage_percent: percent(used, pool.capacity()),
                        producers: Vec::new(),
                        consumers: Vec::new(),
                    }
                }
                None => ChannelStatus {
                    name: name.clone(),
                    kind: ChannelKind::Channel,
                    capacity: ring.capacity(),
                    used: ring.count(),
                    usage_percent: percent(ring.count(), ring.capacity()),
                    producers: endpoint_statuses(&ring, Role::Producer),
                    consumers: endpoint_statuses(&ring, Role::Consumer),
                },
            };
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Journal header and records between two positions
    ///
    /// Defaults run from the slowest consumer's tail to the furthest
    /// producer's tail.
    pub fn dump_journal(&self, channel: &str, start: Option<u32>, end: Option<u32>) -> Result<JournalDump> {
        let reader = JournalReader::open(&self.config.journal.dir, channel)?;
        let records = reader
            .range(start, end)?
            .into_iter()
            .map(|(position, entry)| JournalRecord {
                position,
                len: entry.len,
                has_more: entry.has_more,
                payload: entry.payload.to_vec(),
            })
            .collect();
        Ok(JournalDump {
            path: reader.path().to_path_buf(),
            mask: reader.mask(),
            generation: reader.header().generation,
            producers: reader.endpoints(Role::Producer),
            consumers: reader.endpoints(Role::Consumer),
            records,
        })
    }

    /// Recreate a channel if needed and replay its unacknowledged backlog
    ///
    /// Only the head segment of each message is journaled, so messages that
    /// spanned several segments come back truncated.
    pub fn restore_from_journal(&self, channel: &str, capacity: u32) -> Result<usize> {
        let reader = JournalReader::open(&self.config.journal.dir, channel)?;
        let capacity = if capacity == 0 {
            self.config.default_capacity
        } else {
            capacity
        };
        let ring = ShmRing::open_or_create(&self.config.shm_root, channel, capacity)?;
        let pool = self.pool_for(channel)?;

        let mut restored = 0;
        for (position, entry) in reader.range(None, None)? {
            if entry.has_more {
                warn!(
                    "Position {} of {} spanned several segments; restoring its first {} bytes",
                    position, channel, entry.len
                );
            }
            let head = codec::split(&pool, entry.payload)?;
            if let Err(e) = ring.enqueue(&[head.handle()], None) {
                pool.free_chain(head);
                return Err(e);
            }
            restored += 1;
        }
        info!("Restored {} messages into {} from {:?}", restored, channel, reader.path());
        Ok(restored)
    }

    /// Pool whose segments travel through `channel`
    fn pool_for(&self, channel: &str) -> Result<SegmentPool> {
        let pools = &self.config.pools;
        let (name, segments) = if channel == COMMAND_CHANNEL {
            (&pools.command, pools.command_segments)
        } else {
            (&pools.data, pools.data_segments)
        };
        SegmentPool::open_or_create(&self.config.shm_root, name, segments)
    }

    fn drain(&self, ring: &ShmRing) -> Result<usize> {
        let pool = self.pool_for(ring.name())?;
        let mut dropped = 0;
        let mut handle = [0u64; 1];
        while ring.try_dequeue(&mut handle, None)? {
            if handle[0] != TOMBSTONE {
                if let Some(head) = SegmentId::from_handle(handle[0]) {
                    pool.free_chain(head);
                }
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

fn percent(used: u32, capacity: u32) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    f64::from(used) * 100.0 / f64::from(capacity)
}

fn endpoint_statuses(ring: &ShmRing, role: Role) -> Vec<EndpointStatus> {
    ring.endpoints(role)
        .iter()
        .map(|slot| EndpointStatus {
            name: slot.name(),
            pid: slot.pid(),
            tail: slot.tail(),
            alive: process_alive(slot.pid()),
            sleeping: slot.is_sleeping(),
        })
        .collect()
}
