//! Channel Manager
//!
//! ## Purpose
//!
//! Owns everything one process instance needs to take part in the channel
//! layer: its identity, the segment pools, its doorbell, and the read and
//! write channels it attached to, with their registry slots and journals.
//!
//! ## Attach
//!
//! ```text
//! attach(writer, reader, direction, sharding)
//!   → channel_name()            "P_Q" | "MULTI_Q" | "P_MULTI"
//!   → ShmRing::open_or_create   creation races count as success
//!   → registry::register        same name, same slot
//!   → registry::recover         rewind, or seal an abandoned reservation
//!   → Journal::open             only when journaling is enabled
//! ```
//!
//! ## Data Path
//!
//! Writes split the payload into a segment chain, enqueue its head on the
//! selected write channel, mirror it into the journal and wake one sleeping
//! consumer. Reads wait on the doorbell, dequeue one head, and reassemble it;
//! [`ChannelManager::read_complete`] releases the ring slot and
//! [`ChannelManager::free_read`] returns the segments.

mod command;
mod dispatch;
mod naming;
mod read;
mod write;

pub use command::CommandRole;
pub use dispatch::{FailureCounter, FirstChannel, KeyHash, WriteSelector};
pub use naming::{channel_name, command_inbox};

use std::path::Path;

use tracing::{debug, info, warn};

use crate::codec::ScratchBuffer;
use crate::error::{ChannelError, Result};
use crate::journal::{Journal, JournalOptions};
use crate::notify::{Doorbell, Notifier, WakeKind};
use crate::pool::{SegmentId, SegmentPool};
use crate::registry::{self, Recovery};
use crate::ring::{Role, ShmRing};
use command::CommandChannels;
use shmq_config::{ManagerConfig, ProcessKey, Sharding, TopologySource};

/// Who this manager speaks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub process: String,
    pub instance: u32,
    pub pid: u32,
    pub package: String,
    pub node_type: String,
}

impl ProcessIdentity {
    pub fn new(process: impl Into<String>, instance: u32) -> Self {
        Self {
            process: process.into(),
            instance,
            pid: std::process::id(),
            package: String::new(),
            node_type: String::new(),
        }
    }

    pub fn with_node(mut self, package: impl Into<String>, node_type: impl Into<String>) -> Self {
        self.package = package.into();
        self.node_type = node_type.into();
        self
    }

    /// Registry and doorbell name, `{process}_{instance}`
    pub fn endpoint_name(&self) -> String {
        registry::endpoint_name(&self.process, self.instance)
    }

    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(&self.package, &self.node_type, &self.process)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn role(&self) -> Role {
        match self {
            Direction::Read => Role::Consumer,
            Direction::Write => Role::Producer,
        }
    }
}

/// Result of [`ChannelManager::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Data is pending on read channel `channel`, now the current one
    Data { channel: usize },
    /// A command is pending on this process's inbox
    Command,
    TimedOut,
}

/// A channel attached in one direction
struct Attached {
    ring: ShmRing,
    endpoint: usize,
    peer: String,
    journal: Option<Journal>,
    failures: FailureCounter,
}

impl Attached {
    /// Position this endpoint last acknowledged
    fn endpoint_tail(&self, role: Role) -> u32 {
        self.ring
            .endpoints(role)
            .get(self.endpoint)
            .map_or(0, |slot| slot.tail())
    }

}

/// Messages dequeued by the last read and not yet freed
struct PendingRead {
    channel: usize,
    /// `None` for tombstones, already-freed and forwarded messages
    heads: Vec<Option<SegmentId>>,
    cursor: usize,
    completed: bool,
}

pub struct ChannelManager {
    config: ManagerConfig,
    identity: ProcessIdentity,
    data_pool: SegmentPool,
    command_pool: SegmentPool,
    doorbell: Doorbell,
    notifier: Notifier,
    writers: Vec<Attached>,
    readers: Vec<Attached>,
    selector: Box<dyn WriteSelector>,
    current_read: Option<usize>,
    pending: Option<PendingRead>,
    scratch: ScratchBuffer,
    staged: Vec<SegmentId>,
    command: Option<CommandChannels>,
}

impl ChannelManager {
    /// Open the pools and bind this process's doorbell
    ///
    /// No channel is attached yet; see [`Self::initialize`] and
    /// [`Self::attach`].
    pub fn new(config: ManagerConfig, identity: ProcessIdentity) -> Result<Self> {
        config.validate()?;
        if identity.process.is_empty() {
            return Err(ChannelError::invalid_argument("empty process name"));
        }
        let root = config.shm_root.clone();
        let data_pool =
            SegmentPool::open_or_create(&root, &config.pools.data, config.pools.data_segments)?;
        let command_pool = SegmentPool::open_or_create(
            &root,
            &config.pools.command,
            config.pools.command_segments,
        )?;
        let doorbell = Doorbell::bind(&root, &identity.endpoint_name())?;
        let notifier = Notifier::new(&root)?;

        info!(
            "Channel manager for {} (pid {}) ready under {:?}",
            identity.endpoint_name(),
            identity.pid,
            root
        );
        Ok(Self {
            config,
            identity,
            data_pool,
            command_pool,
            doorbell,
            notifier,
            writers: Vec::new(),
            readers: Vec::new(),
            selector: Box::new(FirstChannel),
            current_read: None,
            pending: None,
            scratch: ScratchBuffer::new(),
            staged: Vec::new(),
            command: None,
        })
    }

    /// Attach every route of this process, then its command channels
    ///
    /// A route whose reader is this process is attached for reading, one
    /// whose writer is this process for writing. Bidirectional routes are
    /// attached a second time with the roles swapped.
    pub fn initialize(&mut self, topology: &dyn TopologySource, role: CommandRole) -> Result<()> {
        let key = self.identity.key();
        let routes = topology.routes(&key)?;
        let me = self.identity.process.clone();

        for route in &routes {
            if route.reader == me {
                self.attach(&route.writer, &route.reader, route.capacity, Direction::Read, route.sharding)?;
            }
            if route.writer == me {
                self.attach(&route.writer, &route.reader, route.capacity, Direction::Write, route.sharding)?;
            }
            if route.bidirectional {
                if route.reader == me {
                    self.attach(&route.reader, &route.writer, route.capacity, Direction::Write, route.sharding)?;
                }
                if route.writer == me {
                    self.attach(&route.reader, &route.writer, route.capacity, Direction::Read, route.sharding)?;
                }
            }
        }
        info!(
            "{} attached {} write and {} read channels from {} routes",
            self.identity.endpoint_name(),
            self.writers.len(),
            self.readers.len(),
            routes.len()
        );

        self.init_command(role)
    }

    /// Attach one channel, returning its index among the channels of `direction`
    pub fn attach(
        &mut self,
        writer: &str,
        reader: &str,
        capacity: u32,
        direction: Direction,
        sharding: Sharding,
    ) -> Result<usize> {
        if writer.is_empty() || reader.is_empty() {
            return Err(ChannelError::invalid_argument("empty writer or reader name"));
        }
        let name = channel_name(writer, reader, sharding);
        let existing = match direction {
            Direction::Read => &self.readers,
            Direction::Write => &self.writers,
        };
        if let Some(index) = existing.iter().position(|c| c.ring.name() == name) {
            debug!("{} already attached for {:?}", name, direction);
            return Ok(index);
        }

        let capacity = self.effective_capacity(capacity, &name);
        let ring = ShmRing::open_or_create(&self.config.shm_root, &name, capacity)?;
        let role = direction.role();
        let endpoint = registry::register(
            &ring,
            role,
            &self.identity.process,
            self.identity.instance,
            self.identity.pid,
        )?;
        match registry::recover(&ring, role, endpoint)? {
            Recovery::Clean => {}
            Recovery::Restore { start } => self.seal_abandoned(&ring, role, endpoint, start)?,
            Recovery::Rewind { from, to } => {
                info!("{} head rewound {} -> {} during attach", name, from, to)
            }
        }

        let journal = if self.config.journal.enabled {
            let options = JournalOptions {
                initial_mask: self.config.journal.initial_mask,
                sync: self.config.journal.sync,
            };
            Some(Journal::open(
                &self.config.journal.dir,
                &name,
                role,
                endpoint,
                &self.identity.endpoint_name(),
                options,
            )?)
        } else {
            None
        };

        let peer = match direction {
            Direction::Read => writer,
            Direction::Write => reader,
        };
        let attached = Attached {
            ring,
            endpoint,
            peer: peer.to_string(),
            journal,
            failures: FailureCounter::default(),
        };

        let index = match direction {
            Direction::Read => {
                registry::set_sleep(&attached.ring, endpoint)?;
                self.readers.push(attached);
                if self.current_read.is_none() {
                    self.current_read = Some(self.readers.len() - 1);
                }
                self.readers.len() - 1
            }
            Direction::Write => {
                self.writers.push(attached);
                self.writers.len() - 1
            }
        };
        info!(
            "Attached {} as {} {} (slot {})",
            name,
            role.as_str(),
            index,
            endpoint
        );
        Ok(index)
    }

    /// Block until data or a command arrives, or the wait timeout passes
    ///
    /// Marks this process asleep on every read channel first, so a producer
    /// racing with the wait still finds someone to wake.
    pub fn wait(&mut self) -> Result<WaitOutcome> {
        for channel in &self.readers {
            registry::set_sleep(&channel.ring, channel.endpoint)?;
        }

        let ready = self
            .readers
            .iter()
            .position(|channel| channel.ring.readable() > 0);
        if let Some(index) = ready {
            self.wake_all();
            self.current_read = Some(index);
            return Ok(WaitOutcome::Data { channel: index });
        }
        if self.command.as_ref().is_some_and(|c| c.inbox_readable()) {
            self.wake_all();
            return Ok(WaitOutcome::Command);
        }

        let Some(message) = self.doorbell.wait(self.config.wait_timeout())? else {
            return Ok(WaitOutcome::TimedOut);
        };
        match message.kind {
            WakeKind::Command => Ok(WaitOutcome::Command),
            WakeKind::Data => {
                match self.readers.iter().position(|c| c.ring.name() == message.channel) {
                    Some(index) => {
                        self.current_read = Some(index);
                        Ok(WaitOutcome::Data { channel: index })
                    }
                    None => {
                        warn!(
                            "{} woken for channel {} it is not reading",
                            self.identity.endpoint_name(),
                            message.channel
                        );
                        Ok(WaitOutcome::TimedOut)
                    }
                }
            }
        }
    }

    /// Make read channel `index` the one [`Self::read`] drains
    pub fn set_read_channel(&mut self, index: usize) -> Result<()> {
        if index >= self.readers.len() {
            return Err(ChannelError::invalid_argument(format!(
                "read channel {} out of range 0..{}",
                index,
                self.readers.len()
            )));
        }
        self.current_read = Some(index);
        Ok(())
    }

    /// Replace the selector used by [`Self::write_hashed`]
    pub fn set_selector(&mut self, selector: impl WriteSelector + 'static) {
        self.selector = Box::new(selector);
    }

    /// Index of the write channel whose reader is `peer`
    pub fn write_channel_index(&self, peer: &str) -> Option<usize> {
        self.writers.iter().position(|c| c.peer == peer)
    }

    /// Index of the read channel whose writer is `peer`
    pub fn read_channel_index(&self, peer: &str) -> Option<usize> {
        self.readers.iter().position(|c| c.peer == peer)
    }

    pub fn write_channel_count(&self) -> usize {
        self.writers.len()
    }

    pub fn read_channel_count(&self) -> usize {
        self.readers.len()
    }

    pub fn write_channel(&self, index: usize) -> Option<&ShmRing> {
        self.writers.get(index).map(|c| &c.ring)
    }

    pub fn read_channel(&self, index: usize) -> Option<&ShmRing> {
        self.readers.get(index).map(|c| &c.ring)
    }

    /// Failed enqueues recorded on write channel `index`
    pub fn write_failures(&self, index: usize) -> Option<u64> {
        self.writers.get(index).map(|c| c.failures.count())
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn shm_root(&self) -> &Path {
        &self.config.shm_root
    }

    pub fn data_pool(&self) -> &SegmentPool {
        &self.data_pool
    }

    fn effective_capacity(&self, requested: u32, name: &str) -> u32 {
        if requested != 0 && requested.is_power_of_two() {
            return requested;
        }
        if requested != 0 {
            warn!(
                "Capacity {} for {} is not a power of two, using {:#x}",
                requested, name, self.config.default_capacity
            );
        }
        self.config.default_capacity
    }

    /// Release the reservation a crashed predecessor of `endpoint` left at `start`
    ///
    /// Peers publish in order, so they cannot make progress past `start`
    /// until this is done. Abandoned reads are freed; abandoned writes are
    /// tombstoned.
    fn seal_abandoned(&self, ring: &ShmRing, role: Role, endpoint: usize, start: u32) -> Result<()> {
        match role {
            Role::Consumer => {
                let mut abandoned = Vec::new();
                if let Some(sealed) = ring.seal_consumer(endpoint, &mut abandoned)? {
                    let freed: usize = abandoned
                        .iter()
                        .filter_map(|handle| SegmentId::from_handle(*handle))
                        .map(|head| self.data_pool.free_chain(head))
                        .sum();
                    warn!(
                        "Sealed {} abandoned reads from {} on {}, returned {} segments; those messages are lost",
                        sealed,
                        start,
                        ring.name(),
                        freed
                    );
                }
            }
            Role::Producer => {
                if let Some(sealed) = ring.seal_producer(endpoint)? {
                    warn!(
                        "Sealed {} abandoned write slots from {} on {}",
                        sealed,
                        start,
                        ring.name()
                    );
                }
            }
        }
        Ok(())
    }

    /// Clear this process's sleep flags after finding work without sleeping
    fn wake_all(&self) {
        for channel in &self.readers {
            if let Some(slot) = channel.ring.endpoints(Role::Consumer).get(channel.endpoint) {
                slot.set_sleeping(false);
            }
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        let incomplete = self.pending.as_ref().is_some_and(|p| !p.completed);
        if incomplete {
            if let Err(e) = self.read_complete() {
                warn!("Failed to complete pending read on shutdown: {}", e);
            }
        }
        if let Err(e) = self.free_read() {
            warn!("Failed to free pending read on shutdown: {}", e);
        }
        self.discard_staged();
        if let Some(command) = self.command.as_mut() {
            command.release(&self.command_pool);
        }
        for channel in self.writers.iter_mut().chain(self.readers.iter_mut()) {
            if let Some(journal) = channel.journal.as_mut() {
                if let Err(e) = journal.close() {
                    warn!("Failed to close journal of {}: {}", channel.ring.name(), e);
                }
            }
        }
        debug!("Channel manager for {} shut down", self.identity.endpoint_name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::TOMBSTONE;
    use std::thread;
    use tempfile::tempdir;

    fn config(dir: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::default();
        config.shm_root = dir.join("shm");
        config.default_capacity = 8;
        config.journal.enabled = false;
        config.pools.data_segments = 16;
        config.pools.command_segments = 16;
        config
    }

    #[test]
    fn test_attach_seals_abandoned_write_of_crashed_producer() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let ring = ShmRing::create(&config.shm_root, "P_Q", 8).unwrap();
        let crashed = registry::register(&ring, Role::Producer, "P", 0, 1).unwrap();
        let peer = registry::register(&ring, Role::Producer, "P", 1, 1).unwrap();

        // P_0 died holding position 0; P_1 then reserves position 1 and
        // cannot publish past it.
        ring.rewind_head(Role::Producer, 1);
        ring.endpoints(Role::Producer)
            .get(crashed)
            .unwrap()
            .set_reservation(0, 1);

        thread::scope(|s| {
            let writer = s.spawn(|| ring.enqueue(&[7], Some(peer)));
            while ring.head(Role::Producer) != 2 {
                thread::yield_now();
            }
            assert_eq!(ring.tail(Role::Producer), 0);

            let mut restarted =
                ChannelManager::new(config.clone(), ProcessIdentity::new("P", 0)).unwrap();
            restarted
                .attach("P", "Q", 8, Direction::Write, Sharding::None)
                .unwrap();
            writer.join().unwrap().unwrap();
        });

        assert_eq!(ring.tail(Role::Producer), 2);
        assert_eq!(ring.peek(0), TOMBSTONE);
        assert_eq!(ring.peek(1), 7);
        let slot = ring.endpoints(Role::Producer).get(crashed).unwrap();
        assert_eq!(slot.restore_start(), None);
        assert_eq!(slot.tail(), 1);
    }
}
