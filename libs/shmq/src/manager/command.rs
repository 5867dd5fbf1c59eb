//! Command channels
//!
//! Every receiver owns an inbox named `{process}_{instance}`; senders put
//! requests there and ring the receiver. Results go back through the shared
//! `COMMAND_RING`, whose first consumer is the sender waiting for them.
//! Commands use their own segment pool and are never journaled.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::{debug, info};

use super::{command_inbox, ChannelManager};
use crate::codec::{self, ScratchBuffer};
use crate::error::{ChannelError, Result};
use crate::pool::{SegmentId, SegmentPool};
use crate::registry;
use crate::ring::{Role, ShmRing};
use shmq_config::limits::names::COMMAND_CHANNEL;

/// Slots of command rings
const COMMAND_CAPACITY: u32 = 1024;

/// Part a process plays on the command channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandRole {
    /// Owns an inbox and answers through the shared result channel
    Receiver,
    /// Sends requests and collects results from the shared result channel
    Sender,
    /// Sends requests only, for operator tools
    Util,
}

pub(super) struct CommandChannels {
    role: CommandRole,
    inbox: Option<ShmRing>,
    results: Option<ShmRing>,
    outboxes: HashMap<String, ShmRing>,
    pending: Option<SegmentId>,
    scratch: ScratchBuffer,
}

impl CommandChannels {
    fn new(role: CommandRole) -> Self {
        Self {
            role,
            inbox: None,
            results: None,
            outboxes: HashMap::new(),
            pending: None,
            scratch: ScratchBuffer::new(),
        }
    }

    pub(super) fn inbox_readable(&self) -> bool {
        self.inbox.as_ref().is_some_and(|ring| ring.readable() > 0)
    }

    pub(super) fn release(&mut self, pool: &SegmentPool) {
        if let Some(head) = self.pending.take() {
            pool.free_chain(head);
        }
    }
}

impl ChannelManager {
    pub(super) fn init_command(&mut self, role: CommandRole) -> Result<()> {
        let root = &self.config.shm_root;
        let mut channels = CommandChannels::new(role);

        match role {
            CommandRole::Util => {}
            CommandRole::Sender => {
                let ring = ShmRing::open_or_create(root, COMMAND_CHANNEL, COMMAND_CAPACITY)?;
                registry::register(
                    &ring,
                    Role::Consumer,
                    &self.identity.process,
                    self.identity.instance,
                    self.identity.pid,
                )?;
                channels.inbox = Some(ring);
            }
            CommandRole::Receiver => {
                channels.results = Some(ShmRing::open_or_create(
                    root,
                    COMMAND_CHANNEL,
                    COMMAND_CAPACITY,
                )?);
                let name = command_inbox(&self.identity.process, self.identity.instance);
                let ring = ShmRing::open_or_create(root, &name, COMMAND_CAPACITY)?;
                registry::register(
                    &ring,
                    Role::Consumer,
                    &self.identity.process,
                    self.identity.instance,
                    self.identity.pid,
                )?;
                channels.inbox = Some(ring);
            }
        }

        if let Some(previous) = self.command.as_mut() {
            previous.release(&self.command_pool);
        }
        self.command = Some(channels);
        info!(
            "Command channels of {} ready as {:?}",
            self.identity.endpoint_name(),
            role
        );
        Ok(())
    }

    /// Send a request to the inbox of `process`/`instance`
    pub fn send_command(&mut self, process: &str, instance: u32, payload: &[u8]) -> Result<()> {
        let root = &self.config.shm_root;
        let commands = self
            .command
            .get_or_insert_with(|| CommandChannels::new(CommandRole::Util));
        let ring = match commands.outboxes.entry(command_inbox(process, instance)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let ring = ShmRing::open(root, entry.key())?;
                entry.insert(ring)
            }
        };

        let head = codec::split(&self.command_pool, payload)?;
        if let Err(e) = ring.enqueue(&[head.handle()], None) {
            self.command_pool.free_chain(head);
            return Err(e);
        }
        debug!("Sent {} byte command to {}", payload.len(), ring.name());
        self.notifier.notify_control(ring)
    }

    /// Take the next message from this process's inbox
    ///
    /// The previous command's segments are returned first, so its view must
    /// no longer be in use (the borrow checker enforces this).
    pub fn receive_command(&mut self) -> Result<Option<&[u8]>> {
        let commands = self
            .command
            .as_mut()
            .ok_or_else(|| ChannelError::invalid_argument("command channels not initialized"))?;
        if let Some(previous) = commands.pending.take() {
            self.command_pool.free_chain(previous);
        }
        let ring = commands.inbox.as_ref().ok_or_else(|| {
            ChannelError::invalid_argument(format!("{:?} has no command inbox", commands.role))
        })?;

        let head = loop {
            let mut handle = [0u64; 1];
            if !ring.try_dequeue(&mut handle, None)? {
                return Ok(None);
            }
            if let Some(head) = SegmentId::from_handle(handle[0]) {
                break head;
            }
        };
        commands.pending = Some(head);

        match codec::reassemble(&self.command_pool, head, &mut commands.scratch) {
            Ok(view) => Ok(Some(view)),
            Err(e) => {
                self.command_pool.free_chain(head);
                commands.pending = None;
                Err(e)
            }
        }
    }

    /// Answer the last command through the shared result channel
    pub fn send_command_result(&mut self, payload: &[u8]) -> Result<()> {
        let commands = self
            .command
            .as_ref()
            .ok_or_else(|| ChannelError::invalid_argument("command channels not initialized"))?;
        let ring = commands.results.as_ref().ok_or_else(|| {
            ChannelError::invalid_argument(format!("{:?} has no result channel", commands.role))
        })?;

        let head = codec::split(&self.command_pool, payload)?;
        if let Err(e) = ring.enqueue(&[head.handle()], None) {
            self.command_pool.free_chain(head);
            return Err(e);
        }
        self.notifier.notify_control(ring)
    }
}
