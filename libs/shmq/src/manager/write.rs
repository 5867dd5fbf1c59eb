//! Write path: single writes, hashed writes and staged bulk commits

use tracing::{debug, trace, warn};

use super::ChannelManager;
use crate::codec;
use crate::error::{ChannelError, Result};
use crate::pool::SegmentId;
use crate::ring::Role;
use shmq_config::limits::MAX_BULK_WRITE;

impl ChannelManager {
    /// Write one message to write channel `index`
    ///
    /// On failure nothing stays allocated. A full channel or an exhausted
    /// segment pool bumps that channel's failure counter.
    pub fn write(&mut self, payload: &[u8], index: usize) -> Result<()> {
        self.check_write_index(index)?;
        let head = match codec::split(&self.data_pool, payload) {
            Ok(head) => head,
            Err(e) => {
                if matches!(e, ChannelError::ResourceExhausted { .. }) {
                    self.writers[index].failures.record();
                }
                return Err(e);
            }
        };
        if let Err(e) = self.publish(index, &[head]) {
            self.data_pool.free_chain(head);
            return Err(e);
        }
        Ok(())
    }

    /// Write one message to the channel the selector picks for `key`
    pub fn write_hashed(&mut self, payload: &[u8], key: &[u8]) -> Result<()> {
        let index = self.selector.select(key, self.writers.len());
        self.write(payload, index)
    }

    /// Stage a message for the next [`Self::commit`]
    pub fn insert(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_stage_room()?;
        let head = codec::split(&self.data_pool, payload)?;
        self.staged.push(head);
        Ok(())
    }

    /// Stage the message currently being read, without copying it
    ///
    /// The chain now belongs to the staged batch; freeing the read skips it.
    pub fn forward_current(&mut self) -> Result<()> {
        self.ensure_stage_room()?;
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| ChannelError::invalid_argument("no message is being read"))?;
        let position = pending
            .cursor
            .checked_sub(1)
            .ok_or_else(|| ChannelError::invalid_argument("bulk read has no current message"))?;
        let head = pending
            .heads
            .get_mut(position)
            .and_then(Option::take)
            .ok_or_else(|| {
                ChannelError::invalid_argument("current message was already freed or forwarded")
            })?;
        self.staged.push(head);
        Ok(())
    }

    /// Enqueue every staged message on write channel `index` at once
    ///
    /// On failure the staged messages are kept for another attempt.
    pub fn commit(&mut self, index: usize) -> Result<usize> {
        self.check_write_index(index)?;
        if self.staged.is_empty() {
            return Ok(0);
        }
        let staged = std::mem::take(&mut self.staged);
        match self.publish(index, &staged) {
            Ok(()) => Ok(staged.len()),
            Err(e) => {
                self.staged = staged;
                Err(e)
            }
        }
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Drop every staged message, returning the segments freed
    pub fn discard_staged(&mut self) -> usize {
        let staged = std::mem::take(&mut self.staged);
        codec::free_messages(&self.data_pool, &staged)
    }

    fn ensure_stage_room(&self) -> Result<()> {
        if self.staged.len() >= MAX_BULK_WRITE {
            return Err(ChannelError::resource_exhausted(
                "bulk write",
                format!("{} messages already staged", self.staged.len()),
            ));
        }
        Ok(())
    }

    fn check_write_index(&self, index: usize) -> Result<()> {
        if index >= self.writers.len() {
            return Err(ChannelError::invalid_argument(format!(
                "write channel {} out of range 0..{}",
                index,
                self.writers.len()
            )));
        }
        Ok(())
    }

    /// Enqueue ready chains, mirror them and wake a consumer
    fn publish(&mut self, index: usize, heads: &[SegmentId]) -> Result<()> {
        let threshold = self.config.renotify_threshold;
        let channel = self.writers.get_mut(index).ok_or_else(|| {
            ChannelError::invalid_argument(format!("write channel {} out of range", index))
        })?;

        if channel.failures.renotify_due(threshold) {
            let woken = self.notifier.notify(&channel.ring);
            debug!(
                "{} failed writes on {}, re-woke consumer {:?}",
                channel.failures.count(),
                channel.ring.name(),
                woken
            );
        }

        let handles: Vec<u64> = heads.iter().map(SegmentId::handle).collect();
        if let Err(e) = channel.ring.enqueue(&handles, Some(channel.endpoint)) {
            channel.failures.record();
            return Err(e);
        }

        let tail = channel.endpoint_tail(Role::Producer);
        let live = channel.ring.count();
        if let Some(journal) = channel.journal.as_mut() {
            if let Err(e) = journal.append(&self.data_pool, heads, tail, live) {
                warn!("Journal append on {} failed: {}", channel.ring.name(), e);
            }
        }

        self.notifier.notify(&channel.ring);
        trace!("Wrote {} messages to {}", heads.len(), channel.ring.name());
        Ok(())
    }
}
