//! Read path: single and bulk reads on the current read channel

use tracing::{error, trace, warn};

use super::{ChannelManager, PendingRead};
use crate::codec;
use crate::error::{ChannelError, Result};
use crate::pool::SegmentId;
use crate::ring::Role;
use shmq_config::limits::MAX_BULK_READ;

impl ChannelManager {
    /// Dequeue and reassemble the next message of the current read channel
    ///
    /// `Ok(None)` when the channel is empty. The returned view stays valid
    /// until the next read; the slot is held until [`Self::read_complete`]
    /// and the segments until [`Self::free_read`].
    pub fn read(&mut self) -> Result<Option<&[u8]>> {
        let index = self.begin_read()?;

        let head = loop {
            let channel = &self.readers[index];
            let mut handle = [0u64; 1];
            if !channel.ring.try_dequeue(&mut handle, Some(channel.endpoint))? {
                return Ok(None);
            }
            match SegmentId::from_handle(handle[0]) {
                Some(head) => break head,
                None => {
                    trace!("Skipping sealed slot on {}", channel.ring.name());
                    channel.ring.read_complete(channel.endpoint)?;
                }
            }
        };
        self.pending = Some(PendingRead {
            channel: index,
            heads: vec![Some(head)],
            cursor: 1,
            completed: false,
        });

        match codec::reassemble(&self.data_pool, head, &mut self.scratch) {
            Ok(view) => Ok(Some(view)),
            Err(e) => {
                let channel = &self.readers[index];
                error!(
                    "Dropping unreadable message at segment {} on {}: {}",
                    head.index(),
                    channel.ring.name(),
                    e
                );
                self.data_pool.free_chain(head);
                self.pending = None;
                channel.ring.read_complete(channel.endpoint)?;
                Err(e)
            }
        }
    }

    /// Release the ring slots of the last read and record the new tail
    pub fn read_complete(&mut self) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if pending.completed {
            return Ok(());
        }
        let channel = &mut self.readers[pending.channel];
        channel.ring.read_complete(channel.endpoint)?;
        pending.completed = true;

        let tail = channel.endpoint_tail(Role::Consumer);
        if let Some(journal) = channel.journal.as_mut() {
            if let Err(e) = journal.mark_read(tail) {
                warn!("Journal mark_read on {} failed: {}", channel.ring.name(), e);
            }
        }
        Ok(())
    }

    /// Return the segments of the last read to the pool
    pub fn free_read(&mut self) -> Result<()> {
        let Some(pending) = self.pending.as_ref() else {
            return Ok(());
        };
        if !pending.completed {
            return Err(ChannelError::invalid_argument(
                "read must be completed before its segments are freed",
            ));
        }
        let freed: usize = pending
            .heads
            .iter()
            .flatten()
            .map(|head| codec::free_message(&self.data_pool, *head))
            .sum();
        self.pending = None;
        trace!("Freed {} segments of the last read", freed);
        Ok(())
    }

    /// Dequeue up to `max` messages at once
    ///
    /// Returns how many messages are ready for [`Self::next_message`].
    pub fn read_bulk(&mut self, max: usize) -> Result<usize> {
        if max == 0 || max > MAX_BULK_READ {
            return Err(ChannelError::invalid_argument(format!(
                "bulk read of {} outside 1..={}",
                max, MAX_BULK_READ
            )));
        }
        let index = self.begin_read()?;
        let channel = &self.readers[index];

        let mut handles = [0u64; MAX_BULK_READ];
        let taken = loop {
            let available = (channel.ring.readable() as usize).min(max);
            if available == 0 {
                return Ok(0);
            }
            if channel
                .ring
                .try_dequeue(&mut handles[..available], Some(channel.endpoint))?
            {
                break available;
            }
        };

        let heads: Vec<Option<SegmentId>> = handles[..taken]
            .iter()
            .map(|handle| SegmentId::from_handle(*handle))
            .collect();
        let messages = heads.iter().flatten().count();
        if messages == 0 {
            channel.ring.read_complete(channel.endpoint)?;
            return Ok(0);
        }

        self.pending = Some(PendingRead {
            channel: index,
            heads,
            cursor: 0,
            completed: false,
        });
        trace!("Bulk read {} messages from {}", messages, self.readers[index].ring.name());
        Ok(messages)
    }

    /// Next message of the current bulk read, `None` once exhausted
    pub fn next_message(&mut self) -> Option<Result<&[u8]>> {
        let pending = self.pending.as_mut()?;
        while pending.cursor < pending.heads.len() {
            let position = pending.cursor;
            pending.cursor += 1;
            let Some(head) = pending.heads[position] else {
                continue;
            };
            return Some(match codec::reassemble(&self.data_pool, head, &mut self.scratch) {
                Ok(view) => Ok(view),
                Err(e) => {
                    error!("Dropping unreadable message at segment {}: {}", head.index(), e);
                    self.data_pool.free_chain(head);
                    pending.heads[position] = None;
                    Err(e)
                }
            });
        }
        None
    }

    pub fn read_complete_bulk(&mut self) -> Result<()> {
        self.read_complete()
    }

    pub fn free_read_bulk(&mut self) -> Result<()> {
        self.free_read()
    }

    /// Check no read is outstanding and free a completed one
    fn begin_read(&mut self) -> Result<usize> {
        if let Some(pending) = &self.pending {
            if !pending.completed {
                return Err(ChannelError::invalid_argument(format!(
                    "previous read on {} is not completed",
                    self.readers[pending.channel].ring.name()
                )));
            }
        }
        self.free_read()?;

        self.current_read
            .ok_or_else(|| ChannelError::invalid_argument("no read channel attached"))
    }
}
