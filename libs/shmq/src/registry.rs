//! Endpoint registry and crash recovery
//!
//! Each ring carries a producer table and a consumer table. A process
//! registers as `{process}_{instance}`; re-registering the same name after
//! a restart returns the same slot with the new pid. All table mutation
//! happens under the ring's registry word.
//!
//! Recovery looks at the slot a restarted process inherits. If the side's
//! tail is parked exactly on this endpoint's recorded tail, the previous
//! incarnation most likely died inside a reservation:
//!
//! - peers exist and all of them are past that tail: mark the slot for
//!   restore; the attaching manager seals the abandoned reservation at once;
//! - no peers: rewind the side's head to the recorded tail, dropping the
//!   orphaned reservation so nobody spins on it.
//!
//! Both outcomes may lose messages. They never move a tail backwards.

use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, Result};
use crate::ring::{ahead_of, Role, ShmRing};
use shmq_config::limits::ENDPOINT_NAME_LEN;

/// Registry key for a process instance
pub fn endpoint_name(process: &str, instance: u32) -> String {
    format!("{}_{}", process, instance)
}

/// What recovery did to a freshly registered endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Clean,
    /// Slot marked to seal its abandoned reservation starting at `start`
    Restore { start: u32 },
    /// Side head moved back from `from` to `to`
    Rewind { from: u32, to: u32 },
}

/// Register `process`/`instance` on one side of `ring`
///
/// Returns the existing slot index when the name is already registered.
pub fn register(ring: &ShmRing, role: Role, process: &str, instance: u32, pid: u32) -> Result<usize> {
    if process.is_empty() {
        return Err(ChannelError::invalid_argument("empty process name"));
    }
    let key = endpoint_name(process, instance);
    if key.len() >= ENDPOINT_NAME_LEN {
        return Err(ChannelError::invalid_argument(format!(
            "endpoint name {:?} longer than {} bytes",
            key,
            ENDPOINT_NAME_LEN - 1
        )));
    }

    let guard = ring.lock_registry();
    let table = ring.endpoints(role);

    if let Some(index) = table.iter().position(|slot| slot.name() == key) {
        if let Some(slot) = table.get(index) {
            let previous = slot.pid();
            slot.set_pid(pid, &guard);
            debug!(
                "Re-attached {} as {} {} on {} (pid {} -> {})",
                key,
                role.as_str(),
                index,
                ring.name(),
                previous,
                pid
            );
        }
        return Ok(index);
    }

    let index = table.push(&key, ring.tail(role), &guard).ok_or_else(|| {
        ChannelError::resource_exhausted(
            "endpoint table",
            format!("{} {} table of {} is full", ring.name(), role.as_str(), key),
        )
    })?;
    if let Some(slot) = table.get(index) {
        slot.set_pid(pid, &guard);
    }
    info!("Registered {} as {} {} on {}", key, role.as_str(), index, ring.name());
    Ok(index)
}

/// Repair the ring after a possibly unclean restart of endpoint `index`
pub fn recover(ring: &ShmRing, role: Role, index: usize) -> Result<Recovery> {
    let _guard = ring.lock_registry();
    let table = ring.endpoints(role);
    let me = table.get(index).ok_or_else(|| {
        ChannelError::invalid_argument(format!(
            "{} endpoint {} not registered on {}",
            role.as_str(),
            index,
            ring.name()
        ))
    })?;

    let my_tail = me.tail();
    if ring.tail(role) != my_tail {
        return Ok(Recovery::Clean);
    }

    let others_min = table
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, slot)| slot.tail())
        .reduce(|lowest, tail| if ahead_of(lowest, tail) { tail } else { lowest });

    match others_min {
        Some(min) if ahead_of(min, my_tail) => {
            me.mark_restore(my_tail);
            warn!(
                "{} {} on {} left the ring parked at {} while peers reached {}; restore scheduled",
                role.as_str(),
                me.name(),
                ring.name(),
                my_tail,
                min
            );
            Ok(Recovery::Restore { start: my_tail })
        }
        Some(_) => Ok(Recovery::Clean),
        None => {
            let head = ring.head(role);
            if head == 0 || head == my_tail {
                return Ok(Recovery::Clean);
            }
            let from = ring.rewind_head(role, my_tail);
            me.set_reservation(my_tail, my_tail);
            error!(
                "Rewound {} head of {} from {} to {} for sole endpoint {}; in-flight messages dropped",
                role.as_str(),
                ring.name(),
                from,
                my_tail,
                me.name()
            );
            Ok(Recovery::Rewind { from, to: my_tail })
        }
    }
}

/// Flag consumer `index` as blocked so the next producer wakes it
pub fn set_sleep(ring: &ShmRing, index: usize) -> Result<()> {
    let slot = ring.endpoints(Role::Consumer).get(index).ok_or_else(|| {
        ChannelError::invalid_argument(format!(
            "consumer endpoint {} not registered on {}",
            index,
            ring.name()
        ))
    })?;
    slot.set_sleeping(true);
    Ok(())
}

/// Slot index of `key` on one side, if registered
pub fn find(ring: &ShmRing, role: Role, key: &str) -> Option<usize> {
    ring.endpoints(role).iter().position(|slot| slot.name() == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmq_config::limits::MAX_ENDPOINTS;
    use tempfile::tempdir;

    #[test]
    fn test_register_is_idempotent() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();

        let first = register(&ring, Role::Consumer, "Q", 0, 100).unwrap();
        let second = register(&ring, Role::Consumer, "Q", 0, 200).unwrap();
        assert_eq!(first, second);
        assert_eq!(ring.endpoints(Role::Consumer).len(), 1);
        assert_eq!(ring.endpoints(Role::Consumer).get(first).unwrap().pid(), 200);

        let other = register(&ring, Role::Consumer, "Q", 1, 300).unwrap();
        assert_eq!(other, 1);
        assert_eq!(find(&ring, Role::Consumer, "Q_1"), Some(1));
        assert_eq!(find(&ring, Role::Producer, "Q_1"), None);
    }

    #[test]
    fn test_register_matches_exact_names() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        let a = register(&ring, Role::Producer, "P", 1, 1).unwrap();
        let b = register(&ring, Role::Producer, "P", 10, 1).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_table_full() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        for instance in 0..MAX_ENDPOINTS as u32 {
            register(&ring, Role::Producer, "P", instance, 1).unwrap();
        }
        let err = register(&ring, Role::Producer, "P", 99, 1).unwrap_err();
        assert_eq!(err.category(), "resource_exhausted");
        assert!(register(&ring, Role::Producer, "P", 3, 2).is_ok());
    }

    #[test]
    fn test_sole_consumer_rewinds_head() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        let consumer = register(&ring, Role::Consumer, "Q", 0, 1).unwrap();
        ring.enqueue(&[1, 2, 3], None).unwrap();

        let mut out = [0u64; 2];
        assert!(ring.try_dequeue(&mut out, Some(consumer)).unwrap());
        assert_eq!(ring.head(Role::Consumer), 2);
        assert_eq!(ring.tail(Role::Consumer), 0);

        // Restart without read_complete.
        let index = register(&ring, Role::Consumer, "Q", 0, 2).unwrap();
        assert_eq!(index, consumer);
        let recovery = recover(&ring, Role::Consumer, index).unwrap();
        assert_eq!(recovery, Recovery::Rewind { from: 2, to: 0 });
        assert_eq!(ring.head(Role::Consumer), 0);

        assert!(ring.try_dequeue(&mut out, Some(index)).unwrap());
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn test_parked_tail_with_peers_ahead_schedules_restore() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_MULTI", 8).unwrap();
        let crashed = register(&ring, Role::Consumer, "A", 0, 1).unwrap();
        let peer = register(&ring, Role::Consumer, "B", 0, 1).unwrap();
        ring.enqueue(&[1, 2], None).unwrap();

        let mut out = [0u64; 1];
        assert!(ring.try_dequeue(&mut out, Some(crashed)).unwrap());
        assert!(ring.try_dequeue(&mut out, Some(peer)).unwrap());

        let recovery = recover(&ring, Role::Consumer, crashed).unwrap();
        assert_eq!(recovery, Recovery::Restore { start: 0 });
        let slot = ring.endpoints(Role::Consumer).get(crashed).unwrap();
        assert_eq!(slot.restore_start(), Some(0));

        // The peer is not parked on the tail, so it is left alone.
        assert_eq!(recover(&ring, Role::Consumer, peer).unwrap(), Recovery::Clean);
    }

    #[test]
    fn test_restore_detected_across_position_wrap() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_MULTI", 8).unwrap();
        ring.set_position(u32::MAX);
        let crashed = register(&ring, Role::Consumer, "A", 0, 1).unwrap();
        let peer = register(&ring, Role::Consumer, "B", 0, 1).unwrap();
        ring.enqueue(&[1, 2], None).unwrap();

        let mut out = [0u64; 1];
        assert!(ring.try_dequeue(&mut out, Some(crashed)).unwrap());
        assert!(ring.try_dequeue(&mut out, Some(peer)).unwrap());
        assert_eq!(ring.endpoints(Role::Consumer).get(peer).unwrap().tail(), 0);

        let recovery = recover(&ring, Role::Consumer, crashed).unwrap();
        assert_eq!(recovery, Recovery::Restore { start: u32::MAX });
    }

    #[test]
    fn test_clean_restart_changes_nothing() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        let producer = register(&ring, Role::Producer, "P", 0, 1).unwrap();
        ring.enqueue(&[1], Some(producer)).unwrap();

        assert_eq!(recover(&ring, Role::Producer, producer).unwrap(), Recovery::Clean);
        assert_eq!(ring.head(Role::Producer), 1);
    }

    #[test]
    fn test_set_sleep() {
        let dir = tempdir().unwrap();
        let ring = ShmRing::create(dir.path(), "P_Q", 8).unwrap();
        assert!(set_sleep(&ring, 0).is_err());
        let consumer = register(&ring, Role::Consumer, "Q", 0, 1).unwrap();
        set_sleep(&ring, consumer).unwrap();
        assert!(ring.endpoints(Role::Consumer).get(consumer).unwrap().is_sleeping());
    }
}
