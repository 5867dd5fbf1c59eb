//! Shared fixtures for channel layer integration tests

#![allow(dead_code)]

use std::path::Path;
use std::thread;
use std::time::Duration;

use shmq::{ChannelManager, Direction, ManagerConfig, ProcessIdentity, Sharding, WaitOutcome};
use tempfile::TempDir;

pub const CAPACITY: u32 = 64;

/// Config rooted in fresh temporary directories, journaling enabled
pub fn test_config(root: &TempDir, journal_mask: u32) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.shm_root = root.path().join("shm");
    config.default_capacity = CAPACITY;
    config.wait_timeout_ms = 50;
    config.renotify_threshold = 4;
    config.journal.enabled = true;
    config.journal.dir = root.path().join("journal");
    config.journal.initial_mask = journal_mask;
    config.pools.data_segments = 512;
    config.pools.command_segments = 64;
    config
}

pub fn manager(config: &ManagerConfig, process: &str, instance: u32) -> ChannelManager {
    ChannelManager::new(config.clone(), ProcessIdentity::new(process, instance)).unwrap()
}

/// `writer` → `reader` pair attached over channel `{writer}_{reader}`
pub fn pair(config: &ManagerConfig, writer: &str, reader: &str) -> (ChannelManager, ChannelManager) {
    let mut producer = manager(config, writer, 0);
    let mut consumer = manager(config, reader, 0);
    producer
        .attach(writer, reader, CAPACITY, Direction::Write, Sharding::None)
        .unwrap();
    consumer
        .attach(writer, reader, CAPACITY, Direction::Read, Sharding::None)
        .unwrap();
    (producer, consumer)
}

/// Wait until data shows up, failing the test after `attempts` timeouts
pub fn wait_for_data(consumer: &mut ChannelManager, attempts: usize) -> usize {
    for _ in 0..attempts {
        if let WaitOutcome::Data { channel } = consumer.wait().unwrap() {
            return channel;
        }
    }
    panic!("no data after {} waits", attempts);
}

/// Read, complete and free one message
pub fn take_one(consumer: &mut ChannelManager) -> Option<Vec<u8>> {
    let message = consumer.read().unwrap().map(<[u8]>::to_vec);
    consumer.read_complete().unwrap();
    consumer.free_read().unwrap();
    message
}

pub fn settle() {
    thread::sleep(Duration::from_millis(20));
}

pub fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}
