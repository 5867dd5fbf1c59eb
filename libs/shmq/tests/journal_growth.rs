//! Journal growth driven by channel occupancy

mod common;

use common::*;
use shmq::{ChannelAdmin, JournalReader};
use tempfile::tempdir;

fn payload(i: u32) -> Vec<u8> {
    format!("message {:03}", i).into_bytes()
}

#[test_log::test]
fn test_journal_doubles_past_eighty_percent() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, 15);
    let (mut producer, mut consumer) = pair(&config, "P", "Q");

    for i in 0..12 {
        producer.write(&payload(i), 0).unwrap();
    }
    let journal = JournalReader::open(&config.journal.dir, "P_Q").unwrap();
    assert_eq!(journal.mask(), 15);
    assert_eq!(journal.header().generation, 0);
    drop(journal);

    // 13 live messages out of 16 journal entries crosses the ratio.
    producer.write(&payload(12), 0).unwrap();
    let journal = JournalReader::open(&config.journal.dir, "P_Q").unwrap();
    assert_eq!(journal.mask(), 31);
    assert_eq!(journal.header().generation, 1);
    for i in 0..13 {
        assert_eq!(journal.entry(i).unwrap().payload, payload(i).as_slice());
    }
    drop(journal);

    for i in 13..26 {
        producer.write(&payload(i), 0).unwrap();
    }
    let journal = JournalReader::open(&config.journal.dir, "P_Q").unwrap();
    assert_eq!(journal.mask(), 63);
    assert_eq!(journal.header().generation, 2);
    let records = journal.range(Some(0), None).unwrap();
    assert_eq!(records.len(), 26);
    for (position, entry) in &records {
        assert_eq!(entry.payload, payload(*position).as_slice());
    }
    drop(records);
    drop(journal);

    for i in 0..26 {
        assert_eq!(take_one(&mut consumer).unwrap(), payload(i));
    }
    let journal = JournalReader::open(&config.journal.dir, "P_Q").unwrap();
    assert_eq!(journal.default_range(), (26, 26));
}

#[test_log::test]
fn test_consumer_reads_across_growth() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir, 3);
    let (mut producer, mut consumer) = pair(&config, "P", "Q");

    // Keep three messages in flight so every step sits above the ratio.
    for i in 0..3 {
        producer.write(&payload(i), 0).unwrap();
    }
    for i in 3..40 {
        producer.write(&payload(i), 0).unwrap();
        assert_eq!(take_one(&mut consumer).unwrap(), payload(i - 3));
    }

    let admin = ChannelAdmin::new(config.clone());
    let dump = admin.dump_journal("P_Q", None, None).unwrap();
    assert_eq!(dump.mask, 7);
    assert_eq!(dump.generation, 1);
    assert_eq!(dump.consumers, vec![("Q_0".to_string(), 37)]);
    assert_eq!(dump.producers, vec![("P_0".to_string(), 40)]);
    let positions: Vec<u32> = dump.records.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![37, 38, 39]);
    assert_eq!(dump.records[2].payload, payload(39));
}
