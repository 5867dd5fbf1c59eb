//! Ordering and integrity under sustained traffic

mod common;

use std::thread;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shmq::limits::JUMBO_CEILING;
use shmq::{ChannelManager, Result};
use tempfile::tempdir;

const MESSAGES: u64 = 10_000;

fn message(sequence: u64, len: usize) -> Vec<u8> {
    let mut payload = Vec::with_capacity(len);
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.extend((8..len).map(|i| (sequence as usize).wrapping_add(i) as u8));
    payload
}

fn check(expected: u64, payload: &[u8]) {
    let sequence = u64::from_le_bytes(payload[..8].try_into().unwrap());
    assert_eq!(sequence, expected, "out of order");
    assert_eq!(payload, message(sequence, payload.len()).as_slice(), "corrupted {}", sequence);
}

fn write_retrying(producer: &mut ChannelManager, payload: &[u8]) -> Result<()> {
    loop {
        match producer.write(payload, 0) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => thread::yield_now(),
            Err(e) => return Err(e),
        }
    }
}

#[test]
fn test_interleaved_single_thread() {
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir, 1023);
    config.journal.enabled = false;
    let (mut producer, mut consumer) = pair(&config, "P", "Q");
    let mut rng = StdRng::seed_from_u64(7);

    let mut written = 0u64;
    let mut read = 0u64;
    while read < MESSAGES {
        let burst = rng.gen_range(0..8).min(MESSAGES - written);
        for _ in 0..burst {
            let len = rng.gen_range(8..6000);
            match producer.write(&message(written, len), 0) {
                Ok(()) => written += 1,
                Err(e) => {
                    assert!(e.is_retryable(), "{}", e);
                    break;
                }
            }
        }
        for _ in 0..rng.gen_range(0..8) {
            let Some(payload) = consumer.read().unwrap() else {
                break;
            };
            check(read, payload);
            read += 1;
            consumer.read_complete().unwrap();
        }
        consumer.read_complete().unwrap();
        consumer.free_read().unwrap();
    }
    assert_eq!(written, MESSAGES);
    assert_eq!(producer.write_channel(0).unwrap().count(), 0);
    assert_eq!(
        producer.data_pool().available(),
        producer.data_pool().capacity()
    );
}

#[test]
fn test_threads_with_jumbo_messages() {
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir, 1023);
    config.pools.data_segments = 2048;
    let (mut producer, mut consumer) = pair(&config, "P", "Q");

    let reader = thread::spawn(move || {
        let mut read = 0u64;
        while read < MESSAGES {
            match consumer.read().unwrap() {
                Some(payload) => {
                    check(read, payload);
                    read += 1;
                }
                None => {
                    consumer.wait().unwrap();
                    continue;
                }
            }
            consumer.read_complete().unwrap();
            consumer.free_read().unwrap();
        }
        read
    });

    let mut rng = StdRng::seed_from_u64(11);
    for sequence in 0..MESSAGES {
        let len = if sequence % 997 == 0 {
            JUMBO_CEILING
        } else {
            rng.gen_range(8..8000)
        };
        write_retrying(&mut producer, &message(sequence, len)).unwrap();
    }

    assert_eq!(reader.join().unwrap(), MESSAGES);
    assert_eq!(producer.write_channel(0).unwrap().count(), 0);
    assert_eq!(
        producer.data_pool().available(),
        producer.data_pool().capacity()
    );
}
