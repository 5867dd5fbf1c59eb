//! Write channel selection and stalled-consumer bookkeeping

/// Chooses one of several equivalent write channels for a message
///
/// Implemented by the embedding application and handed to the manager with
/// [`super::ChannelManager::set_selector`]. Closures of the same shape work
/// directly.
pub trait WriteSelector: Send {
    /// Index in `0..channels` for a message keyed by `key`
    fn select(&self, key: &[u8], channels: usize) -> usize;
}

/// Always the first write channel
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstChannel;

impl WriteSelector for FirstChannel {
    fn select(&self, _key: &[u8], _channels: usize) -> usize {
        0
    }
}

/// CRC32 of the key modulo the channel count
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyHash;

impl WriteSelector for KeyHash {
    fn select(&self, key: &[u8], channels: usize) -> usize {
        if channels == 0 {
            return 0;
        }
        crc32fast::hash(key) as usize % channels
    }
}

impl<F> WriteSelector for F
where
    F: Fn(&[u8], usize) -> usize + Send,
{
    fn select(&self, key: &[u8], channels: usize) -> usize {
        self(key, channels)
    }
}

/// Rolling count of failed enqueues on one write channel
///
/// A full channel whose consumer sleeps most likely missed a wake-up, so
/// every `threshold` failures the writer rings the consumer again before
/// retrying.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter {
    count: u64,
}

impl FailureCounter {
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn record(&mut self) {
        self.count = self.count.wrapping_add(1);
    }

    pub fn renotify_due(&self, threshold: u32) -> bool {
        threshold != 0 && self.count != 0 && self.count % u64::from(threshold) == 0
    }
}
