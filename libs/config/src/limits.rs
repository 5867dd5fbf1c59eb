//! Channel layer limits and well-known names
//!
//! Sizes in this module are part of the shared-memory and journal file
//! layouts. Changing any of them breaks compatibility with files created by
//! an older build.

/// Payload bytes carried by one buffer segment
pub const SEGMENT_CAPACITY: usize = 2560;

/// Largest payload the codec will split or reassemble (1 MiB)
pub const JUMBO_CEILING: usize = 1024 * 1024;

/// Producer or consumer endpoints a single channel can register
pub const MAX_ENDPOINTS: usize = 20;

/// Bytes reserved for an endpoint display name, NUL padded
pub const ENDPOINT_NAME_LEN: usize = 40;

/// Bytes reserved for a channel name, NUL padded
pub const CHANNEL_NAME_LEN: usize = 64;

/// Upper bound for one bulk dequeue
pub const MAX_BULK_READ: usize = 32;

/// Upper bound for chains staged by `insert` before a `commit`
pub const MAX_BULK_WRITE: usize = 1024;

/// Slots of a channel created without an explicit capacity
pub const DEFAULT_CAPACITY: u32 = 0x40000;

/// Journal entries minus one for a fresh journal file
pub const DEFAULT_JOURNAL_MASK: u32 = 0x7FF;

/// Journal utilization (of `mask + 1`) above which the journal doubles
pub const JOURNAL_GROW_RATIO: f64 = 0.8;

/// Failed writes between proactive re-notifications of a stalled consumer
pub const RENOTIFY_THRESHOLD: u32 = 10_000;

/// Blocking wait before `Wait` reports no signal (milliseconds)
pub const WAIT_TIMEOUT_MS: u64 = 1_000;

/// Well-known names shared by every process on the host
pub mod names {
    /// Shared channel used for command results
    pub const COMMAND_CHANNEL: &str = "COMMAND_RING";

    /// Segment pool for data channels
    pub const DATA_POOL: &str = "BASE_MEMORY_POOL";

    /// Segment pool for command channels
    pub const COMMAND_POOL: &str = "COMMAND_MEMORY_POOL";

    /// Prefix of the ring backing a segment pool's free list
    pub const POOL_RING_PREFIX: &str = "MP_";

    /// Marker used in sharded channel names
    pub const MULTI: &str = "MULTI";
}
