//! Shared-Memory Channel Layer
//!
//! Processes on one host attach by name to fixed-capacity rings kept in
//! shared memory and exchange variable-length messages without the kernel
//! on the data path.
//!
//! - [`ring`]: the multi-producer/multi-consumer ring and its endpoint tables
//! - [`pool`]: fixed-size buffer segments shared by every process
//! - [`registry`]: endpoint registration and crash recovery
//! - [`codec`]: payload ↔ segment chain conversion
//! - [`notify`]: sleep flags and targeted wake-ups
//! - [`journal`]: the mmap-backed, growing on-disk mirror
//! - [`manager`]: attach orchestration, dispatch and the command channel
//! - [`admin`]: operator operations used by `shmqctl`

pub mod admin;
pub mod codec;
pub mod error;
pub mod journal;
pub mod manager;
pub mod notify;
pub mod pool;
pub mod registry;
pub mod ring;

pub use admin::{ChannelAdmin, ChannelKind, ChannelStatus, EndpointStatus};
pub use error::{ChannelError, JournalOp, Result};
pub use journal::{Journal, JournalOptions, JournalReader, JournalState};
pub use manager::{
    channel_name, ChannelManager, CommandRole, Direction, FirstChannel, KeyHash, ProcessIdentity,
    WaitOutcome, WriteSelector,
};
pub use notify::{Doorbell, Notifier, WakeKind, WakeMessage};
pub use pool::{SegmentId, SegmentPool};
pub use registry::Recovery;
pub use ring::{Role, ShmRing};

pub use shmq_config::{limits, ManagerConfig, RouteSpec, Sharding, StaticTopology, TopologySource};
