//! # Channel Layer Configuration
//!
//! Configuration and constants shared by every process that attaches to
//! the shared-memory channel layer.
//!
//! ## Features
//!
//! - **Limits**: segment and journal sizes, endpoint bounds, well-known names
//! - **Manager Configuration**: TOML file plus environment overrides
//! - **Topology**: the writer/reader routes a process attaches at start-up
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shmq_config::{load_config, limits};
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config/shmq.toml"), None).unwrap();
//! assert!(config.default_capacity.is_power_of_two());
//! let ceiling = limits::JUMBO_CEILING;
//! # let _ = ceiling;
//! ```

pub mod limits;
pub mod manager_config;
pub mod topology;

// Re-export commonly used types
pub use manager_config::{load_config, JournalSettings, ManagerConfig, PoolSettings};
pub use topology::{ProcessKey, RouteSpec, Sharding, StaticTopology, TomlTopology, TopologySource};
