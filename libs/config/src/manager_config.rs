//! Channel Manager Configuration
//!
//! Loads the settings shared by every process that attaches to the channel
//! layer on one host. Values come from a TOML file, an optional
//! per-environment overlay and `SHMQ__*` environment variables.

use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::limits;

/// Settings for one channel manager instance
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory holding ring, pool and doorbell files
    pub shm_root: PathBuf,

    /// Slots for channels created without an explicit capacity
    pub default_capacity: u32,

    /// How long `wait` blocks before reporting no signal
    pub wait_timeout_ms: u64,

    /// Failed writes between proactive re-notifications
    pub renotify_threshold: u32,

    pub journal: JournalSettings,

    pub pools: PoolSettings,
}

/// Journal settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct JournalSettings {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Flush with `MS_SYNC` instead of `MS_ASYNC`
    pub sync: bool,
    pub initial_mask: u32,
}

/// Segment pool names and sizes
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PoolSettings {
    pub data: String,
    pub data_segments: u32,
    pub command: String,
    pub command_segments: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shm_root: PathBuf::from("/dev/shm/shmq"),
            default_capacity: limits::DEFAULT_CAPACITY,
            wait_timeout_ms: limits::WAIT_TIMEOUT_MS,
            renotify_threshold: limits::RENOTIFY_THRESHOLD,
            journal: JournalSettings::default(),
            pools: PoolSettings::default(),
        }
    }
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from("./journal"),
            sync: false,
            initial_mask: limits::DEFAULT_JOURNAL_MASK,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            data: limits::names::DATA_POOL.to_string(),
            data_segments: 8192,
            command: limits::names::COMMAND_POOL.to_string(),
            command_segments: 256,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a base file with environment overrides
    pub fn load(base_path: &Path, environment: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder().add_source(File::from(base_path).required(true));

        if let Some(env) = environment {
            let env_file = base_path
                .parent()
                .unwrap_or(Path::new("."))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SHMQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        let loaded: ManagerConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        debug!("Loaded channel manager config from {:?}", base_path);
        Ok(loaded)
    }

    /// Expand `~` and `$VAR` references in path settings
    pub fn expand_paths(&mut self) -> Result<()> {
        self.shm_root = expand(&self.shm_root).context("Failed to expand shm_root")?;
        self.journal.dir = expand(&self.journal.dir).context("Failed to expand journal dir")?;
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Reject settings the channel layer cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.default_capacity.is_power_of_two() {
            anyhow::bail!(
                "default_capacity must be a power of two, got {:#x}",
                self.default_capacity
            );
        }
        if !self.journal.initial_mask.wrapping_add(1).is_power_of_two() {
            anyhow::bail!(
                "journal.initial_mask must be a power of two minus one, got {:#x}",
                self.journal.initial_mask
            );
        }
        if self.renotify_threshold == 0 {
            anyhow::bail!("renotify_threshold must be non-zero");
        }
        if self.pools.data_segments == 0 || self.pools.command_segments == 0 {
            anyhow::bail!("segment pools must hold at least one segment");
        }
        Ok(())
    }
}

fn expand(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Convenience function to load, expand and validate configuration
pub fn load_config(base_path: &Path, environment: Option<&str>) -> Result<ManagerConfig> {
    let mut config = ManagerConfig::load(base_path, environment)?;
    config.expand_paths()?;
    config.validate()?;
    Ok(config)
}
