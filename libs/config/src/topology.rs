//! Process topology
//!
//! A topology lists which process writes to which, how many slots the
//! channel between them has, whether the route also runs in reverse and
//! whether it is part of a sharded group. The channel manager asks the
//! topology once at start-up and attaches one channel per route.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::debug;

/// Key identifying a process in the topology
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub package: String,
    pub node_type: String,
    pub process: String,
}

impl ProcessKey {
    pub fn new(
        package: impl Into<String>,
        node_type: impl Into<String>,
        process: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            node_type: node_type.into(),
            process: process.into(),
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.package, self.node_type, self.process)
    }
}

/// Sharding of a channel group
///
/// Fan-in routes share one channel per reader, fan-out routes share one
/// channel per writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sharding {
    #[default]
    None,
    /// Many writers, one reader (`W` marker)
    FanIn,
    /// One writer, many readers (`R` marker)
    FanOut,
}

impl Sharding {
    /// Parse the single-character marker used by topology tables
    pub fn from_marker(marker: char) -> Self {
        match marker.to_ascii_uppercase() {
            'W' => Sharding::FanIn,
            'R' => Sharding::FanOut,
            _ => Sharding::None,
        }
    }

    pub fn marker(&self) -> Option<char> {
        match self {
            Sharding::None => None,
            Sharding::FanIn => Some('W'),
            Sharding::FanOut => Some('R'),
        }
    }
}

/// One writer to reader route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub writer: String,
    pub reader: String,
    /// Channel slots, 0 for the manager default
    #[serde(default)]
    pub capacity: u32,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub sharding: Sharding,
}

impl RouteSpec {
    pub fn new(writer: impl Into<String>, reader: impl Into<String>) -> Self {
        Self {
            writer: writer.into(),
            reader: reader.into(),
            capacity: 0,
            bidirectional: false,
            sharding: Sharding::None,
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }

    pub fn sharded(mut self, sharding: Sharding) -> Self {
        self.sharding = sharding;
        self
    }
}

/// Source of the routes a process takes part in
pub trait TopologySource {
    /// Routes where `key.process` is the writer or the reader
    fn routes(&self, key: &ProcessKey) -> Result<Vec<RouteSpec>>;
}

/// In-memory topology, mostly for tests and embedded deployments
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    routes: Vec<RouteSpec>,
}

impl StaticTopology {
    pub fn new(routes: Vec<RouteSpec>) -> Self {
        Self { routes }
    }
}

impl TopologySource for StaticTopology {
    fn routes(&self, key: &ProcessKey) -> Result<Vec<RouteSpec>> {
        Ok(self
            .routes
            .iter()
            .filter(|r| r.writer == key.process || r.reader == key.process)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TopologyRow {
    package: String,
    node_type: String,
    #[serde(flatten)]
    route: RouteSpec,
}

#[derive(Debug, Clone, Deserialize)]
struct TopologyFile {
    #[serde(default, rename = "route")]
    routes: Vec<TopologyRow>,
}

/// Topology read from a TOML file of `[[route]]` tables
///
/// ```toml
/// [[route]]
/// package = "feed"
/// node_type = "edge"
/// writer = "P"
/// reader = "Q"
/// capacity = 4096
/// bidirectional = true
/// sharding = "none"
/// ```
#[derive(Debug, Clone)]
pub struct TomlTopology {
    rows: Vec<TopologyRow>,
}

impl TomlTopology {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology file {:?}", path))?;
        Self::parse(&content).with_context(|| format!("Invalid topology file {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: TopologyFile = toml::from_str(content).context("Failed to parse topology")?;
        debug!("Parsed {} topology routes", file.routes.len());
        Ok(Self { rows: file.routes })
    }
}

impl TopologySource for TomlTopology {
    fn routes(&self, key: &ProcessKey) -> Result<Vec<RouteSpec>> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.package == key.package && row.node_type == key.node_type)
            .map(|row| &row.route)
            .filter(|r| r.writer == key.process || r.reader == key.process)
            .cloned()
            .collect())
    }
}
