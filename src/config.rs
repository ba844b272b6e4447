//! Run configuration with sensible defaults.
//!
//! A [`RunConfig`] carries the process-wide knobs of an engine run: the name
//! stamped on the execution graph, the poll interval used by tailing file
//! backends, and the buffer capacity of combined streams. It can be built in
//! code or loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::Result;

/// Default polling interval for tailing readers that hit end-of-file.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

/// Default buffer capacity of a combined stream.
pub const DEFAULT_COMBINE_CAPACITY: usize = 16;

fn default_graph_name() -> String {
    "flow".to_string()
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_combine_capacity() -> usize {
    DEFAULT_COMBINE_CAPACITY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Name of the emitted dot graph.
    #[serde(default = "default_graph_name")]
    pub graph_name: String,
    /// Poll interval for file backends that tail a growing file.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Buffer capacity of combined streams.
    #[serde(default = "default_combine_capacity")]
    pub combine_capacity: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            graph_name: default_graph_name(),
            poll_interval_ms: default_poll_interval_ms(),
            combine_capacity: default_combine_capacity(),
        }
    }
}

impl RunConfig {
    /// Load a configuration from a TOML file.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(config)
    }

    /// The poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
