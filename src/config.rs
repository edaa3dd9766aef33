//! Database options
//!
//! Options can be built in code or loaded from YAML:
//!
//! ```yaml
//! sync_wal: true
//! checkpoint_interval: 512
//! query_cache_capacity: 64
//! vector_metric: euclidean
//! limits:
//!   max_intermediate_rows: 1000000
//!   soft_timeout_ms: 5000
//! ```

use crate::vector::DistanceMetric;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Caps on the work a single statement may do. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLimits {
    /// Rows a materializing operator (sort, aggregate, distinct, result
    /// collection) may hold at once
    pub max_intermediate_rows: Option<usize>,
    /// Items a single `collect()` or `range()` list may contain
    pub max_collection_items: Option<usize>,
    /// Wall-clock budget of one statement, checked between rows
    pub soft_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbOptions {
    /// fsync the WAL on every commit
    pub sync_wal: bool,
    /// Commits between automatic checkpoints; 0 checkpoints only on close
    pub checkpoint_interval: usize,
    /// Parsed statements kept in the LRU cache; 0 disables it
    pub query_cache_capacity: usize,
    pub vector_metric: DistanceMetric,
    pub limits: QueryLimits,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            sync_wal: true,
            checkpoint_interval: 1024,
            query_cache_capacity: 128,
            vector_metric: DistanceMetric::Euclidean,
            limits: QueryLimits::default(),
        }
    }
}

impl DbOptions {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }
}
