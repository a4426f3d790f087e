use crate::source::position::LogPosition;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Everything a tail session can be configured with. Every field has a
/// default, so an empty document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Explicit resume point. Takes precedence over a stored checkpoint.
    pub resume_position: Option<LogPosition>,
    pub filter: FilterConfig,
    pub direct_read: DirectReadConfig,
    pub buffer: BufferConfig,
    /// Capacity of each queue between pipeline stages.
    pub channel_size: usize,
    /// Number of concurrent document fetch workers.
    pub workers: usize,
    pub ordering: OrderingMode,
    /// Deliver update deltas as written in the log instead of fetching the
    /// full document.
    pub update_data_as_delta: bool,
    pub checkpoint: CheckpointConfig,
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resume_position: None,
            filter: FilterConfig::default(),
            direct_read: DirectReadConfig::default(),
            buffer: BufferConfig::default(),
            channel_size: 20,
            workers: 5,
            ordering: OrderingMode::Strict,
            update_data_as_delta: false,
            checkpoint: CheckpointConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Regex patterns matched against `database.collection`. An empty include
/// list includes everything; exclusion wins over inclusion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectReadConfig {
    /// `database.collection` names to snapshot at start.
    pub namespaces: Vec<String>,
    pub readers_per_collection: usize,
    pub batch_size: usize,
    /// Per-shard document cap. 0 reads every document.
    pub limit: usize,
}

impl Default for DirectReadConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            readers_per_collection: 10,
            batch_size: 500,
            limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Operations per fetch batch; reaching it closes the batch.
    pub size: usize,
    /// Longest a batch may stay open before it is flushed anyway.
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 50,
            max_latency: Duration::from_millis(750),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingMode {
    /// Deliver log-origin operations in log order.
    Strict,
    /// Deliver each operation as soon as it is ready.
    Unordered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("optail.checkpoint.json"),
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory of the JSON-lines store used by the binary.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
        }
    }
}
