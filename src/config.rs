//! Pipeline configuration, loaded from JSON.
//!
//! ```json
//! {
//!   "queue": { "kind": "leased", "url": "file:///data/queue", "visibility_timeout_secs": 600 },
//!   "worker": { "poll_interval_ms": 500, "max_tasks": 1000 },
//!   "pyramid": { "factor": [2, 2, 1], "fill_missing": false }
//! }
//! ```

use crate::compression::CompressionMethod;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pyramid: PyramidConfig,
}

/// Which queue implementation runs the tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Execute immediately in the submitting process
    #[default]
    Mock,
    /// Durable records with visibility-timeout leases
    Leased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub kind: QueueKind,

    /// Store holding the queue records (leased queue only)
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Leases granted before a task is failed for good
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_visibility_timeout() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::default(),
            url: None,
            visibility_timeout_secs: default_visibility_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sleep between polls of an empty queue
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Stop after processing this many tasks
    #[serde(default)]
    pub max_tasks: Option<usize>,

    /// Return as soon as no task is visible instead of polling
    #[serde(default)]
    pub stop_when_empty: bool,
}

fn default_poll_interval() -> u64 {
    1_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_tasks: None,
            stop_when_empty: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyramidConfig {
    /// Per-axis downsample factor between consecutive mips
    #[serde(default = "default_factor")]
    pub factor: [usize; 3],

    #[serde(default)]
    pub fill_missing: bool,

    /// Chunk compression for newly added scales
    #[serde(default)]
    pub compression: CompressionMethod,
}

fn default_factor() -> [usize; 3] {
    [2, 2, 1]
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            factor: default_factor(),
            fill_missing: false,
            compression: CompressionMethod::None,
        }
    }
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.kind == QueueKind::Leased && self.queue.url.is_none() {
            return Err(PipelineError::Configuration(
                "queue.url is required for a leased queue".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        let factor = self.pyramid.factor;
        if factor.iter().any(|&f| f == 0) || factor.iter().all(|&f| f == 1) {
            return Err(PipelineError::Configuration(format!(
                "pyramid.factor {:?} must be at least 1 everywhere and coarsen one axis",
                factor
            )));
        }
        Ok(())
    }
}
