//! Pipeline configuration
//!
//! This module holds the static configuration captured when a pipeline is
//! built: the request window, worker pool size, and the default stripe
//! geometry the ISP programs. Configurations round-trip through JSON so a
//! deployment can keep them next to its tuning data.

use crate::error::{Result, SchedError};
use crate::stripe::StripeGeometry;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default request window (`W`); the slot array holds `2W` entries.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Default number of worker threads executing node stages.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Static pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Sliding request window `W`. Up to `2W` requests may be in flight
    /// to tolerate nodes completing late.
    pub queue_depth: usize,

    /// Worker threads executing node stage callbacks.
    pub worker_threads: usize,

    /// Capacity of the result channel toward the consumer.
    pub result_capacity: usize,

    /// Default stripe geometry programmed by the ISP node.
    pub stripe: StripeGeometry,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            worker_threads: DEFAULT_WORKER_THREADS,
            result_capacity: 4096,
            stripe: StripeGeometry {
                left_regions: 8,
                right_regions: 8,
                rows: 6,
                element_size: 4,
            },
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration before a pipeline is finalized.
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(SchedError::Config("queue_depth must be at least 1".into()));
        }
        if self.worker_threads == 0 {
            return Err(SchedError::Config(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.result_capacity == 0 {
            return Err(SchedError::Config(
                "result_capacity must be at least 1".into(),
            ));
        }
        self.stripe.validate()
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .map_err(|e| SchedError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| SchedError::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), contents)?;
        Ok(())
    }
}
