//! Scheduler configuration.

use crate::PinningStrategy;
use crate::affinity::{MAX_WORKERS, MIN_WORKERS};
use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest fiber stack the scheduler accepts.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Configuration for the scheduler and its fibers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workers started by `Scheduler::start`. Clamped to `[8, 64]`. Default: 8.
    pub worker_count: usize,
    /// Stack size for each fiber in bytes. Default: 256KB.
    pub stack_size: usize,
    /// How worker threads are pinned to CPU cores. Default: none.
    pub pinning: PinningStrategy,
    /// Upper bound on an idle worker's sleep when no periodic fiber is due.
    /// Producers wake workers explicitly, so this only bounds missed-wake latency.
    pub idle_timeout_ms: u64,
    /// Worker threads are named `{prefix}{id}`.
    pub thread_name_prefix: String,
    /// Max-hold applied to every posted job, 0 = none.
    pub default_max_hold_ms: u64,
    /// Record a Chrome trace span for every executed job.
    pub trace_jobs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: MIN_WORKERS,
            stack_size: 256 * 1024,
            pinning: PinningStrategy::None,
            idle_timeout_ms: 50,
            thread_name_prefix: "TurboWorker_".to_string(),
            default_max_hold_ms: 0,
            trace_jobs: false,
        }
    }
}

impl SchedulerConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SchedulerConfig =
            serde_json::from_str(json).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(SchedulerError::Config(format!(
                "stack_size {} is below the minimum of {}",
                self.stack_size, MIN_STACK_SIZE
            )));
        }
        if self.worker_count > MAX_WORKERS {
            tracing::warn!(
                requested = self.worker_count,
                max = MAX_WORKERS,
                "worker_count exceeds mask width, will be clamped"
            );
        }
        if self.idle_timeout_ms == 0 {
            return Err(SchedulerError::Config(
                "idle_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn default_max_hold(&self) -> Duration {
        Duration::from_millis(self.default_max_hold_ms)
    }
}
