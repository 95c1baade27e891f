//! Tunable settings grouped by concern
//!
//! # Main Types
//!
//! - [`PoolSettings`] - Growth and retention bounds for the internal image pools
//! - [`BarrierSettings`] - Watchdog applied to `flush`/`sync`
//! - [`OrderingSettings`] - Completion ordering and node queue policy
//! - [`LogSettings`] - Filter directive and optional rolling log file

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of buffers each internal pool grows to on demand
pub const DEFAULT_AUTO_ALLOCATE: usize = 8;

/// Default barrier watchdog in milliseconds
pub const DEFAULT_WATCHDOG_MS: u64 = 3000;

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "info,feature_pipe=debug";

/// Bounds for the pipe's internal image pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Buffers allocated up front when a pool is first created
    pub preallocate: usize,

    /// Upper bound a pool may grow to inline while serving `request()`
    pub auto_allocate: usize,

    /// Idle buffers retained before physical release (None keeps everything)
    pub auto_free: Option<usize>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            preallocate: 0,
            auto_allocate: DEFAULT_AUTO_ALLOCATE,
            auto_free: None,
        }
    }
}

/// Watchdog applied to graph-wide barriers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarrierSettings {
    /// Milliseconds before the diagnostic dump fires (None disables it)
    pub watchdog_ms: Option<u64>,
}

impl BarrierSettings {
    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_ms.map(Duration::from_millis)
    }
}

impl Default for BarrierSettings {
    fn default() -> Self {
        Self {
            watchdog_ms: Some(DEFAULT_WATCHDOG_MS),
        }
    }
}

/// Ordering policy for request flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderingSettings {
    /// Deliver completions to the caller in enqueue order
    pub ordered_completion: bool,

    /// Capture nodes pop their input queue by lowest request sequence
    pub priority_queues: bool,
}

impl Default for OrderingSettings {
    fn default() -> Self {
        Self {
            ordered_completion: true,
            priority_queues: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,

    /// Directory for a daily rolling log file
    pub directory: Option<PathBuf>,

    /// File name prefix inside `directory`
    pub file_prefix: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: "feature-pipe.log".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let pool = PoolSettings::default();
        assert_eq!(pool.auto_allocate, DEFAULT_AUTO_ALLOCATE);
        assert!(pool.auto_free.is_none());
    }

    #[test]
    fn test_barrier_watchdog_duration() {
        let barrier = BarrierSettings {
            watchdog_ms: Some(50),
        };
        assert_eq!(barrier.watchdog(), Some(Duration::from_millis(50)));
        assert_eq!(BarrierSettings { watchdog_ms: None }.watchdog(), None);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let ordering: OrderingSettings = toml::from_str("priority_queues = true").unwrap();
        assert!(ordering.priority_queues);
        assert!(ordering.ordered_completion);
    }
}
