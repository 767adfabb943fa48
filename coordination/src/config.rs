//! Coordination configuration
//!
//! Every protocol-level knob (quorum policy inputs, grace intervals, cache
//! TTLs, the human-override threshold) is carried here so nothing is
//! hard-coded into the consensus logic. Loadable from TOML with serde
//! defaults for missing keys.

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::context::TtlClass;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tunable parameters for the coordination core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Missed-heartbeat interval before Active degrades (ms)
    pub heartbeat_interval_ms: u64,
    /// Grace window before Degraded becomes Unreachable (ms)
    pub degraded_grace_ms: u64,
    /// Sustained unreachability before automatic retirement (ms)
    pub retire_grace_ms: u64,
    /// Minimum participants per consensus round
    pub min_participants: usize,
    /// Maximum participants per consensus round
    pub max_participants: usize,
    /// Default mean-confidence threshold for the human-override path
    pub confidence_threshold: f64,
    /// L1 cache tier staleness budget (seconds)
    pub ttl_l1_secs: u64,
    /// L2 cache tier staleness budget (seconds)
    pub ttl_l2_secs: u64,
    /// L3 cache tier staleness budget (seconds)
    pub ttl_l3_secs: u64,
    /// Per-agent dispatch reachability timeout (ms)
    pub dispatch_timeout_ms: u64,
    /// Broadcast capacity of the coordination event bus
    pub event_channel_capacity: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            degraded_grace_ms: 5_000,
            retire_grace_ms: 30_000,
            min_participants: 3,
            max_participants: 15,
            confidence_threshold: 0.85,
            ttl_l1_secs: 60,
            ttl_l2_secs: 300,
            ttl_l3_secs: 3_600,
            dispatch_timeout_ms: 500,
            event_channel_capacity: 256,
        }
    }
}

impl CoordinationConfig {
    /// Load configuration from a TOML file, applying defaults for missing keys
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency of the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_participants == 0 {
            return Err(ConfigError::Invalid("min_participants must be at least 1".into()));
        }
        if self.max_participants < self.min_participants {
            return Err(ConfigError::Invalid(format!(
                "max_participants ({}) below min_participants ({})",
                self.max_participants, self.min_participants
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold {} outside [0.0, 1.0]",
                self.confidence_threshold
            )));
        }
        if self.degraded_grace_ms < self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "degraded_grace_ms must not be shorter than heartbeat_interval_ms".into(),
            ));
        }
        Ok(())
    }

    /// Staleness budget for a cache tier; `None` for the persistent tier
    pub fn ttl_for(&self, class: TtlClass) -> Option<Duration> {
        match class {
            TtlClass::L1 => Some(Duration::seconds(self.ttl_l1_secs as i64)),
            TtlClass::L2 => Some(Duration::seconds(self.ttl_l2_secs as i64)),
            TtlClass::L3 => Some(Duration::seconds(self.ttl_l3_secs as i64)),
            TtlClass::Persistent => None,
        }
    }

    /// Heartbeat interval as a chrono duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::milliseconds(self.heartbeat_interval_ms as i64)
    }

    /// Degraded grace window as a chrono duration
    pub fn degraded_grace(&self) -> Duration {
        Duration::milliseconds(self.degraded_grace_ms as i64)
    }

    /// Retirement grace window as a chrono duration
    pub fn retire_grace(&self) -> Duration {
        Duration::milliseconds(self.retire_grace_ms as i64)
    }
}
