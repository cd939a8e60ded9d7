//! Runtime configuration
//!
//! Configuration is plain serde data. Every section except [`ConsensusConfig`]
//! has defaults; the quorum minimum must always be chosen by the caller.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::retry::RetryPolicy;

/// Serde helper storing durations as integer milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Top-level configuration for a [`Coordinator`](crate::Coordinator)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Consensus settings (required)
    pub consensus: ConsensusConfig,
    /// Message bus settings
    #[serde(default)]
    pub bus: BusConfig,
    /// Heartbeat and deadlock scanning
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Defaults for breakers created on demand
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Retry policy applied to dispatched tasks
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How many times a task may move to another agent after escalation
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    /// Buffer size of the live event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_requeues() -> u32 {
    2
}

fn default_event_capacity() -> usize {
    1024
}

impl CoordinatorConfig {
    /// Configuration with defaults everywhere except the quorum minimum
    pub fn new(min_participants: usize) -> Self {
        Self {
            consensus: ConsensusConfig::new(min_participants),
            bus: BusConfig::default(),
            detector: DetectorConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            max_requeues: default_max_requeues(),
            event_capacity: default_event_capacity(),
        }
    }

    /// Parse configuration from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

/// Consensus settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Minimum number of cast votes for a round to be valid
    pub min_participants: usize,
    /// How long a resolved round stays queryable before it is dropped
    #[serde(default = "default_resolved_retention", with = "duration_ms")]
    pub resolved_retention: Duration,
}

fn default_resolved_retention() -> Duration {
    Duration::from_secs(300)
}

impl ConsensusConfig {
    pub fn new(min_participants: usize) -> Self {
        Self {
            min_participants,
            resolved_retention: default_resolved_retention(),
        }
    }
}

/// Message bus settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// How long a causal message may wait for its predecessor before it is dropped
    #[serde(with = "duration_ms")]
    pub causal_hold_timeout: Duration,
    /// Message ids each mailbox remembers for duplicate suppression and
    /// causal predecessor lookup
    pub id_window: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            causal_hold_timeout: Duration::from_secs(30),
            id_window: 4096,
        }
    }
}

/// Failure detector settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Expected heartbeat period
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Silence after which an agent is classified unresponsive
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Period of the background deadlock scan
    #[serde(with = "duration_ms")]
    pub deadlock_scan_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(5),
            deadlock_scan_interval: Duration::from_secs(1),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial call is allowed
    #[serde(with = "duration_ms")]
    pub reopen_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reopen_timeout: Duration::from_secs(30),
        }
    }
}
