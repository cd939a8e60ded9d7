//! Caller-defined health checks over agent metrics

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentHandle, AgentMetrics};
use crate::detector::Liveness;
use crate::types::{AgentId, AgentStatus};

/// Which agents a health query covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTarget {
    Agent(AgentId),
    Team(String),
}

/// A named predicate over reported metrics
#[derive(Clone)]
pub struct HealthCheck {
    name: String,
    predicate: Arc<dyn Fn(&AgentMetrics) -> bool + Send + Sync>,
}

impl fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheck").field("name", &self.name).finish()
    }
}

impl HealthCheck {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&AgentMetrics) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn max_memory(bytes: u64) -> Self {
        Self::new("memory", move |m| m.memory_bytes <= bytes)
    }

    pub fn max_error_rate(rate: f64) -> Self {
        Self::new("error_rate", move |m| m.error_rate <= rate)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn passes(&self, metrics: &AgentMetrics) -> bool {
        (self.predicate)(metrics)
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

/// Point-in-time health of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub liveness: Liveness,
    pub metrics: AgentMetrics,
    pub checks: Vec<CheckResult>,
    /// Every check passed and the agent is neither unresponsive nor terminated
    pub healthy: bool,
}

impl HealthSnapshot {
    pub fn evaluate(agent: &AgentHandle, liveness: Liveness, checks: &[HealthCheck]) -> Self {
        let metrics = agent.metrics();
        let status = agent.status();
        let checks: Vec<CheckResult> = checks
            .iter()
            .map(|c| CheckResult {
                name: c.name().to_string(),
                passed: c.passes(&metrics),
            })
            .collect();
        let healthy = checks.iter().all(|c| c.passed)
            && liveness != Liveness::Unresponsive
            && !matches!(status, AgentStatus::Unresponsive | AgentStatus::Terminated);

        Self {
            agent_id: agent.id(),
            status,
            liveness,
            metrics,
            checks,
            healthy,
        }
    }
}
