//! Agents and the agent registry

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{ConclaveError, Result};
use crate::event::{Event, EventLog};
use crate::types::{AgentId, AgentStatus, TaskId};

/// What an agent is registered with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSpec {
    pub name: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub team: Option<String>,
}

impl AgentSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn in_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }
}

/// Figures an agent reports about itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentMetrics {
    pub memory_bytes: u64,
    /// Fraction of recent work that failed, in `[0, 1]`
    pub error_rate: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

/// A registered worker
pub struct Agent {
    /// Unique identifier
    pub id: AgentId,
    pub name: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub team: Option<String>,
    status: RwLock<AgentStatus>,
    current_task: RwLock<Option<TaskId>>,
    metrics: RwLock<AgentMetrics>,
    events: EventLog,
    /// Shared with the registry; woken when the agent may be claimable again
    freed: Arc<Notify>,
}

impl Agent {
    fn new(spec: AgentSpec, events: EventLog, freed: Arc<Notify>) -> Self {
        let id = AgentId::new();
        info!(
            agent_id = %id,
            name = ?spec.name,
            team = ?spec.team,
            capabilities = ?spec.capabilities,
            "Registering agent"
        );

        Self {
            id,
            name: spec.name,
            capabilities: spec.capabilities,
            team: spec.team,
            status: RwLock::new(AgentStatus::Available),
            current_task: RwLock::new(None),
            metrics: RwLock::new(AgentMetrics::default()),
            events,
            freed,
        }
    }

    /// Get current status
    pub fn status(&self) -> AgentStatus {
        *self.status.read()
    }

    /// Set status and record the change
    pub fn set_status(&self, status: AgentStatus) {
        let mut guard = self.status.write();
        if *guard == status || *guard == AgentStatus::Terminated {
            return;
        }
        *guard = status;
        drop(guard);

        debug!(agent_id = %self.id, ?status, "Agent status changed");
        self.events.append(Event::AgentStatusChanged {
            agent_id: self.id,
            status,
        });
        if matches!(status, AgentStatus::Available | AgentStatus::Terminated) {
            self.freed.notify_waiters();
        }
    }

    /// Whether the agent has every listed capability
    pub fn has_capabilities<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c.as_ref()))
    }

    /// Move from available to busy with `task`; false if the agent was not available
    pub fn try_claim(&self, task: TaskId) -> bool {
        let mut guard = self.status.write();
        if *guard != AgentStatus::Available {
            return false;
        }
        *guard = AgentStatus::Busy;
        drop(guard);

        *self.current_task.write() = Some(task);
        self.events.append(Event::AgentStatusChanged {
            agent_id: self.id,
            status: AgentStatus::Busy,
        });
        true
    }

    /// Clear the current task and count its outcome
    pub fn finish_task(&self, succeeded: bool) {
        *self.current_task.write() = None;
        {
            let mut metrics = self.metrics.write();
            if succeeded {
                metrics.tasks_completed += 1;
            } else {
                metrics.tasks_failed += 1;
            }
        }
        if self.status() == AgentStatus::Busy {
            self.set_status(AgentStatus::Available);
        }
    }

    /// Get current task
    pub fn current_task(&self) -> Option<TaskId> {
        *self.current_task.read()
    }

    /// Replace the self-reported figures, keeping the task counters
    pub fn report_metrics(&self, memory_bytes: u64, error_rate: f64) {
        let mut metrics = self.metrics.write();
        metrics.memory_bytes = memory_bytes;
        metrics.error_rate = error_rate.clamp(0.0, 1.0);
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.metrics.read().clone()
    }
}

/// Handle to an agent for external interaction
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<Agent>,
}

impl AgentHandle {
    fn new(agent: Agent) -> Self {
        Self {
            inner: Arc::new(agent),
        }
    }

    pub fn id(&self) -> AgentId {
        self.inner.id
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = Agent;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// All registered agents
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, AgentHandle>>,
    events: EventLog,
    freed: Arc<Notify>,
}

impl AgentRegistry {
    pub fn new(events: EventLog) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
            freed: Arc::new(Notify::new()),
        }
    }

    pub fn register(&self, spec: AgentSpec) -> AgentHandle {
        let capabilities: Vec<String> = spec.capabilities.iter().cloned().collect();
        let agent = Agent::new(spec, self.events.clone(), Arc::clone(&self.freed));
        let handle = AgentHandle::new(agent);
        self.agents.write().insert(handle.id(), handle.clone());
        self.events.append(Event::AgentRegistered {
            agent_id: handle.id(),
            capabilities,
        });
        self.freed.notify_waiters();
        handle
    }

    /// Resolves after an agent registers, becomes available or terminates
    ///
    /// Enable the future before checking [`claim`](Self::claim) so a change
    /// between the check and the wait is not missed.
    pub fn freed(&self) -> Notified<'_> {
        self.freed.notified()
    }

    /// Remove an agent; it is marked terminated
    pub fn deregister(&self, id: &AgentId) -> Result<AgentHandle> {
        let handle = self
            .agents
            .write()
            .remove(id)
            .ok_or(ConclaveError::AgentNotFound(*id))?;
        handle.set_status(AgentStatus::Terminated);
        info!(agent_id = %id, "Agent deregistered");
        self.events.append(Event::AgentDeregistered { agent_id: *id });
        Ok(handle)
    }

    pub fn get(&self, id: &AgentId) -> Result<AgentHandle> {
        self.agents
            .read()
            .get(id)
            .cloned()
            .ok_or(ConclaveError::AgentNotFound(*id))
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Every agent, sorted by id
    pub fn all(&self) -> Vec<AgentHandle> {
        let mut agents: Vec<AgentHandle> = self.agents.read().values().cloned().collect();
        agents.sort_by_key(|a| a.id());
        agents
    }

    /// Members of a team, sorted by id
    pub fn team(&self, team: &str) -> Vec<AgentHandle> {
        self.all()
            .into_iter()
            .filter(|a| a.team.as_deref() == Some(team))
            .collect()
    }

    /// Claim an available agent with all `capabilities` for `task`
    ///
    /// Agents in `exclude` are skipped. Among candidates the one with the
    /// fewest finished tasks wins, ties by id.
    pub fn claim<S: AsRef<str>>(
        &self,
        capabilities: &[S],
        exclude: &[AgentId],
        task: TaskId,
    ) -> Option<AgentHandle> {
        let mut candidates: Vec<AgentHandle> = self
            .all()
            .into_iter()
            .filter(|a| {
                !exclude.contains(&a.id())
                    && a.status() == AgentStatus::Available
                    && a.has_capabilities(capabilities)
            })
            .collect();
        candidates.sort_by_key(|a| {
            let m = a.metrics();
            (m.tasks_completed + m.tasks_failed, a.id())
        });
        candidates.into_iter().find(|a| a.try_claim(task))
    }

    /// Whether any registered agent outside `exclude` could ever run work
    /// needing `capabilities`, busy or not
    pub fn any_capable<S: AsRef<str>>(&self, capabilities: &[S], exclude: &[AgentId]) -> bool {
        self.agents.read().values().any(|a| {
            !exclude.contains(&a.id())
                && a.status() != AgentStatus::Terminated
                && a.has_capabilities(capabilities)
        })
    }
}
