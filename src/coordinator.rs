//! Coordinator - composes the runtime behind one façade
//!
//! The coordinator owns every registry, the shared event log and the
//! breaker map. Tasks are submitted, then executed through a caller-supplied
//! handler: the task is dispatched to an available capable agent, run under
//! the resilience executor and, when the agent is escalated as unresponsive
//! or aborted as a deadlock victim, requeued on another agent.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentHandle, AgentRegistry, AgentSpec};
use crate::barrier::BarrierRegistry;
use crate::breaker::BreakerRegistry;
use crate::bus::MessageBus;
use crate::clock::{SharedClock, SystemClock};
use crate::config::{duration_ms, CoordinatorConfig};
use crate::consensus::ConsensusEngine;
use crate::detector::{DeadlockReport, FailureDetector};
use crate::error::{ConclaveError, ErrorKind, ExecutionFailure, Result};
use crate::event::{Event, EventLog, EventRecord, EventStream, ReplayState};
use crate::executor::{ResilienceExecutor, RunContext};
use crate::health::{HealthCheck, HealthSnapshot, HealthTarget};
use crate::lock::LockManager;
use crate::semaphore::SemaphoreRegistry;
use crate::types::{AgentId, AgentStatus, Priority, TaskId};

/// Work submitted to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Every capability the executing agent must have
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Limit for each attempt
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub payload: Value,
    /// Resource whose circuit breaker guards the task
    #[serde(default)]
    pub resource: Option<String>,
}

impl TaskSpec {
    pub fn new(timeout: Duration) -> Self {
        Self {
            capabilities: Vec::new(),
            timeout,
            priority: Priority::default(),
            payload: Value::Null,
            resource: None,
        }
    }

    pub fn requiring(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn guarding(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Snapshot returned by [`Coordinator::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Attempts beyond the first, across every agent
    pub retries: u32,
    /// Times the task moved to another agent
    pub requeues: u32,
    /// Agent of the latest dispatch
    pub agent: Option<AgentId>,
}

/// What a handler sees when it runs a task
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub priority: Priority,
    pub payload: Value,
}

/// Runs a task on the agent it was dispatched to
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self)(ctx).await
    }
}

struct TaskRecord {
    spec: TaskSpec,
    seq: u64,
    state: TaskState,
    attempts: u32,
    requeues: u32,
    agent: Option<AgentId>,
    /// An `execute` call owns the task, even while it waits queued for an agent
    claimed: bool,
}

/// The coordination runtime
pub struct Coordinator {
    config: CoordinatorConfig,
    events: EventLog,
    agents: AgentRegistry,
    bus: MessageBus,
    locks: LockManager,
    semaphores: SemaphoreRegistry,
    barriers: BarrierRegistry,
    consensus: ConsensusEngine,
    detector: Arc<FailureDetector>,
    breakers: BreakerRegistry,
    executor: ResilienceExecutor,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Create a coordinator on the tokio clock
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: CoordinatorConfig, clock: SharedClock) -> Self {
        let events = EventLog::new(config.event_capacity);
        let detector = Arc::new(FailureDetector::new(
            config.detector,
            Arc::clone(&clock),
            events.clone(),
        ));

        info!(
            min_participants = config.consensus.min_participants,
            max_requeues = config.max_requeues,
            "Starting coordinator"
        );

        Self {
            agents: AgentRegistry::new(events.clone()),
            bus: MessageBus::new(config.bus, Arc::clone(&clock), events.clone()),
            locks: LockManager::new(Arc::clone(&clock), events.clone()),
            semaphores: SemaphoreRegistry::new(Arc::clone(&clock), events.clone()),
            barriers: BarrierRegistry::new(events.clone()),
            consensus: ConsensusEngine::new(config.consensus, Arc::clone(&clock), events.clone()),
            breakers: BreakerRegistry::new(config.breaker, Arc::clone(&clock), events.clone()),
            executor: ResilienceExecutor::with_detector(Arc::clone(&detector)),
            detector,
            tasks: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            events,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn semaphores(&self) -> &SemaphoreRegistry {
        &self.semaphores
    }

    pub fn barriers(&self) -> &BarrierRegistry {
        &self.barriers
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.consensus
    }

    pub fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn executor(&self) -> &ResilienceExecutor {
        &self.executor
    }

    // === Agents ===

    /// Register an agent with the registry, the bus and the detector
    pub fn register_agent(&self, spec: AgentSpec) -> AgentHandle {
        let handle = self.agents.register(spec);
        self.bus.register(handle.id());
        self.detector.track(handle.id());
        handle
    }

    /// Remove an agent and give up everything it holds
    pub fn deregister_agent(&self, id: &AgentId) -> Result<()> {
        self.agents.deregister(id)?;
        self.bus.deregister(id);
        self.detector.forget(id);
        let locks = self.locks.abort(*id);
        let permits = self.semaphores.abort(*id);
        if !locks.is_empty() || !permits.is_empty() {
            info!(agent_id = %id, ?locks, ?permits, "Released holdings of deregistered agent");
        }
        Ok(())
    }

    /// Record a heartbeat; an agent marked unresponsive becomes available again
    pub fn heartbeat(&self, id: &AgentId) -> Result<()> {
        let agent = self.agents.get(id)?;
        self.detector.heartbeat(*id);
        if agent.status() == AgentStatus::Unresponsive {
            info!(agent_id = %id, "Agent responsive again");
            agent.set_status(if agent.current_task().is_some() {
                AgentStatus::Busy
            } else {
                AgentStatus::Available
            });
        }
        Ok(())
    }

    pub fn report_metrics(&self, id: &AgentId, memory_bytes: u64, error_rate: f64) -> Result<()> {
        self.agents.get(id)?.report_metrics(memory_bytes, error_rate);
        Ok(())
    }

    /// Mark agents with overdue heartbeats unresponsive; returns newly marked agents
    pub fn scan_heartbeats(&self) -> Vec<AgentId> {
        let mut marked = Vec::new();
        for id in self.detector.scan() {
            let Ok(agent) = self.agents.get(&id) else {
                continue;
            };
            if matches!(
                agent.status(),
                AgentStatus::Available | AgentStatus::Busy
            ) {
                warn!(agent_id = %id, "Heartbeat overdue, marking unresponsive");
                agent.set_status(AgentStatus::Unresponsive);
                marked.push(id);
            }
        }
        marked
    }

    /// Break every current deadlock
    pub fn detect_deadlocks(&self) -> Vec<DeadlockReport> {
        self.detector.detect_and_resolve(&self.locks, &self.semaphores)
    }

    /// Evaluate `checks` for an agent or a whole team
    pub fn health(&self, target: &HealthTarget, checks: &[HealthCheck]) -> Result<Vec<HealthSnapshot>> {
        let agents = match target {
            HealthTarget::Agent(id) => vec![self.agents.get(id)?],
            HealthTarget::Team(team) => self.agents.team(team),
        };
        Ok(agents
            .iter()
            .map(|a| HealthSnapshot::evaluate(a, self.detector.classify(&a.id()), checks))
            .collect())
    }

    // === Tasks ===

    #[instrument(skip(self, spec), fields(priority = ?spec.priority))]
    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId> {
        if spec.timeout.is_zero() {
            return Err(ConclaveError::InvalidArgument("task timeout must be positive".into()));
        }
        let id = TaskId::new();
        let priority = spec.priority;
        let record = TaskRecord {
            spec,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            state: TaskState::Queued,
            attempts: 0,
            requeues: 0,
            agent: None,
            claimed: false,
        };
        self.tasks.write().insert(id, record);
        debug!(task_id = %id, "Task queued");
        self.events.append(Event::TaskSubmitted {
            task_id: id,
            priority,
        });
        Ok(id)
    }

    pub fn status(&self, id: &TaskId) -> Result<TaskStatus> {
        let tasks = self.tasks.read();
        let record = tasks.get(id).ok_or(ConclaveError::TaskNotFound(*id))?;
        Ok(TaskStatus {
            state: record.state,
            retries: record.attempts.saturating_sub(1),
            requeues: record.requeues,
            agent: record.agent,
        })
    }

    /// The queued task to run next: most urgent first, then oldest
    pub fn next_queued(&self) -> Option<TaskId> {
        self.tasks
            .read()
            .iter()
            .filter(|(_, r)| r.state == TaskState::Queued && !r.claimed)
            .min_by_key(|(_, r)| (r.spec.priority, r.seq))
            .map(|(id, _)| *id)
    }

    fn update_task(&self, id: &TaskId, f: impl FnOnce(&mut TaskRecord)) {
        if let Some(record) = self.tasks.write().get_mut(id) {
            f(record);
        }
    }

    fn fail_task(&self, id: TaskId, failure: ExecutionFailure) -> ExecutionFailure {
        self.update_task(&id, |r| r.state = TaskState::Failed);
        warn!(task_id = %id, kind = ?failure.kind, attempts = failure.attempts, "Task failed");
        self.events.append(Event::TaskFailed {
            task_id: id,
            kind: failure.kind,
            attempts: failure.attempts,
        });
        failure
    }

    /// Claim an agent for the task, waiting while every capable agent is busy
    ///
    /// Fails with `NoCapableAgent` only when no registered agent outside
    /// `excluded` has the capabilities at all.
    async fn dispatch(&self, task_id: TaskId, spec: &TaskSpec, excluded: &[AgentId]) -> Result<AgentHandle> {
        loop {
            let freed = self.agents.freed();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Some(agent) = self.agents.claim(&spec.capabilities, excluded, task_id) {
                self.update_task(&task_id, |r| {
                    r.state = TaskState::Running;
                    r.agent = Some(agent.id());
                });
                return Ok(agent);
            }
            if !self.agents.any_capable(&spec.capabilities, excluded) {
                return Err(ConclaveError::NoCapableAgent(spec.capabilities.clone()));
            }

            self.update_task(&task_id, |r| r.state = TaskState::Queued);
            debug!(capabilities = ?spec.capabilities, "Every capable agent is busy, waiting");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ConclaveError::Cancelled),
                _ = &mut freed => {}
            }
        }
    }

    /// Dispatch a queued task and run it to completion
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn execute<H>(&self, task_id: TaskId, handler: H) -> std::result::Result<Value, ExecutionFailure>
    where
        H: TaskHandler + 'static,
    {
        let spec = {
            let mut tasks = self.tasks.write();
            let record = tasks
                .get_mut(&task_id)
                .ok_or_else(|| ExecutionFailure::from_error(ConclaveError::TaskNotFound(task_id), 0))?;
            if record.state != TaskState::Queued || record.claimed {
                return Err(ExecutionFailure::from_error(
                    ConclaveError::InvalidArgument(format!("task {task_id} is not queued")),
                    0,
                ));
            }
            record.claimed = true;
            record.spec.clone()
        };

        let handler = Arc::new(handler);
        let mut excluded: Vec<AgentId> = Vec::new();
        let mut attempts = 0;

        loop {
            let agent = match self.dispatch(task_id, &spec, &excluded).await {
                Ok(agent) => agent,
                Err(err) => {
                    return Err(self.fail_task(task_id, ExecutionFailure::from_error(err, attempts)));
                }
            };

            info!(agent_id = %agent.id(), "Task dispatched");
            self.events.append(Event::TaskDispatched {
                task_id,
                agent_id: agent.id(),
            });

            let mut ctx = RunContext::new()
                .on_behalf_of(agent.id())
                .with_timeout(spec.timeout)
                .with_cancel(self.shutdown.child_token());
            if let Some(resource) = &spec.resource {
                ctx = ctx.with_breaker(self.breakers.get_or_create(resource));
            }

            let work = {
                let handler = Arc::clone(&handler);
                let task = TaskContext {
                    task_id,
                    agent_id: agent.id(),
                    priority: spec.priority,
                    payload: spec.payload.clone(),
                };
                move || {
                    let handler = Arc::clone(&handler);
                    let task = task.clone();
                    async move { handler.handle(task).await }
                }
            };

            match self.executor.run_counted::<Value>(&self.config.retry, &work, &ctx).await {
                Ok((value, made)) => {
                    agent.finish_task(true);
                    let total = attempts + made;
                    self.update_task(&task_id, |r| {
                        r.state = TaskState::Succeeded;
                        r.attempts = total;
                    });
                    info!(attempts = total, "Task succeeded");
                    self.events.append(Event::TaskSucceeded {
                        task_id,
                        attempts: total,
                    });
                    return Ok(value);
                }
                Err(mut failure) => {
                    attempts += failure.attempts;
                    self.update_task(&task_id, |r| r.attempts = attempts);

                    let escalated = matches!(
                        failure.kind,
                        ErrorKind::AgentUnresponsive | ErrorKind::DeadlockDetected
                    );
                    if failure.kind == ErrorKind::AgentUnresponsive {
                        agent.set_status(AgentStatus::Unresponsive);
                    }
                    agent.finish_task(false);

                    let requeues = self.tasks.read().get(&task_id).map(|r| r.requeues).unwrap_or(0);
                    if escalated && requeues < self.config.max_requeues {
                        excluded.push(agent.id());
                        self.update_task(&task_id, |r| r.requeues += 1);
                        warn!(from = %agent.id(), reason = ?failure.kind, "Requeueing task on another agent");
                        self.events.append(Event::TaskRequeued {
                            task_id,
                            from: agent.id(),
                            reason: failure.kind,
                        });
                        continue;
                    }

                    failure.attempts = attempts;
                    return Err(self.fail_task(task_id, failure));
                }
            }
        }
    }

    // === Events ===

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Follow the event log from `offset`
    pub fn subscribe_from(&self, offset: u64) -> EventStream {
        self.events.subscribe_from(offset)
    }

    /// Rebuild assignments, lock holders and breaker states from the log
    pub fn replay(&self) -> ReplayState {
        ReplayState::replay(&self.events.records())
    }

    pub fn export_events(&self, path: impl AsRef<Path>) -> Result<()> {
        self.events.write_jsonl(path)
    }

    pub fn import_events(path: impl AsRef<Path>) -> Result<Vec<EventRecord>> {
        EventLog::read_jsonl(path)
    }

    // === Lifecycle ===

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel in-flight work, stop the monitor and end every event stream
    pub fn shutdown(&self) {
        info!("Shutting down coordinator");
        self.shutdown.cancel();
        self.events.close();
    }

    /// Periodically scan heartbeats and break deadlocks until shutdown
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut heartbeats = tokio::time::interval(coordinator.config.detector.heartbeat_interval);
            heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut deadlocks = tokio::time::interval(coordinator.config.detector.deadlock_scan_interval);
            deadlocks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!("Monitor started");
            loop {
                tokio::select! {
                    _ = coordinator.shutdown.cancelled() => break,
                    _ = heartbeats.tick() => {
                        coordinator.scan_heartbeats();
                    }
                    _ = deadlocks.tick() => {
                        coordinator.detect_deadlocks();
                    }
                }
            }
            debug!("Monitor stopped");
        })
    }
}
