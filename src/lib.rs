//! # Conclave
//!
//! Coordination runtime for groups of autonomous worker agents.
//!
//! Conclave gives agents ordered message delivery, mutual exclusion and
//! capacity limits over shared resources, weighted group decisions, and a
//! fault-recovery layer that retries, isolates and compensates work while
//! watching for silent agents and deadlocks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             COORDINATOR                             │
//! │  submit / execute / status / health / events / replay               │
//! └──────┬──────────────┬───────────────┬───────────────┬───────────────┘
//!        │              │               │               │
//!        ▼              ▼               ▼               ▼
//!  ┌───────────┐ ┌─────────────┐ ┌─────────────┐ ┌──────────────────┐
//!  │Message Bus│ │ Locks       │ │ Consensus   │ │ Resilience       │
//!  │fifo/causal│ │ Semaphores  │ │ Engine      │ │ Executor         │
//!  │/total     │ │ Barriers    │ │             │ │ retry · breaker  │
//!  └───────────┘ └──────┬──────┘ └─────────────┘ │ fallback · saga  │
//!                       │                        └────────┬─────────┘
//!                       ▼                                 ▼
//!                ┌───────────────────────────────────────────────┐
//!                │ Failure Detector (heartbeats, wait-for graph) │
//!                └───────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//!                   Clock · Event Log (append-only, replayable)
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: a registered worker with capability tags, an optional team and self-reported metrics
//! - **Task**: work submitted to the coordinator and dispatched to a capable agent
//! - **Event log**: every state change, sequenced, streamable from any offset
//! - **Escalation**: an unresponsive agent's task moves to another agent

pub mod agent;
pub mod barrier;
pub mod breaker;
pub mod bus;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod event;
pub mod executor;
pub mod health;
pub mod lock;
pub mod message;
pub mod retry;
pub mod saga;
pub mod semaphore;
pub mod types;

pub use agent::{Agent, AgentHandle, AgentMetrics, AgentRegistry, AgentSpec};
pub use barrier::BarrierRegistry;
pub use breaker::{BreakerPermit, BreakerRegistry, BreakerState, CircuitBreaker};
pub use bus::{Inbox, MessageBus};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{BreakerConfig, BusConfig, ConsensusConfig, CoordinatorConfig, DetectorConfig};
pub use consensus::{
    ConsensusEngine, InclusiveTieBreak, RoundResult, StatusQuoTieBreak, Tally, Threshold, TieBreak,
    Vote,
};
pub use coordinator::{Coordinator, TaskContext, TaskHandler, TaskSpec, TaskState, TaskStatus};
pub use detector::{
    DeadlockReport, FailureDetector, FewestHoldings, Liveness, MostRecentAcquisition,
    VictimSelector, WaitForGraph,
};
pub use error::{CompensationRecord, ConclaveError, ErrorKind, ExecutionFailure, Result};
pub use event::{Event, EventLog, EventRecord, EventStream, ReplayState};
pub use executor::{Bulkhead, ResilienceExecutor, RunContext, UnitOfWork};
pub use health::{CheckResult, HealthCheck, HealthSnapshot, HealthTarget};
pub use lock::{LockManager, LockMode};
pub use message::{DeliveryOrder, Destination, Envelope, Message};
pub use retry::{Backoff, Jitter, RetryPolicy};
pub use saga::Saga;
pub use semaphore::SemaphoreRegistry;
pub use types::{AgentId, AgentStatus, MessageId, Priority, RoundId, TaskId};
