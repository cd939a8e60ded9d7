//! Conclave error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AgentId, RoundId, TaskId};

/// Result alias used throughout the crate
pub type Result<T, E = ConclaveError> = std::result::Result<T, E>;

/// Errors that can occur in the coordination runtime
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// A suspended wait reached its deadline
    #[error("Timed out waiting for {0}")]
    TimedOut(String),

    /// Release of a lock the caller does not hold
    #[error("Resource {resource} is not held by agent {agent}")]
    NotHeld { resource: String, agent: AgentId },

    /// Release of more permits than were acquired
    #[error("Agent {agent} released {requested} permit(s) of {semaphore} but holds {held}")]
    OverRelease {
        semaphore: String,
        agent: AgentId,
        requested: u32,
        held: u32,
    },

    /// Barrier failed before every participant arrived
    #[error("Barrier {0} timed out before all participants arrived")]
    BarrierTimeout(String),

    /// Vote on a resolved consensus round
    #[error("Consensus round {0} is closed")]
    RoundClosed(RoundId),

    /// Circuit breaker rejected the call
    #[error("Circuit breaker {0} is open")]
    CircuitOpen(String),

    /// Circuit breaker already has its trial call in flight
    #[error("Circuit breaker {0} is half-open with a trial in flight")]
    CircuitHalfOpenBusy(String),

    /// Primary operation and every fallback failed
    #[error("All fallbacks exhausted")]
    AllFallbacksExhausted,

    /// The agent was chosen as deadlock victim and its wait aborted
    #[error("Deadlock detected, agent {0} aborted")]
    DeadlockDetected(AgentId),

    /// The failure detector classified the agent as unresponsive
    #[error("Agent unresponsive: {0}")]
    AgentUnresponsive(AgentId),

    /// Agent not found
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Named lock, semaphore, barrier or round does not exist
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// No registered agent can take the task right now
    #[error("No available agent with capabilities {0:?}")]
    NoCapableAgent(Vec<String>),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Caller misuse that is not covered by a dedicated variant
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller requested cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConclaveError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::NotHeld { .. } => ErrorKind::NotHeld,
            Self::OverRelease { .. } => ErrorKind::OverRelease,
            Self::BarrierTimeout(_) => ErrorKind::BarrierTimeout,
            Self::RoundClosed(_) => ErrorKind::RoundClosed,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::CircuitHalfOpenBusy(_) => ErrorKind::CircuitHalfOpenBusy,
            Self::AllFallbacksExhausted => ErrorKind::AllFallbacksExhausted,
            Self::DeadlockDetected(_) => ErrorKind::DeadlockDetected,
            Self::AgentUnresponsive(_) => ErrorKind::AgentUnresponsive,
            Self::NoCapableAgent(_) => ErrorKind::NoCapableAgent,
            Self::AgentNotFound(_)
            | Self::UnknownResource(_)
            | Self::TaskNotFound(_)
            | Self::InvalidArgument(_) => ErrorKind::Usage,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Coarse classification used by retry and escalation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TimedOut,
    NotHeld,
    OverRelease,
    BarrierTimeout,
    RoundClosed,
    CircuitOpen,
    CircuitHalfOpenBusy,
    AllFallbacksExhausted,
    DeadlockDetected,
    AgentUnresponsive,
    NoCapableAgent,
    /// Other caller misuse (unknown ids, bad arguments)
    Usage,
    Cancelled,
    Internal,
    /// Opaque failure raised by a unit of work
    Work,
}

impl ErrorKind {
    /// Classify an arbitrary unit-of-work failure
    pub fn classify(err: &anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<ConclaveError>() {
            return e.kind();
        }
        if let Some(f) = err.downcast_ref::<ExecutionFailure>() {
            return f.kind;
        }
        ErrorKind::Work
    }

    /// Caller usage errors: surfaced immediately, never retried
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotHeld | ErrorKind::OverRelease | ErrorKind::RoundClosed | ErrorKind::Usage
        )
    }

    /// Errors eligible for retry and fallback
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::TimedOut
                | ErrorKind::CircuitOpen
                | ErrorKind::CircuitHalfOpenBusy
                | ErrorKind::AgentUnresponsive
                | ErrorKind::NoCapableAgent
                | ErrorKind::Work
        )
    }
}

/// Outcome of one saga compensation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// Name of the step whose compensation ran
    pub step: String,
    /// Whether the compensation succeeded
    pub succeeded: bool,
    /// Failure message when it did not
    pub error: Option<String>,
}

/// Terminal failure of a unit of work run through the executor
#[derive(Debug, Error)]
#[error("{kind:?} after {attempts} attempt(s): {cause}")]
pub struct ExecutionFailure {
    /// Classified kind of the surfaced failure
    pub kind: ErrorKind,
    /// Number of attempts made, fallbacks included
    pub attempts: u32,
    /// The underlying failure (the primary's for exhausted fallback chains)
    pub cause: anyhow::Error,
    /// Compensations that ran, in execution order (sagas only)
    pub compensations: Vec<CompensationRecord>,
}

impl ExecutionFailure {
    pub fn new(kind: ErrorKind, attempts: u32, cause: anyhow::Error) -> Self {
        Self {
            kind,
            attempts,
            cause,
            compensations: Vec::new(),
        }
    }

    /// Build a failure directly from a runtime error
    pub fn from_error(err: ConclaveError, attempts: u32) -> Self {
        Self::new(err.kind(), attempts, err.into())
    }

    /// The runtime error behind this failure, if it was one
    pub fn conclave_error(&self) -> Option<&ConclaveError> {
        self.cause.downcast_ref::<ConclaveError>()
    }
}
