//! Retry, fallback and isolation around units of work
//!
//! Every attempt is layered as bulkhead, then breaker, then timeout, then
//! the work itself. Between attempts the executor consults the failure
//! detector: once the agent the work runs for is classified unresponsive,
//! retrying stops and the failure escalates as `AgentUnresponsive`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::breaker::CircuitBreaker;
use crate::detector::{FailureDetector, Liveness};
use crate::error::{ConclaveError, ErrorKind, ExecutionFailure};
use crate::retry::RetryPolicy;
use crate::types::AgentId;

/// An async operation that can be run more than once
#[async_trait]
pub trait UnitOfWork<T: Send>: Send + Sync {
    async fn run(&self) -> anyhow::Result<T>;
}

#[async_trait]
impl<T, F, Fut> UnitOfWork<T> for F
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<T> {
        (self)().await
    }
}

/// Bounded-concurrency partition
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    acquire_timeout: Duration,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, max_concurrent: usize, acquire_timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            acquire_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `work` in a slot, waiting at most the acquire timeout for one
    pub async fn run<Fut, T>(&self, work: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _slot = match tokio::time::timeout(self.acquire_timeout, self.permits.acquire()).await {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => return Err(ConclaveError::Cancelled.into()),
            Err(_) => {
                debug!(bulkhead = %self.name, "Bulkhead full");
                return Err(ConclaveError::TimedOut(format!("slot in bulkhead {}", self.name)).into());
            }
        };
        work.await
    }
}

/// Per-run settings
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Agent the work runs on behalf of
    pub agent: Option<AgentId>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub bulkhead: Option<Arc<Bulkhead>>,
    /// Limit for each individual attempt
    pub attempt_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_behalf_of(mut self, agent: AgentId) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: Arc<Bulkhead>) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Runs units of work with retries and fallbacks
#[derive(Clone, Default)]
pub struct ResilienceExecutor {
    detector: Option<Arc<FailureDetector>>,
}

fn cancelled(attempts: u32) -> ExecutionFailure {
    ExecutionFailure::from_error(ConclaveError::Cancelled, attempts)
}

async fn timed<T: Send + 'static>(
    work: &dyn UnitOfWork<T>,
    timeout: Option<Duration>,
) -> anyhow::Result<T> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, work.run()).await {
            Ok(result) => result,
            Err(_) => Err(ConclaveError::TimedOut(format!("attempt exceeded {limit:?}")).into()),
        },
        None => work.run().await,
    }
}

async fn guarded<T: Send + 'static>(
    work: &dyn UnitOfWork<T>,
    timeout: Option<Duration>,
    breaker: Option<&CircuitBreaker>,
) -> anyhow::Result<T> {
    match breaker {
        Some(breaker) => breaker.call(|| timed(work, timeout)).await,
        None => timed(work, timeout).await,
    }
}

impl ResilienceExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor that stops retrying for agents the detector reports unresponsive
    pub fn with_detector(detector: Arc<FailureDetector>) -> Self {
        Self {
            detector: Some(detector),
        }
    }

    fn unresponsive(&self, ctx: &RunContext) -> Option<AgentId> {
        let agent = ctx.agent?;
        let detector = self.detector.as_ref()?;
        (detector.classify(&agent) == Liveness::Unresponsive).then_some(agent)
    }

    async fn attempt<T: Send + 'static>(
        &self,
        work: &dyn UnitOfWork<T>,
        ctx: &RunContext,
        breaker: Option<&CircuitBreaker>,
    ) -> anyhow::Result<T> {
        let run = async {
            let attempt = guarded(work, ctx.attempt_timeout, breaker);
            match &ctx.bulkhead {
                Some(bulkhead) => bulkhead.run(attempt).await,
                None => attempt.await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ConclaveError::Cancelled.into()),
            result = run => result,
        }
    }

    /// Run `work` under `policy`, retrying transient failures
    pub async fn run<T: Send + 'static>(
        &self,
        policy: &RetryPolicy,
        work: &dyn UnitOfWork<T>,
        ctx: &RunContext,
    ) -> Result<T, ExecutionFailure> {
        self.run_counted(policy, work, ctx).await.map(|(value, _)| value)
    }

    /// Like [`run`](Self::run), also reporting how many attempts success took
    #[instrument(skip_all, fields(agent_id = ?ctx.agent))]
    pub async fn run_counted<T: Send + 'static>(
        &self,
        policy: &RetryPolicy,
        work: &dyn UnitOfWork<T>,
        ctx: &RunContext,
    ) -> Result<(T, u32), ExecutionFailure> {
        let budget = policy.attempts();
        let mut attempts = 0;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(cancelled(attempts));
            }
            if let Some(agent) = self.unresponsive(ctx) {
                warn!(agent_id = %agent, attempts, "Agent unresponsive, escalating");
                return Err(ExecutionFailure::from_error(
                    ConclaveError::AgentUnresponsive(agent),
                    attempts,
                ));
            }

            attempts += 1;
            let err = match self.attempt(work, ctx, ctx.breaker.as_deref()).await {
                Ok(value) => {
                    if attempts > 1 {
                        info!(attempts, "Succeeded after retry");
                    }
                    return Ok((value, attempts));
                }
                Err(err) => err,
            };

            let kind = ErrorKind::classify(&err);
            if kind == ErrorKind::Cancelled {
                return Err(cancelled(attempts));
            }
            if !kind.is_transient() {
                debug!(?kind, "Failure is not retryable");
                return Err(ExecutionFailure::new(kind, attempts, err));
            }
            if attempts >= budget {
                warn!(?kind, attempts, error = %err, "Retries exhausted");
                return Err(ExecutionFailure::new(kind, attempts, err));
            }

            let delay = policy.delay(attempts - 1);
            debug!(attempt = attempts, ?delay, error = %err, "Retrying after failure");
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(cancelled(attempts)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run `primary` under `policy`, then each fallback once until one succeeds
    ///
    /// Fallbacks bypass the context's breaker, which guards the primary path.
    /// When every alternative fails the result is `AllFallbacksExhausted`
    /// carrying the primary's failure as its cause.
    pub async fn run_with_fallbacks<T: Send + 'static>(
        &self,
        policy: &RetryPolicy,
        primary: &dyn UnitOfWork<T>,
        fallbacks: &[&dyn UnitOfWork<T>],
        ctx: &RunContext,
    ) -> Result<T, ExecutionFailure> {
        let primary_failure = match self.run(policy, primary, ctx).await {
            Ok(value) => return Ok(value),
            Err(failure) => failure,
        };
        if fallbacks.is_empty()
            || primary_failure.kind == ErrorKind::Cancelled
            || primary_failure.kind.is_usage()
        {
            return Err(primary_failure);
        }

        let mut attempts = primary_failure.attempts;
        for (index, fallback) in fallbacks.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(cancelled(attempts));
            }
            attempts += 1;
            match self.attempt(*fallback, ctx, None).await {
                Ok(value) => {
                    info!(fallback = index, "Fallback succeeded");
                    return Ok(value);
                }
                Err(err) => {
                    if ErrorKind::classify(&err) == ErrorKind::Cancelled {
                        return Err(cancelled(attempts));
                    }
                    debug!(fallback = index, error = %err, "Fallback failed");
                }
            }
        }

        warn!(attempts, "All fallbacks exhausted");
        Err(ExecutionFailure::new(
            ErrorKind::AllFallbacksExhausted,
            attempts,
            primary_failure.cause,
        ))
    }
}
