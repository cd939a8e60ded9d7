//! Multi-step operations with compensation
//!
//! Steps run in order through the [`ResilienceExecutor`]. When step `k`
//! fails, the compensations of steps `k-1` down to `1` run in strict reverse
//! order. A failing compensation is logged and recorded but does not stop
//! the unwind.

use tracing::{error, info, instrument, warn};

use crate::error::{CompensationRecord, ExecutionFailure};
use crate::executor::{ResilienceExecutor, RunContext, UnitOfWork};
use crate::retry::RetryPolicy;

struct SagaStep {
    name: String,
    forward: Box<dyn UnitOfWork<()>>,
    compensate: Box<dyn UnitOfWork<()>>,
}

/// An ordered list of (forward, compensation) steps
pub struct Saga {
    name: String,
    steps: Vec<SagaStep>,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step<F, C>(mut self, name: impl Into<String>, forward: F, compensate: C) -> Self
    where
        F: UnitOfWork<()> + 'static,
        C: UnitOfWork<()> + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            forward: Box::new(forward),
            compensate: Box::new(compensate),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, unwinding completed ones if any step fails
    ///
    /// Compensations run once each, outside the retry policy, and even when
    /// the context has been cancelled.
    #[instrument(skip_all, fields(saga = %self.name))]
    pub async fn run(
        &self,
        executor: &ResilienceExecutor,
        policy: &RetryPolicy,
        ctx: &RunContext,
    ) -> Result<(), ExecutionFailure> {
        for (index, step) in self.steps.iter().enumerate() {
            let mut failure = match executor.run(policy, step.forward.as_ref(), ctx).await {
                Ok(()) => continue,
                Err(failure) => failure,
            };

            warn!(step = %step.name, kind = ?failure.kind, "Saga step failed, compensating");
            failure.compensations = self.unwind(index).await;
            return Err(failure);
        }

        info!(steps = self.steps.len(), "Saga completed");
        Ok(())
    }

    async fn unwind(&self, failed: usize) -> Vec<CompensationRecord> {
        let mut records = Vec::with_capacity(failed);
        for step in self.steps[..failed].iter().rev() {
            let record = match step.compensate.run().await {
                Ok(()) => CompensationRecord {
                    step: step.name.clone(),
                    succeeded: true,
                    error: None,
                },
                Err(err) => {
                    error!(step = %step.name, error = %err, "Compensation failed");
                    CompensationRecord {
                        step: step.name.clone(),
                        succeeded: false,
                        error: Some(err.to_string()),
                    }
                }
            };
            records.push(record);
        }
        records
    }
}
