//! Circuit breakers
//!
//! Closed breakers count consecutive failures and open at the threshold.
//! Open breakers reject calls without running them until the reopen timeout
//! has elapsed, then admit exactly one trial call. The trial decides: success
//! closes the breaker, failure opens it again with a fresh timer. A trial that
//! is dropped before it finishes frees the slot and leaves the state alone.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::BreakerConfig;
use crate::error::{ConclaveError, Result};
use crate::event::{Event, EventLog};

/// Operational mode of a breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// A named circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    events: EventLog,
    inner: Mutex<BreakerInner>,
}

/// Admission to run one call through a breaker
///
/// Report the outcome with [`succeed`](Self::succeed) or
/// [`fail`](Self::fail). Dropping an unreported trial permit frees the
/// half-open slot.
#[must_use = "report the call outcome through the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
            debug!(breaker = %self.breaker.name, "Trial call abandoned");
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock, events: EventLog) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            events,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state; an open breaker whose timeout elapsed reports half-open
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => warn!(breaker = %self.name, ?from, "Circuit opened"),
            _ => info!(breaker = %self.name, ?from, ?to, "Circuit state changed"),
        }
        self.events.append(Event::BreakerStateChanged {
            name: self.name.clone(),
            from,
            to,
        });
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state == BreakerState::Open {
            let reopen = inner.opened_at.map(|at| at + self.config.reopen_timeout);
            if reopen.is_some_and(|at| self.clock.now() >= at) {
                self.transition(inner, BreakerState::HalfOpen);
            }
        }
    }

    /// Ask to run one call
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => return Err(ConclaveError::CircuitOpen(self.name.clone())),
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(ConclaveError::CircuitHalfOpenBusy(self.name.clone()));
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            self.transition(&mut inner, BreakerState::Closed);
        } else if inner.state == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        if trial {
            inner.trial_in_flight = false;
            inner.opened_at = Some(now);
            self.transition(&mut inner, BreakerState::Open);
        } else if inner.state == BreakerState::Closed {
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.config.failure_threshold {
                inner.opened_at = Some(now);
                self.transition(&mut inner, BreakerState::Open);
            }
        }
    }

    /// Run `op` under the breaker; rejected calls never invoke `op`
    pub async fn call<F, Fut, T>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let permit = self.try_acquire()?;
        let result = op().await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(err) => {
                debug!(breaker = %self.name, error = %err, "Call failed");
                permit.fail();
            }
        }
        result
    }
}

/// Breakers by name, created on first use
pub struct BreakerRegistry {
    config: BreakerConfig,
    clock: SharedClock,
    events: EventLog,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, clock: SharedClock, events: EventLog) -> Self {
        Self {
            config,
            clock,
            events,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// The breaker for `name`, created with the default config if missing
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.get(name) {
            return breaker;
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                name,
                self.config,
                Arc::clone(&self.clock),
                self.events.clone(),
            ))
        }))
    }

    /// Register a breaker with its own config, replacing any existing one
    pub fn insert(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(
            name,
            config,
            Arc::clone(&self.clock),
            self.events.clone(),
        ));
        self.breakers
            .write()
            .insert(name.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Every breaker's current state
    pub fn states(&self) -> BTreeMap<String, BreakerState> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        breakers
            .into_iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }
}
