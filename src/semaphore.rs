//! Named counting semaphores with FIFO grants
//!
//! Permits are tracked per agent so that releases can be checked against
//! what the agent actually acquired, and so the deadlock detector can see who
//! holds what. Grants and releases are logged while the semaphore's state
//! is locked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::clock::SharedClock;
use crate::detector::{Holding, WaitForEdge};
use crate::error::{ConclaveError, Result};
use crate::event::{Event, EventLog};
use crate::types::AgentId;

struct Waiter {
    ticket: u64,
    agent: AgentId,
    permits: u32,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Debug, Clone, Copy)]
struct Grant {
    permits: u32,
    acquired_at: Instant,
}

struct SemaphoreState {
    total: u32,
    held: u32,
    holders: HashMap<AgentId, Grant>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl SemaphoreState {
    fn fits(&self, permits: u32) -> bool {
        self.held
            .checked_add(permits)
            .is_some_and(|wanted| wanted <= self.total)
    }

    fn grant(&mut self, agent: AgentId, permits: u32, now: Instant) {
        self.held += permits;
        let grant = self.holders.entry(agent).or_insert(Grant {
            permits: 0,
            acquired_at: now,
        });
        grant.permits += permits;
        grant.acquired_at = now;
    }

    fn take_back(&mut self, agent: &AgentId, permits: u32) {
        if let Some(grant) = self.holders.get_mut(agent) {
            let n = permits.min(grant.permits);
            grant.permits -= n;
            self.held -= n;
            if grant.permits == 0 {
                self.holders.remove(agent);
            }
        }
    }

    fn pump(&mut self, now: Instant, name: &str, events: &EventLog) {
        loop {
            let fits = self.queue.front().is_some_and(|w| self.fits(w.permits));
            if !fits {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.grant(waiter.agent, waiter.permits, now);
            if waiter.tx.send(Ok(())).is_err() {
                self.take_back(&waiter.agent, waiter.permits);
                continue;
            }
            debug!(semaphore = name, agent_id = %waiter.agent, permits = waiter.permits, "Permits granted from queue");
            events.append(acquired_event(name, waiter.agent, waiter.permits));
        }
    }
}

fn acquired_event(name: &str, agent: AgentId, permits: u32) -> Event {
    Event::PermitsAcquired {
        semaphore: name.to_string(),
        agent_id: agent,
        permits,
    }
}

fn released_event(name: &str, agent: AgentId, permits: u32) -> Event {
    Event::PermitsReleased {
        semaphore: name.to_string(),
        agent_id: agent,
        permits,
    }
}

struct SemaphoreEntry {
    name: String,
    state: Mutex<SemaphoreState>,
}

struct PendingPermits {
    entry: Arc<SemaphoreEntry>,
    clock: SharedClock,
    events: EventLog,
    ticket: u64,
    agent: AgentId,
    permits: u32,
    rx: oneshot::Receiver<Result<()>>,
    armed: bool,
}

impl PendingPermits {
    fn withdraw(&mut self) -> Option<Result<()>> {
        self.armed = false;
        let mut state = self.entry.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.ticket == self.ticket) {
            state.queue.remove(pos);
            state.pump(self.clock.now(), &self.entry.name, &self.events);
            return None;
        }
        drop(state);
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingPermits {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(Ok(())) = self.withdraw() {
            let mut state = self.entry.state.lock();
            state.take_back(&self.agent, self.permits);
            self.events
                .append(released_event(&self.entry.name, self.agent, self.permits));
            state.pump(self.clock.now(), &self.entry.name, &self.events);
        }
    }
}

/// Registry of named semaphores
pub struct SemaphoreRegistry {
    clock: SharedClock,
    events: EventLog,
    semaphores: RwLock<HashMap<String, Arc<SemaphoreEntry>>>,
}

impl SemaphoreRegistry {
    pub fn new(clock: SharedClock, events: EventLog) -> Self {
        Self {
            clock,
            events,
            semaphores: RwLock::new(HashMap::new()),
        }
    }

    /// Create a semaphore; re-creating with the same total is a no-op
    pub fn create(&self, name: &str, total: u32) -> Result<()> {
        let mut semaphores = self.semaphores.write();
        if let Some(existing) = semaphores.get(name) {
            let current = existing.state.lock().total;
            if current != total {
                return Err(ConclaveError::InvalidArgument(format!(
                    "semaphore {name} already exists with {current} permits"
                )));
            }
            return Ok(());
        }
        semaphores.insert(
            name.to_string(),
            Arc::new(SemaphoreEntry {
                name: name.to_string(),
                state: Mutex::new(SemaphoreState {
                    total,
                    held: 0,
                    holders: HashMap::new(),
                    queue: VecDeque::new(),
                    next_ticket: 0,
                }),
            }),
        );
        info!(semaphore = name, total, "Semaphore created");
        Ok(())
    }

    fn entry(&self, name: &str) -> Result<Arc<SemaphoreEntry>> {
        self.semaphores
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConclaveError::UnknownResource(format!("semaphore {name}")))
    }

    fn validate(state: &SemaphoreState, name: &str, permits: u32) -> Result<()> {
        if permits == 0 {
            return Err(ConclaveError::InvalidArgument("cannot acquire zero permits".into()));
        }
        if permits > state.total {
            return Err(ConclaveError::InvalidArgument(format!(
                "{permits} permits requested from {name} which has {}",
                state.total
            )));
        }
        Ok(())
    }

    /// Acquire without waiting; `Ok(false)` when it would have to queue
    pub fn try_acquire(&self, name: &str, agent: AgentId, permits: u32) -> Result<bool> {
        let entry = self.entry(name)?;
        let mut state = entry.state.lock();
        Self::validate(&state, name, permits)?;
        if state.queue.is_empty() && state.fits(permits) {
            state.grant(agent, permits, self.clock.now());
            self.record_acquire(name, agent, permits);
            return Ok(true);
        }
        Ok(false)
    }

    fn record_acquire(&self, name: &str, agent: AgentId, permits: u32) {
        debug!(semaphore = name, agent_id = %agent, permits, "Permits acquired");
        self.events.append(acquired_event(name, agent, permits));
    }

    /// Acquire `permits`, waiting up to `timeout`
    #[instrument(skip(self), fields(agent_id = %agent))]
    pub async fn acquire(
        &self,
        name: &str,
        agent: AgentId,
        permits: u32,
        timeout: Duration,
    ) -> Result<()> {
        let entry = self.entry(name)?;
        let (ticket, rx) = {
            let mut state = entry.state.lock();
            Self::validate(&state, name, permits)?;
            if state.queue.is_empty() && state.fits(permits) {
                state.grant(agent, permits, self.clock.now());
                self.record_acquire(name, agent, permits);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket,
                agent,
                permits,
                tx,
            });
            (ticket, rx)
        };

        let mut pending = PendingPermits {
            entry,
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
            ticket,
            agent,
            permits,
            rx,
            armed: true,
        };

        match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(result)) => {
                pending.armed = false;
                result
            }
            Ok(Err(_)) => {
                pending.armed = false;
                Err(ConclaveError::Cancelled)
            }
            Err(_) => match pending.withdraw() {
                Some(result) => result,
                None => Err(ConclaveError::TimedOut(format!("{permits} permit(s) of {name}"))),
            },
        }
    }

    /// Give permits back
    pub fn release(&self, name: &str, agent: AgentId, permits: u32) -> Result<()> {
        if permits == 0 {
            return Err(ConclaveError::InvalidArgument("cannot release zero permits".into()));
        }
        let entry = self.entry(name)?;
        let mut state = entry.state.lock();
        let held = state.holders.get(&agent).map(|g| g.permits).unwrap_or(0);
        if permits > held {
            return Err(ConclaveError::OverRelease {
                semaphore: name.to_string(),
                agent,
                requested: permits,
                held,
            });
        }
        state.take_back(&agent, permits);
        self.events.append(released_event(name, agent, permits));
        state.pump(self.clock.now(), name, &self.events);
        drop(state);
        debug!(semaphore = name, agent_id = %agent, permits, "Permits released");
        Ok(())
    }

    /// Fail the agent's pending waits and return all its permits
    pub fn abort(&self, agent: AgentId) -> Vec<String> {
        let entries: Vec<Arc<SemaphoreEntry>> = self.semaphores.read().values().cloned().collect();
        let mut released = Vec::new();

        for entry in entries {
            let mut state = entry.state.lock();
            let mut i = 0;
            while i < state.queue.len() {
                if state.queue[i].agent == agent {
                    if let Some(w) = state.queue.remove(i) {
                        let _ = w.tx.send(Err(ConclaveError::DeadlockDetected(agent)));
                    }
                } else {
                    i += 1;
                }
            }
            let held = state.holders.get(&agent).map(|g| g.permits).unwrap_or(0);
            state.take_back(&agent, held);
            if held > 0 {
                self.events.append(released_event(&entry.name, agent, held));
                released.push(entry.name.clone());
            }
            state.pump(self.clock.now(), &entry.name, &self.events);
        }
        released.sort();
        released
    }

    /// Permits currently handed out
    pub fn held(&self, name: &str) -> Result<u32> {
        Ok(self.entry(name)?.state.lock().held)
    }

    /// Permits currently free
    pub fn available(&self, name: &str) -> Result<u32> {
        let entry = self.entry(name)?;
        let state = entry.state.lock();
        Ok(state.total - state.held)
    }

    /// Permits held by one agent
    pub fn held_by(&self, name: &str, agent: &AgentId) -> Result<u32> {
        let entry = self.entry(name)?;
        let state = entry.state.lock();
        Ok(state.holders.get(agent).map(|g| g.permits).unwrap_or(0))
    }

    /// Queued acquire requests
    pub fn queue_len(&self, name: &str) -> usize {
        self.entry(name)
            .map(|e| e.state.lock().queue.len())
            .unwrap_or(0)
    }

    pub fn holdings(&self) -> Vec<Holding> {
        let entries: Vec<Arc<SemaphoreEntry>> = self.semaphores.read().values().cloned().collect();
        let mut out = Vec::new();
        for entry in entries {
            let state = entry.state.lock();
            for (agent, grant) in &state.holders {
                out.push(Holding {
                    agent: *agent,
                    resource: format!("semaphore:{}", entry.name),
                    acquired_at: grant.acquired_at,
                });
            }
        }
        out
    }

    pub fn wait_edges(&self) -> Vec<WaitForEdge> {
        let entries: Vec<Arc<SemaphoreEntry>> = self.semaphores.read().values().cloned().collect();
        let mut edges = Vec::new();
        for entry in entries {
            let state = entry.state.lock();
            for waiter in &state.queue {
                for holder in state.holders.keys().filter(|h| **h != waiter.agent) {
                    edges.push(WaitForEdge {
                        waiter: waiter.agent,
                        holder: *holder,
                        resource: format!("semaphore:{}", entry.name),
                    });
                }
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    const LONG: Duration = Duration::from_secs(60);

    fn registry(total: u32) -> SemaphoreRegistry {
        let sems = SemaphoreRegistry::new(SystemClock::shared(), EventLog::new(64));
        sems.create("gpu", total).unwrap();
        sems
    }

    #[test]
    fn test_acquire_within_capacity() {
        let sems = registry(3);
        let (a, b) = (AgentId::new(), AgentId::new());
        assert!(sems.try_acquire("gpu", a, 2).unwrap());
        assert!(!sems.try_acquire("gpu", b, 2).unwrap());
        assert!(sems.try_acquire("gpu", b, 1).unwrap());
        assert_eq!(sems.held("gpu").unwrap(), 3);
        assert_eq!(sems.available("gpu").unwrap(), 0);
    }

    #[test]
    fn test_over_release() {
        let sems = registry(3);
        let a = AgentId::new();
        sems.try_acquire("gpu", a, 1).unwrap();
        let err = sems.release("gpu", a, 2).unwrap_err();
        assert!(matches!(err, ConclaveError::OverRelease { held: 1, requested: 2, .. }));

        let stranger = AgentId::new();
        assert!(matches!(
            sems.release("gpu", stranger, 1),
            Err(ConclaveError::OverRelease { held: 0, .. })
        ));
    }

    #[test]
    fn test_zero_release_rejected() {
        let events = EventLog::new(64);
        let sems = SemaphoreRegistry::new(SystemClock::shared(), events.clone());
        sems.create("gpu", u32::MAX).unwrap();
        let logged = events.records().len();

        assert!(matches!(
            sems.release("gpu", AgentId::new(), 0),
            Err(ConclaveError::InvalidArgument(_))
        ));
        assert_eq!(events.records().len(), logged);

        let a = AgentId::new();
        assert!(sems.try_acquire("gpu", a, u32::MAX).unwrap());
        assert!(!sems.try_acquire("gpu", AgentId::new(), 1).unwrap());
    }

    #[test]
    fn test_request_larger_than_total_rejected() {
        let sems = registry(2);
        assert!(matches!(
            sems.try_acquire("gpu", AgentId::new(), 3),
            Err(ConclaveError::InvalidArgument(_))
        ));
        assert!(matches!(
            sems.try_acquire("nope", AgentId::new(), 1),
            Err(ConclaveError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn test_fifo_grants_prevent_starvation() {
        let sems = registry(3);
        let (a, big, small) = (AgentId::new(), AgentId::new(), AgentId::new());
        sems.acquire("gpu", a, 2, LONG).await.unwrap();

        let mut big_wait = task::spawn(sems.acquire("gpu", big, 3, LONG));
        assert_pending!(big_wait.poll());

        // One permit is free but the small request must queue behind the big one
        let mut small_wait = task::spawn(sems.acquire("gpu", small, 1, LONG));
        assert_pending!(small_wait.poll());

        sems.release("gpu", a, 2).unwrap();
        assert_ready_ok!(big_wait.poll());
        assert_pending!(small_wait.poll());

        sems.release("gpu", big, 3).unwrap();
        assert_ready_ok!(small_wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_no_queue_entry() {
        let sems = registry(1);
        let (a, b) = (AgentId::new(), AgentId::new());
        sems.acquire("gpu", a, 1, LONG).await.unwrap();

        let err = sems
            .acquire("gpu", b, 1, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::TimedOut(_)));
        assert_eq!(sems.queue_len("gpu"), 0);
        assert_eq!(sems.held("gpu").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abort_returns_permits() {
        let sems = registry(2);
        let (a, b) = (AgentId::new(), AgentId::new());
        sems.acquire("gpu", a, 2, LONG).await.unwrap();

        let mut b_wait = task::spawn(sems.acquire("gpu", b, 1, LONG));
        assert_pending!(b_wait.poll());

        assert_eq!(sems.abort(a), vec!["gpu".to_string()]);
        assert_ready_ok!(b_wait.poll());
        assert_eq!(sems.held_by("gpu", &b).unwrap(), 1);
        assert_eq!(sems.held("gpu").unwrap(), 1);
    }
}
