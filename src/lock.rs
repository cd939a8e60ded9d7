//! Resource locks with exclusive, shared and upgradeable modes
//!
//! Each resource key has its own state behind its own mutex; the map of keys
//! is only locked to look entries up. Requests are granted in FIFO order: a
//! request is granted on arrival only when it is compatible with the current
//! holders and nobody is queued ahead of it. Waiters park on a oneshot
//! channel; an abandoned wait (timeout or dropped future) removes its own
//! queue entry, or gives back a grant it never observed.
//!
//! Every grant and release is logged while the resource state is locked, so
//! the event log orders them exactly as they happened.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::clock::SharedClock;
use crate::detector::{Holding, WaitForEdge};
use crate::error::{ConclaveError, Result};
use crate::event::{Event, EventLog};
use crate::types::AgentId;

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Sole holder
    Exclusive,
    /// Any number of shared holders
    Shared,
    /// Shared-compatible, at most one at a time, may be promoted to exclusive
    Upgradeable,
}

impl LockMode {
    /// Whether a request in this mode can coexist with a holder in `held`
    pub fn compatible_with(self, held: LockMode) -> bool {
        matches!(
            (self, held),
            (LockMode::Shared, LockMode::Shared)
                | (LockMode::Shared, LockMode::Upgradeable)
                | (LockMode::Upgradeable, LockMode::Shared)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Acquire(LockMode),
    Upgrade,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    mode: LockMode,
    acquired_at: Instant,
}

struct Waiter {
    ticket: u64,
    agent: AgentId,
    request: Request,
    tx: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct LockState {
    holders: HashMap<AgentId, Holder>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

impl LockState {
    fn can_grant(&self, agent: &AgentId, request: Request) -> bool {
        match request {
            Request::Acquire(mode) => self.holders.values().all(|h| mode.compatible_with(h.mode)),
            Request::Upgrade => self.holders.len() == 1 && self.holders.contains_key(agent),
        }
    }

    fn apply(&mut self, agent: AgentId, request: Request, now: Instant) {
        match request {
            Request::Acquire(mode) => {
                self.holders.insert(
                    agent,
                    Holder {
                        mode,
                        acquired_at: now,
                    },
                );
            }
            Request::Upgrade => {
                if let Some(h) = self.holders.get_mut(&agent) {
                    h.mode = LockMode::Exclusive;
                    h.acquired_at = now;
                }
            }
        }
    }

    fn revert(&mut self, agent: &AgentId, request: Request) {
        match request {
            Request::Acquire(_) => {
                self.holders.remove(agent);
            }
            Request::Upgrade => {
                if let Some(h) = self.holders.get_mut(agent) {
                    h.mode = LockMode::Upgradeable;
                }
            }
        }
    }

    /// Grant queued requests from the front while they are compatible
    fn pump(&mut self, now: Instant, resource: &str, events: &EventLog) {
        loop {
            let grantable = match self.queue.front() {
                Some(w) => self.can_grant(&w.agent, w.request),
                None => false,
            };
            if !grantable {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.apply(waiter.agent, waiter.request, now);
            if waiter.tx.send(Ok(())).is_err() {
                self.revert(&waiter.agent, waiter.request);
                continue;
            }
            debug!(resource, agent_id = %waiter.agent, request = ?waiter.request, "Lock granted from queue");
            events.append(grant_event(resource, waiter.agent, waiter.request));
        }
    }

    /// Fail and dequeue the agent's requests that `which` selects
    fn cancel_waits(
        &mut self,
        agent: &AgentId,
        which: impl Fn(Request) -> bool,
        err: impl Fn() -> ConclaveError,
    ) {
        let mut i = 0;
        while i < self.queue.len() {
            if self.queue[i].agent == *agent && which(self.queue[i].request) {
                if let Some(w) = self.queue.remove(i) {
                    let _ = w.tx.send(Err(err()));
                }
            } else {
                i += 1;
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

fn grant_event(resource: &str, agent: AgentId, request: Request) -> Event {
    match request {
        Request::Acquire(mode) => Event::LockGranted {
            resource: resource.to_string(),
            agent_id: agent,
            mode,
        },
        Request::Upgrade => Event::LockUpgraded {
            resource: resource.to_string(),
            agent_id: agent,
        },
    }
}

fn release_event(resource: &str, agent: AgentId) -> Event {
    Event::LockReleased {
        resource: resource.to_string(),
        agent_id: agent,
    }
}

struct LockEntry {
    resource: String,
    state: Mutex<LockState>,
}

type LockTable = Arc<RwLock<HashMap<String, Arc<LockEntry>>>>;

/// Forget an idle entry referenced only by the table and the caller
fn prune(table: &LockTable, entry: &Arc<LockEntry>) {
    let mut locks = table.write();
    let idle = Arc::strong_count(entry) == 2 && entry.state.lock().is_idle();
    if idle {
        locks.remove(&entry.resource);
    }
}

/// Undoes an abandoned wait when the waiting future is dropped
struct PendingLock {
    table: LockTable,
    entry: Arc<LockEntry>,
    clock: SharedClock,
    events: EventLog,
    ticket: u64,
    agent: AgentId,
    request: Request,
    rx: oneshot::Receiver<Result<()>>,
    armed: bool,
}

impl PendingLock {
    /// Withdraw the request; returns the grant result if it raced ahead of us
    fn withdraw(&mut self) -> Option<Result<()>> {
        self.armed = false;
        let mut state = self.entry.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.ticket == self.ticket) {
            state.queue.remove(pos);
            state.pump(self.clock.now(), &self.entry.resource, &self.events);
            return None;
        }
        drop(state);
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(Ok(())) = self.withdraw() {
            let mut state = self.entry.state.lock();
            state.revert(&self.agent, self.request);
            self.events.append(match self.request {
                Request::Acquire(_) => release_event(&self.entry.resource, self.agent),
                Request::Upgrade => grant_event(
                    &self.entry.resource,
                    self.agent,
                    Request::Acquire(LockMode::Upgradeable),
                ),
            });
            state.pump(self.clock.now(), &self.entry.resource, &self.events);
        }
        prune(&self.table, &self.entry);
    }
}

/// Registry of resource locks
pub struct LockManager {
    clock: SharedClock,
    events: EventLog,
    locks: LockTable,
}

impl LockManager {
    pub fn new(clock: SharedClock, events: EventLog) -> Self {
        Self {
            clock,
            events,
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn entry(&self, resource: &str) -> Arc<LockEntry> {
        if let Some(entry) = self.locks.read().get(resource) {
            return Arc::clone(entry);
        }
        let mut locks = self.locks.write();
        Arc::clone(locks.entry(resource.to_string()).or_insert_with(|| {
            Arc::new(LockEntry {
                resource: resource.to_string(),
                state: Mutex::new(LockState::default()),
            })
        }))
    }

    fn existing(&self, resource: &str) -> Option<Arc<LockEntry>> {
        self.locks.read().get(resource).cloned()
    }

    /// Grant immediately if possible, without waiting
    pub fn try_acquire(&self, resource: &str, agent: AgentId, mode: LockMode) -> Result<bool> {
        let entry = self.entry(resource);
        let granted = {
            let mut state = entry.state.lock();
            Self::check_new_request(&state, resource, &agent)?;
            let grantable = state.queue.is_empty() && state.can_grant(&agent, Request::Acquire(mode));
            if grantable {
                state.apply(agent, Request::Acquire(mode), self.clock.now());
                self.record_grant(resource, agent, mode);
            }
            grantable
        };
        if !granted {
            prune(&self.locks, &entry);
        }
        Ok(granted)
    }

    fn check_new_request(state: &LockState, resource: &str, agent: &AgentId) -> Result<()> {
        if state.holders.contains_key(agent) || state.queue.iter().any(|w| w.agent == *agent) {
            return Err(ConclaveError::InvalidArgument(format!(
                "agent {agent} already holds or awaits {resource}"
            )));
        }
        Ok(())
    }

    fn record_grant(&self, resource: &str, agent: AgentId, mode: LockMode) {
        debug!(resource, agent_id = %agent, ?mode, "Lock granted");
        self.events.append(Event::LockGranted {
            resource: resource.to_string(),
            agent_id: agent,
            mode,
        });
    }

    /// Acquire `resource` in `mode`, waiting up to `timeout`
    #[instrument(skip(self), fields(agent_id = %agent))]
    pub async fn acquire(
        &self,
        resource: &str,
        agent: AgentId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        let entry = self.entry(resource);
        let (ticket, rx) = {
            let mut state = entry.state.lock();
            Self::check_new_request(&state, resource, &agent)?;
            if state.queue.is_empty() && state.can_grant(&agent, Request::Acquire(mode)) {
                state.apply(agent, Request::Acquire(mode), self.clock.now());
                self.record_grant(resource, agent, mode);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(Waiter {
                ticket,
                agent,
                request: Request::Acquire(mode),
                tx,
            });
            (ticket, rx)
        };

        debug!(resource, ?mode, "Waiting for lock");
        self.wait(entry, ticket, agent, Request::Acquire(mode), rx, timeout)
            .await
    }

    /// Promote an upgradeable hold to exclusive once other holders leave
    #[instrument(skip(self), fields(agent_id = %agent))]
    pub async fn upgrade(&self, resource: &str, agent: AgentId, timeout: Duration) -> Result<()> {
        let entry = self.existing(resource).ok_or_else(|| ConclaveError::NotHeld {
            resource: resource.to_string(),
            agent,
        })?;
        let (ticket, rx) = {
            let mut state = entry.state.lock();
            match state.holders.get(&agent).map(|h| h.mode) {
                None => {
                    return Err(ConclaveError::NotHeld {
                        resource: resource.to_string(),
                        agent,
                    })
                }
                Some(LockMode::Upgradeable) => {}
                Some(mode) => {
                    return Err(ConclaveError::InvalidArgument(format!(
                        "cannot upgrade a {mode:?} hold on {resource}"
                    )))
                }
            }
            if state.can_grant(&agent, Request::Upgrade) {
                state.apply(agent, Request::Upgrade, self.clock.now());
                debug!(resource, "Lock upgraded");
                self.events.append(grant_event(resource, agent, Request::Upgrade));
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_front(Waiter {
                ticket,
                agent,
                request: Request::Upgrade,
                tx,
            });
            (ticket, rx)
        };

        self.wait(entry, ticket, agent, Request::Upgrade, rx, timeout).await
    }

    async fn wait(
        &self,
        entry: Arc<LockEntry>,
        ticket: u64,
        agent: AgentId,
        request: Request,
        rx: oneshot::Receiver<Result<()>>,
        timeout: Duration,
    ) -> Result<()> {
        let resource = entry.resource.clone();
        let mut pending = PendingLock {
            table: Arc::clone(&self.locks),
            entry,
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
            ticket,
            agent,
            request,
            rx,
            armed: true,
        };

        let result = match tokio::time::timeout(timeout, &mut pending.rx).await {
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
                None => {
                    debug!(resource = %resource, agent_id = %agent, "Lock wait timed out");
                    Err(ConclaveError::TimedOut(format!("lock on {resource}")))
                }
            },
        };
        if result.is_err() {
            prune(&self.locks, &pending.entry);
        }
        result
    }

    /// Release a held lock
    pub fn release(&self, resource: &str, agent: AgentId) -> Result<()> {
        let not_held = || ConclaveError::NotHeld {
            resource: resource.to_string(),
            agent,
        };
        let entry = self.existing(resource).ok_or_else(not_held)?;
        {
            let mut state = entry.state.lock();
            if state.holders.remove(&agent).is_none() {
                return Err(not_held());
            }
            state.cancel_waits(&agent, |r| r == Request::Upgrade, not_held);
            self.events.append(release_event(resource, agent));
            state.pump(self.clock.now(), resource, &self.events);
        }
        debug!(resource, agent_id = %agent, "Lock released");
        prune(&self.locks, &entry);
        Ok(())
    }

    /// Abort an agent: fail its pending waits with `DeadlockDetected` and
    /// release everything it holds. Returns the resources it held.
    pub fn abort(&self, agent: AgentId) -> Vec<String> {
        let entries: Vec<Arc<LockEntry>> = self.locks.read().values().cloned().collect();
        let mut released = Vec::new();

        for entry in entries {
            let mut state = entry.state.lock();
            state.cancel_waits(&agent, |_| true, || ConclaveError::DeadlockDetected(agent));
            if state.holders.remove(&agent).is_some() {
                self.events.append(release_event(&entry.resource, agent));
                released.push(entry.resource.clone());
            }
            state.pump(self.clock.now(), &entry.resource, &self.events);
            drop(state);
            prune(&self.locks, &entry);
        }

        if !released.is_empty() {
            info!(agent_id = %agent, resources = ?released, "Released locks of aborted agent");
        }
        released.sort();
        released
    }

    /// Current holders of a resource
    pub fn holders(&self, resource: &str) -> Vec<(AgentId, LockMode)> {
        let Some(entry) = self.existing(resource) else {
            return Vec::new();
        };
        let state = entry.state.lock();
        let mut holders: Vec<_> = state.holders.iter().map(|(a, h)| (*a, h.mode)).collect();
        holders.sort_by_key(|(a, _)| *a);
        holders
    }

    /// Number of queued requests for a resource
    pub fn queue_len(&self, resource: &str) -> usize {
        self.existing(resource)
            .map(|e| e.state.lock().queue.len())
            .unwrap_or(0)
    }

    /// Every current hold, for deadlock victim selection
    pub fn holdings(&self) -> Vec<Holding> {
        let entries: Vec<Arc<LockEntry>> = self.locks.read().values().cloned().collect();
        let mut out = Vec::new();
        for entry in entries {
            let state = entry.state.lock();
            for (agent, holder) in &state.holders {
                out.push(Holding {
                    agent: *agent,
                    resource: entry.resource.clone(),
                    acquired_at: holder.acquired_at,
                });
            }
        }
        out
    }

    /// Wait-for edges: each queued requester waits on every other holder
    pub fn wait_edges(&self) -> Vec<WaitForEdge> {
        let entries: Vec<Arc<LockEntry>> = self.locks.read().values().cloned().collect();
        let mut edges = Vec::new();
        for entry in entries {
            let state = entry.state.lock();
            for waiter in &state.queue {
                for holder in state.holders.keys().filter(|h| **h != waiter.agent) {
                    edges.push(WaitForEdge {
                        waiter: waiter.agent,
                        holder: *holder,
                        resource: entry.resource.clone(),
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

    fn manager() -> (LockManager, EventLog) {
        let events = EventLog::new(256);
        (LockManager::new(SystemClock::shared(), events.clone()), events)
    }

    // === Compatibility ===

    #[test]
    fn test_mode_compatibility() {
        use LockMode::*;
        assert!(Shared.compatible_with(Shared));
        assert!(Shared.compatible_with(Upgradeable));
        assert!(Upgradeable.compatible_with(Shared));
        assert!(!Upgradeable.compatible_with(Upgradeable));
        assert!(!Exclusive.compatible_with(Shared));
        assert!(!Shared.compatible_with(Exclusive));
    }

    #[test]
    fn test_shared_holders_coexist() {
        let (locks, _) = manager();
        let (a, b, c) = (AgentId::new(), AgentId::new(), AgentId::new());
        assert!(locks.try_acquire("db", a, LockMode::Shared).unwrap());
        assert!(locks.try_acquire("db", b, LockMode::Shared).unwrap());
        assert!(!locks.try_acquire("db", c, LockMode::Exclusive).unwrap());
        assert_eq!(locks.holders("db").len(), 2);
    }

    // === Waiting ===

    #[tokio::test]
    async fn test_exclusive_waits_for_release() {
        let (locks, _) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("db", a, LockMode::Exclusive, LONG).await.unwrap();

        let mut waiting = task::spawn(locks.acquire("db", b, LockMode::Exclusive, LONG));
        assert_pending!(waiting.poll());
        assert_eq!(locks.queue_len("db"), 1);

        locks.release("db", a).unwrap();
        assert!(waiting.is_woken());
        assert_ready_ok!(waiting.poll());
        assert_eq!(locks.holders("db"), vec![(b, LockMode::Exclusive)]);
    }

    #[tokio::test]
    async fn test_queued_exclusive_blocks_later_shared() {
        let (locks, _) = manager();
        let (a, b, c) = (AgentId::new(), AgentId::new(), AgentId::new());
        locks.acquire("db", a, LockMode::Shared, LONG).await.unwrap();

        let mut writer = task::spawn(locks.acquire("db", b, LockMode::Exclusive, LONG));
        assert_pending!(writer.poll());

        assert!(!locks.try_acquire("db", c, LockMode::Shared).unwrap());
        locks.release("db", a).unwrap();
        assert_ready_ok!(writer.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_queue_entry() {
        let (locks, _) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("db", a, LockMode::Exclusive, LONG).await.unwrap();

        let err = locks
            .acquire("db", b, LockMode::Exclusive, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::TimedOut(_)));
        assert_eq!(locks.queue_len("db"), 0);

        locks.release("db", a).unwrap();
        assert!(locks.holders("db").is_empty());
    }

    #[tokio::test]
    async fn test_dropped_wait_leaves_no_trace() {
        let (locks, _) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("db", a, LockMode::Exclusive, LONG).await.unwrap();

        let mut waiting = task::spawn(locks.acquire("db", b, LockMode::Exclusive, LONG));
        assert_pending!(waiting.poll());
        drop(waiting);

        assert_eq!(locks.queue_len("db"), 0);
        locks.release("db", a).unwrap();
        assert!(locks.holders("db").is_empty());
    }

    #[tokio::test]
    async fn test_unobserved_grant_is_logged_before_its_release() {
        let (locks, events) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("db", a, LockMode::Exclusive, LONG).await.unwrap();

        let mut waiting = task::spawn(locks.acquire("db", b, LockMode::Exclusive, LONG));
        assert_pending!(waiting.poll());
        locks.release("db", a).unwrap();
        drop(waiting);

        let records = events.records();
        let b_granted = records
            .iter()
            .position(|r| matches!(r.event, Event::LockGranted { agent_id, .. } if agent_id == b))
            .unwrap();
        let b_released = records
            .iter()
            .position(|r| matches!(r.event, Event::LockReleased { agent_id, .. } if agent_id == b))
            .unwrap();
        assert!(b_granted < b_released);
        assert!(crate::event::ReplayState::replay(&records).lock_holders.is_empty());
        assert!(locks.locks.read().is_empty());
    }

    // === Bookkeeping ===

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_are_forgotten() {
        let (locks, _) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("db", a, LockMode::Exclusive, LONG).await.unwrap();

        let mut waiting = task::spawn(locks.acquire("db", b, LockMode::Shared, LONG));
        assert_pending!(waiting.poll());
        drop(waiting);
        assert!(!locks.try_acquire("db", b, LockMode::Shared).unwrap());
        assert!(locks
            .acquire("db", b, LockMode::Shared, Duration::from_millis(10))
            .await
            .is_err());
        assert_eq!(locks.locks.read().len(), 1);

        assert_eq!(locks.abort(a), vec!["db".to_string()]);
        assert!(locks.locks.read().is_empty());

        locks.try_acquire("cache", a, LockMode::Shared).unwrap();
        locks.release("cache", a).unwrap();
        assert!(locks.locks.read().is_empty());
    }

    // === Upgrade ===

    #[tokio::test]
    async fn test_upgrade_waits_for_shared_holders() {
        let (locks, events) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("cfg", a, LockMode::Upgradeable, LONG).await.unwrap();
        locks.acquire("cfg", b, LockMode::Shared, LONG).await.unwrap();

        let mut upgrade = task::spawn(locks.upgrade("cfg", a, LONG));
        assert_pending!(upgrade.poll());

        locks.release("cfg", b).unwrap();
        assert_ready_ok!(upgrade.poll());
        assert_eq!(locks.holders("cfg"), vec![(a, LockMode::Exclusive)]);
        assert!(events
            .records()
            .iter()
            .any(|r| matches!(r.event, Event::LockUpgraded { agent_id, .. } if agent_id == a)));
    }

    #[tokio::test]
    async fn test_release_fails_own_pending_upgrade() {
        let (locks, _) = manager();
        let (a, b, c) = (AgentId::new(), AgentId::new(), AgentId::new());
        locks.acquire("cfg", a, LockMode::Upgradeable, LONG).await.unwrap();
        locks.acquire("cfg", b, LockMode::Shared, LONG).await.unwrap();

        let mut upgrade = task::spawn(locks.upgrade("cfg", a, LONG));
        assert_pending!(upgrade.poll());
        let mut writer = task::spawn(locks.acquire("cfg", c, LockMode::Exclusive, LONG));
        assert_pending!(writer.poll());

        locks.release("cfg", a).unwrap();
        assert!(matches!(
            upgrade.poll(),
            std::task::Poll::Ready(Err(ConclaveError::NotHeld { .. }))
        ));
        locks.release("cfg", b).unwrap();
        assert_ready_ok!(writer.poll());
        assert_eq!(locks.holders("cfg"), vec![(c, LockMode::Exclusive)]);
    }

    #[tokio::test]
    async fn test_upgrade_requires_upgradeable_hold() {
        let (locks, _) = manager();
        let a = AgentId::new();
        locks.acquire("cfg", a, LockMode::Shared, LONG).await.unwrap();
        let err = locks.upgrade("cfg", a, LONG).await.unwrap_err();
        assert!(matches!(err, ConclaveError::InvalidArgument(_)));

        let err = locks.upgrade("cfg", AgentId::new(), LONG).await.unwrap_err();
        assert!(matches!(err, ConclaveError::NotHeld { .. }));
    }

    // === Release ===

    #[test]
    fn test_release_not_held() {
        let (locks, _) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        assert!(matches!(
            locks.release("db", a),
            Err(ConclaveError::NotHeld { .. })
        ));

        locks.try_acquire("db", a, LockMode::Exclusive).unwrap();
        assert!(matches!(
            locks.release("db", b),
            Err(ConclaveError::NotHeld { .. })
        ));
        locks.release("db", a).unwrap();
        assert!(matches!(
            locks.release("db", a),
            Err(ConclaveError::NotHeld { .. })
        ));
    }

    #[test]
    fn test_double_acquire_is_usage_error() {
        let (locks, _) = manager();
        let a = AgentId::new();
        locks.try_acquire("db", a, LockMode::Shared).unwrap();
        assert!(matches!(
            locks.try_acquire("db", a, LockMode::Shared),
            Err(ConclaveError::InvalidArgument(_))
        ));
    }

    // === Abort ===

    #[tokio::test]
    async fn test_abort_fails_waits_and_releases_holds() {
        let (locks, _) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("x", a, LockMode::Exclusive, LONG).await.unwrap();
        locks.acquire("y", b, LockMode::Exclusive, LONG).await.unwrap();

        let mut a_waits = task::spawn(locks.acquire("y", a, LockMode::Exclusive, LONG));
        assert_pending!(a_waits.poll());

        let released = locks.abort(a);
        assert_eq!(released, vec!["x".to_string()]);
        let result = a_waits.poll();
        assert!(matches!(
            result,
            std::task::Poll::Ready(Err(ConclaveError::DeadlockDetected(id))) if id == a
        ));
        assert!(locks.holders("x").is_empty());
    }

    #[tokio::test]
    async fn test_wait_edges() {
        let (locks, _) = manager();
        let (a, b) = (AgentId::new(), AgentId::new());
        locks.acquire("x", a, LockMode::Exclusive, LONG).await.unwrap();

        let mut waiting = task::spawn(locks.acquire("x", b, LockMode::Shared, LONG));
        assert_pending!(waiting.poll());

        let edges = locks.wait_edges();
        assert_eq!(edges.len(), 1);
        assert_eq!((edges[0].waiter, edges[0].holder), (b, a));
    }
}
