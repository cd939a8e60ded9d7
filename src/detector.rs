//! Heartbeat tracking and deadlock detection
//!
//! Liveness classification is advisory: the detector reports agents whose
//! last heartbeat is older than the configured timeout, and callers decide
//! what to do about them. Deadlock detection builds a wait-for graph from
//! the lock and semaphore wait queues, finds cycles with a deterministic
//! depth-first search and aborts one victim per cycle until none remain.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::DetectorConfig;
use crate::event::{Event, EventLog};
use crate::lock::LockManager;
use crate::semaphore::SemaphoreRegistry;
use crate::types::AgentId;

/// `waiter` is queued on `resource`, which `holder` currently holds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitForEdge {
    pub waiter: AgentId,
    pub holder: AgentId,
    pub resource: String,
}

/// One granted lock or permit set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holding {
    pub agent: AgentId,
    pub resource: String,
    pub acquired_at: Instant,
}

/// Heartbeat-based classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Responsive,
    Unresponsive,
    /// No heartbeat yet, still within the timeout counted from registration
    Unknown,
}

/// Picks which member of a deadlock cycle to abort
pub trait VictimSelector: Send + Sync + Debug {
    fn select(&self, cycle: &[AgentId], holdings: &[Holding]) -> AgentId;
}

/// Abort the member that acquired something most recently; ties go to the lowest id
#[derive(Debug, Default, Clone, Copy)]
pub struct MostRecentAcquisition;

impl VictimSelector for MostRecentAcquisition {
    fn select(&self, cycle: &[AgentId], holdings: &[Holding]) -> AgentId {
        let latest = |agent: &AgentId| {
            holdings
                .iter()
                .filter(|h| h.agent == *agent)
                .map(|h| h.acquired_at)
                .max()
        };
        let mut members = cycle.to_vec();
        members.sort();
        members
            .into_iter()
            .map(|a| (latest(&a), a))
            .fold(None, |best: Option<(Option<Instant>, AgentId)>, candidate| match best {
                Some(b) if b.0 >= candidate.0 => Some(b),
                _ => Some(candidate),
            })
            .map(|(_, a)| a)
            .unwrap_or(cycle[0])
    }
}

/// Abort the member holding the fewest resources; ties go to the lowest id
#[derive(Debug, Default, Clone, Copy)]
pub struct FewestHoldings;

impl VictimSelector for FewestHoldings {
    fn select(&self, cycle: &[AgentId], holdings: &[Holding]) -> AgentId {
        cycle
            .iter()
            .copied()
            .min_by_key(|a| (holdings.iter().filter(|h| h.agent == *a).count(), *a))
            .unwrap_or(cycle[0])
    }
}

/// Directed waiter -> holder graph
#[derive(Debug, Default, Clone)]
pub struct WaitForGraph {
    edges: BTreeMap<AgentId, BTreeSet<AgentId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

impl WaitForGraph {
    pub fn from_edges<'a, I>(edges: I) -> Self
    where
        I: IntoIterator<Item = &'a WaitForEdge>,
    {
        let mut graph = Self::default();
        for edge in edges {
            graph.add_edge(edge.waiter, edge.holder);
        }
        graph
    }

    pub fn add_edge(&mut self, waiter: AgentId, holder: AgentId) {
        self.edges.entry(waiter).or_default().insert(holder);
        self.edges.entry(holder).or_default();
    }

    pub fn is_empty(&self) -> bool {
        self.edges.values().all(BTreeSet::is_empty)
    }

    /// First cycle in node order, as the agents along it
    pub fn find_cycle(&self) -> Option<Vec<AgentId>> {
        let mut colour: HashMap<AgentId, Colour> =
            self.edges.keys().map(|a| (*a, Colour::White)).collect();
        let mut path = Vec::new();

        for start in self.edges.keys() {
            if colour[start] == Colour::White {
                if let Some(cycle) = self.visit(*start, &mut colour, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: AgentId,
        colour: &mut HashMap<AgentId, Colour>,
        path: &mut Vec<AgentId>,
    ) -> Option<Vec<AgentId>> {
        colour.insert(node, Colour::Grey);
        path.push(node);

        for next in self.edges.get(&node).into_iter().flatten() {
            match colour.get(next).copied().unwrap_or(Colour::White) {
                Colour::Grey => {
                    let start = path.iter().position(|a| a == next).unwrap_or(0);
                    return Some(path[start..].to_vec());
                }
                Colour::White => {
                    if let Some(cycle) = self.visit(*next, colour, path) {
                        return Some(cycle);
                    }
                }
                Colour::Black => {}
            }
        }

        path.pop();
        colour.insert(node, Colour::Black);
        None
    }
}

/// A resolved deadlock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockReport {
    pub cycle: Vec<AgentId>,
    pub victim: AgentId,
    /// Locks and semaphores the victim gave up
    pub released: Vec<String>,
}

/// Last sign of life: registration until the first heartbeat
#[derive(Debug, Clone, Copy)]
struct Pulse {
    at: Instant,
    heard: bool,
}

/// Heartbeat registry plus deadlock resolver
pub struct FailureDetector {
    config: DetectorConfig,
    clock: SharedClock,
    events: EventLog,
    victims: Arc<dyn VictimSelector>,
    heartbeats: RwLock<HashMap<AgentId, Pulse>>,
}

impl FailureDetector {
    pub fn new(config: DetectorConfig, clock: SharedClock, events: EventLog) -> Self {
        Self::with_victim_selector(config, clock, events, Arc::new(MostRecentAcquisition))
    }

    pub fn with_victim_selector(
        config: DetectorConfig,
        clock: SharedClock,
        events: EventLog,
        victims: Arc<dyn VictimSelector>,
    ) -> Self {
        Self {
            config,
            clock,
            events,
            victims,
            heartbeats: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Start tracking an agent; the heartbeat timeout runs from now
    pub fn track(&self, agent: AgentId) {
        let now = self.clock.now();
        self.heartbeats
            .write()
            .entry(agent)
            .or_insert(Pulse { at: now, heard: false });
    }

    pub fn forget(&self, agent: &AgentId) {
        self.heartbeats.write().remove(agent);
    }

    /// Record a heartbeat at the current instant
    pub fn heartbeat(&self, agent: AgentId) {
        let now = self.clock.now();
        self.heartbeats
            .write()
            .insert(agent, Pulse { at: now, heard: true });
    }

    pub fn last_heartbeat(&self, agent: &AgentId) -> Option<Instant> {
        self.heartbeats
            .read()
            .get(agent)
            .filter(|p| p.heard)
            .map(|p| p.at)
    }

    fn overdue(&self, pulse: &Pulse, now: Instant) -> bool {
        now.saturating_duration_since(pulse.at) > self.config.heartbeat_timeout
    }

    pub fn classify(&self, agent: &AgentId) -> Liveness {
        let Some(pulse) = self.heartbeats.read().get(agent).copied() else {
            return Liveness::Unknown;
        };
        if self.overdue(&pulse, self.clock.now()) {
            Liveness::Unresponsive
        } else if pulse.heard {
            Liveness::Responsive
        } else {
            Liveness::Unknown
        }
    }

    /// Agents whose heartbeat is overdue, sorted by id
    pub fn scan(&self) -> Vec<AgentId> {
        let now = self.clock.now();
        let mut overdue: Vec<AgentId> = self
            .heartbeats
            .read()
            .iter()
            .filter(|(_, pulse)| self.overdue(pulse, now))
            .map(|(agent, _)| *agent)
            .collect();
        overdue.sort();
        overdue
    }

    /// Current wait-for graph over locks and semaphores
    pub fn wait_for_graph(&self, locks: &LockManager, semaphores: &SemaphoreRegistry) -> WaitForGraph {
        let mut edges = locks.wait_edges();
        edges.extend(semaphores.wait_edges());
        WaitForGraph::from_edges(&edges)
    }

    /// Abort one victim per cycle until the graph is acyclic
    pub fn detect_and_resolve(
        &self,
        locks: &LockManager,
        semaphores: &SemaphoreRegistry,
    ) -> Vec<DeadlockReport> {
        let mut reports = Vec::new();

        while let Some(cycle) = self.wait_for_graph(locks, semaphores).find_cycle() {
            let mut holdings = locks.holdings();
            holdings.extend(semaphores.holdings());
            let victim = self.victims.select(&cycle, &holdings);

            let mut released = locks.abort(victim);
            released.extend(semaphores.abort(victim).into_iter().map(|s| format!("semaphore:{s}")));

            warn!(agent_id = %victim, ?cycle, ?released, "Deadlock resolved by aborting victim");
            self.events.append(Event::DeadlockDetected {
                cycle: cycle.clone(),
                victim,
            });
            reports.push(DeadlockReport {
                cycle,
                victim,
                released,
            });
        }

        if reports.is_empty() {
            debug!("No deadlock found");
        }
        reports
    }
}
