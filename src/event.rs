//! Coordination events and the append-only event log
//!
//! Every component records what it does as an [`Event`] in a shared
//! [`EventLog`]. The log assigns a monotonically increasing sequence number,
//! keeps every record for replay, and fans new records out over a
//! [`tokio::sync::broadcast`] channel. A subscriber starting from any offset
//! first drains the stored backlog, then follows live records; slow
//! subscribers that lag behind the channel are refilled from the store.

use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::breaker::BreakerState;
use crate::consensus::RoundResult;
use crate::error::{ErrorKind, Result};
use crate::lock::LockMode;
use crate::message::Destination;
use crate::types::{AgentId, AgentStatus, MessageId, Priority, RoundId, TaskId};

/// Something observable that happened in the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AgentRegistered {
        agent_id: AgentId,
        capabilities: Vec<String>,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
    AgentDeregistered {
        agent_id: AgentId,
    },
    MessageSent {
        message_id: MessageId,
        sender: AgentId,
        destination: Destination,
    },
    MessageDelivered {
        message_id: MessageId,
        recipient: AgentId,
    },
    MessageDropped {
        message_id: MessageId,
        recipient: AgentId,
        reason: String,
    },
    LockGranted {
        resource: String,
        agent_id: AgentId,
        mode: LockMode,
    },
    LockUpgraded {
        resource: String,
        agent_id: AgentId,
    },
    LockReleased {
        resource: String,
        agent_id: AgentId,
    },
    PermitsAcquired {
        semaphore: String,
        agent_id: AgentId,
        permits: u32,
    },
    PermitsReleased {
        semaphore: String,
        agent_id: AgentId,
        permits: u32,
    },
    BarrierReleased {
        name: String,
    },
    BarrierFailed {
        name: String,
    },
    ConsensusOpened {
        round_id: RoundId,
        proposal: serde_json::Value,
    },
    ConsensusResolved {
        round_id: RoundId,
        result: RoundResult,
    },
    BreakerStateChanged {
        name: String,
        from: BreakerState,
        to: BreakerState,
    },
    DeadlockDetected {
        cycle: Vec<AgentId>,
        victim: AgentId,
    },
    TaskSubmitted {
        task_id: TaskId,
        priority: Priority,
    },
    TaskDispatched {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskRequeued {
        task_id: TaskId,
        from: AgentId,
        reason: ErrorKind,
    },
    TaskSucceeded {
        task_id: TaskId,
        attempts: u32,
    },
    TaskFailed {
        task_id: TaskId,
        kind: ErrorKind,
        attempts: u32,
    },
}

/// An event with its position in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: Event,
}

struct LogInner {
    records: RwLock<Vec<EventRecord>>,
    tx: Mutex<Option<broadcast::Sender<EventRecord>>>,
}

/// Shared append-only event log
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<LogInner>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

impl EventLog {
    /// Create a log whose live channel buffers `capacity` records
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(LogInner {
                records: RwLock::new(Vec::new()),
                tx: Mutex::new(Some(tx)),
            }),
        }
    }

    /// Append an event, returning its sequence number
    pub fn append(&self, event: Event) -> u64 {
        let mut records = self.inner.records.write();
        let seq = records.len() as u64;
        let record = EventRecord {
            seq,
            at: Utc::now(),
            event,
        };
        trace!(seq, event = ?record.event, "Event recorded");
        if let Some(tx) = self.inner.tx.lock().as_ref() {
            let _ = tx.send(record.clone());
        }
        records.push(record);
        seq
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.inner.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records with `seq >= offset`
    pub fn since(&self, offset: u64) -> Vec<EventRecord> {
        let records = self.inner.records.read();
        let start = (offset as usize).min(records.len());
        records[start..].to_vec()
    }

    /// All stored records
    pub fn records(&self) -> Vec<EventRecord> {
        self.since(0)
    }

    /// End the run: live subscribers finish once they drain the backlog
    pub fn close(&self) {
        self.inner.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    /// Stream records starting at `offset`
    pub fn subscribe_from(&self, offset: u64) -> EventStream {
        let records = self.inner.records.read();
        let rx = self.inner.tx.lock().as_ref().map(|tx| tx.subscribe());
        let start = (offset as usize).min(records.len());
        let backlog: VecDeque<EventRecord> = records[start..].iter().cloned().collect();
        EventStream {
            log: self.clone(),
            backlog,
            rx,
            next_seq: offset,
        }
    }

    /// Write every record as one JSON object per line
    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for record in self.records() {
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    /// Read records written by [`write_jsonl`](Self::write_jsonl)
    pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<EventRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Lazy, restartable sequence of event records
pub struct EventStream {
    log: EventLog,
    backlog: VecDeque<EventRecord>,
    rx: Option<broadcast::Receiver<EventRecord>>,
    next_seq: u64,
}

impl EventStream {
    /// Next record, or `None` once the log is closed and drained
    pub async fn next(&mut self) -> Option<EventRecord> {
        loop {
            if let Some(record) = self.backlog.pop_front() {
                if record.seq < self.next_seq {
                    continue;
                }
                self.next_seq = record.seq + 1;
                return Some(record);
            }

            let Some(rx) = self.rx.as_mut() else {
                return self.refill_or_end();
            };

            match rx.recv().await {
                Ok(record) if record.seq < self.next_seq => continue,
                Ok(record) if record.seq == self.next_seq => {
                    self.next_seq += 1;
                    return Some(record);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.backlog.extend(self.log.since(self.next_seq));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                }
            }
        }
    }

    /// Sequence number the stream will yield next
    pub fn position(&self) -> u64 {
        self.next_seq
    }

    fn refill_or_end(&mut self) -> Option<EventRecord> {
        let mut rest: VecDeque<EventRecord> = self.log.since(self.next_seq).into();
        let record = rest.pop_front()?;
        self.next_seq = record.seq + 1;
        self.backlog = rest;
        Some(record)
    }
}

/// State rebuilt from an event log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayState {
    /// Latest agent each task was dispatched to
    pub assignments: BTreeMap<TaskId, AgentId>,
    /// Current lock holders per resource
    pub lock_holders: BTreeMap<String, BTreeMap<AgentId, LockMode>>,
    /// Last known state per breaker
    pub breakers: BTreeMap<String, BreakerState>,
}

impl ReplayState {
    /// Fold records in sequence order
    pub fn replay(records: &[EventRecord]) -> Self {
        let mut ordered: Vec<&EventRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.seq);

        let mut state = Self::default();
        for record in ordered {
            state.apply(&record.event);
        }
        state
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::TaskDispatched { task_id, agent_id } => {
                self.assignments.insert(*task_id, *agent_id);
            }
            Event::LockGranted {
                resource,
                agent_id,
                mode,
            } => {
                self.lock_holders
                    .entry(resource.clone())
                    .or_default()
                    .insert(*agent_id, *mode);
            }
            Event::LockUpgraded { resource, agent_id } => {
                if let Some(mode) = self
                    .lock_holders
                    .get_mut(resource)
                    .and_then(|h| h.get_mut(agent_id))
                {
                    *mode = LockMode::Exclusive;
                }
            }
            Event::LockReleased { resource, agent_id } => {
                if let Some(holders) = self.lock_holders.get_mut(resource) {
                    holders.remove(agent_id);
                    if holders.is_empty() {
                        self.lock_holders.remove(resource);
                    }
                }
            }
            Event::BreakerStateChanged { name, to, .. } => {
                self.breakers.insert(name.clone(), *to);
            }
            _ => {}
        }
    }
}
