//! One-shot barriers
//!
//! A barrier instance releases every waiter at once when the last required
//! participant arrives, and is then destroyed. If any waiter's timeout fires
//! first, every waiter fails with `BarrierTimeout` and the instance is
//! destroyed as well. The same name can be defined again afterwards.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{ConclaveError, Result};
use crate::event::{Event, EventLog};
use crate::types::AgentId;

struct BarrierState {
    required: BTreeSet<AgentId>,
    arrived: BTreeSet<AgentId>,
    waiters: Vec<(AgentId, oneshot::Sender<Result<()>>)>,
    done: bool,
}

struct BarrierInstance {
    name: String,
    state: Mutex<BarrierState>,
}

/// Registry of named barriers
pub struct BarrierRegistry {
    events: EventLog,
    barriers: RwLock<HashMap<String, Arc<BarrierInstance>>>,
}

struct PendingArrival {
    instance: Arc<BarrierInstance>,
    participant: AgentId,
    armed: bool,
}

impl Drop for PendingArrival {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Abandoned wait: withdraw the arrival so nobody sees it
        let mut state = self.instance.state.lock();
        if !state.done {
            state.arrived.remove(&self.participant);
            state.waiters.retain(|(p, _)| *p != self.participant);
        }
    }
}

impl BarrierRegistry {
    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            barriers: RwLock::new(HashMap::new()),
        }
    }

    /// Define the next occurrence of a barrier
    pub fn define<I>(&self, name: &str, participants: I) -> Result<()>
    where
        I: IntoIterator<Item = AgentId>,
    {
        let required: BTreeSet<AgentId> = participants.into_iter().collect();
        if required.is_empty() {
            return Err(ConclaveError::InvalidArgument(format!(
                "barrier {name} needs at least one participant"
            )));
        }

        let mut barriers = self.barriers.write();
        if barriers.contains_key(name) {
            return Err(ConclaveError::InvalidArgument(format!(
                "barrier {name} is still active"
            )));
        }
        barriers.insert(
            name.to_string(),
            Arc::new(BarrierInstance {
                name: name.to_string(),
                state: Mutex::new(BarrierState {
                    required,
                    arrived: BTreeSet::new(),
                    waiters: Vec::new(),
                    done: false,
                }),
            }),
        );
        debug!(barrier = name, "Barrier defined");
        Ok(())
    }

    /// Whether an instance with this name is currently active
    pub fn is_active(&self, name: &str) -> bool {
        self.barriers.read().contains_key(name)
    }

    /// Participants that have arrived so far
    pub fn arrived(&self, name: &str) -> Vec<AgentId> {
        self.barriers
            .read()
            .get(name)
            .map(|b| b.state.lock().arrived.iter().copied().collect())
            .unwrap_or_default()
    }

    fn retire(&self, instance: &Arc<BarrierInstance>) {
        let mut barriers = self.barriers.write();
        if barriers
            .get(&instance.name)
            .is_some_and(|current| Arc::ptr_eq(current, instance))
        {
            barriers.remove(&instance.name);
        }
    }

    /// Arrive and wait for the rest of the participants
    pub async fn arrive(&self, name: &str, participant: AgentId, timeout: Duration) -> Result<()> {
        let instance = self
            .barriers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ConclaveError::UnknownResource(format!("barrier {name}")))?;

        let rx = {
            let mut state = instance.state.lock();
            if state.done {
                return Err(ConclaveError::UnknownResource(format!("barrier {name}")));
            }
            if !state.required.contains(&participant) {
                return Err(ConclaveError::InvalidArgument(format!(
                    "agent {participant} is not a participant of barrier {name}"
                )));
            }
            if !state.arrived.insert(participant) {
                return Err(ConclaveError::InvalidArgument(format!(
                    "agent {participant} already arrived at barrier {name}"
                )));
            }

            if state.arrived == state.required {
                state.done = true;
                for (_, tx) in state.waiters.drain(..) {
                    let _ = tx.send(Ok(()));
                }
                drop(state);
                self.retire(&instance);
                info!(barrier = name, "Barrier released");
                self.events.append(Event::BarrierReleased {
                    name: name.to_string(),
                });
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push((participant, tx));
            rx
        };

        debug!(barrier = name, agent_id = %participant, "Waiting at barrier");
        let mut pending = PendingArrival {
            instance: Arc::clone(&instance),
            participant,
            armed: true,
        };

        let mut rx = rx;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => {
                pending.armed = false;
                result
            }
            Ok(Err(_)) => {
                pending.armed = false;
                Err(ConclaveError::Cancelled)
            }
            Err(_) => {
                pending.armed = false;
                let mut state = instance.state.lock();
                if state.done {
                    drop(state);
                    return rx
                        .try_recv()
                        .unwrap_or_else(|_| Err(ConclaveError::BarrierTimeout(name.to_string())));
                }
                state.done = true;
                for (p, tx) in state.waiters.drain(..) {
                    if p != participant {
                        let _ = tx.send(Err(ConclaveError::BarrierTimeout(name.to_string())));
                    }
                }
                drop(state);
                self.retire(&instance);
                warn!(barrier = name, "Barrier timed out, failing all waiters");
                self.events.append(Event::BarrierFailed {
                    name: name.to_string(),
                });
                Err(ConclaveError::BarrierTimeout(name.to_string()))
            }
        }
    }
}
