//! Message bus: point-to-point, broadcast and publish/subscribe delivery
//!
//! Each registered agent owns a mailbox guarded by its own mutex. Messages
//! are enqueued at send time and selected at receive time:
//!
//! - **FIFO** messages are never dequeued ahead of an earlier FIFO message
//!   from the same sender.
//! - **Total** messages carry a global sequence number assigned under the
//!   bus-wide ordering gate, and are dequeued in that order everywhere.
//! - **Causal** messages sit in the mailbox's hold buffer until their
//!   predecessor has been delivered to the same mailbox. Held messages that
//!   outlive `causal_hold_timeout` are dropped.
//!
//! Ready messages sit in lanes: one per FIFO sender, one for total order,
//! and one per released causal message. Only lane heads compete, so among
//! them priority decides which goes first, then arrival.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::clock::SharedClock;
use crate::config::BusConfig;
use crate::error::{ConclaveError, Result};
use crate::event::{Event, EventLog};
use crate::message::{DeliveryOrder, Destination, Envelope, Message};
use crate::types::{AgentId, MessageId, Priority};

/// Batch of messages handed out by one receive call
#[derive(Debug)]
pub struct Inbox {
    items: std::vec::IntoIter<Envelope>,
}

impl Inbox {
    fn new(items: Vec<Envelope>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl Iterator for Inbox {
    type Item = Envelope;

    fn next(&mut self) -> Option<Envelope> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl ExactSizeIterator for Inbox {}

/// Bounded set of recently seen message ids, oldest evicted first
struct RecentIds {
    order: VecDeque<MessageId>,
    members: HashSet<MessageId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id is already remembered
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
        true
    }

    fn contains(&self, id: &MessageId) -> bool {
        self.members.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Ready {
    env: Envelope,
    arrival: u64,
}

struct Held {
    env: Envelope,
    since: Instant,
}

/// A queue whose head competes for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    /// FIFO messages from one sender
    Fifo(AgentId),
    /// Total-order messages, in sequence order
    Total,
    /// A single causal message with no ordering constraint left
    Loose(u64),
}

type Head = Reverse<(Priority, u64, Lane)>;

struct MailboxState {
    fifo: HashMap<AgentId, VecDeque<Ready>>,
    total: VecDeque<Ready>,
    loose: HashMap<u64, Envelope>,
    /// Exactly one entry per non-empty lane, keyed by that lane's head
    heads: BinaryHeap<Head>,
    ready: usize,
    /// Causal messages keyed by the predecessor they wait for
    held: HashMap<MessageId, Vec<Held>>,
    seen: RecentIds,
    delivered: RecentIds,
    next_arrival: u64,
}

enum Enqueued {
    Ready,
    Held,
    Duplicate,
}

fn head_of(queue: &VecDeque<Ready>, lane: Lane) -> Option<Head> {
    queue
        .front()
        .map(|next| Reverse((next.env.priority, next.arrival, lane)))
}

impl MailboxState {
    fn new(id_window: usize) -> Self {
        Self {
            fifo: HashMap::new(),
            total: VecDeque::new(),
            loose: HashMap::new(),
            heads: BinaryHeap::new(),
            ready: 0,
            held: HashMap::new(),
            seen: RecentIds::new(id_window),
            delivered: RecentIds::new(id_window),
            next_arrival: 0,
        }
    }

    fn enqueue(&mut self, env: Envelope, now: Instant, force: bool) -> Enqueued {
        let fresh = self.seen.insert(env.id());
        if !fresh && !force {
            return Enqueued::Duplicate;
        }

        if let Some(pred) = env.causal_predecessor {
            if env.order == DeliveryOrder::Causal && !self.delivered.contains(&pred) {
                self.held
                    .entry(pred)
                    .or_default()
                    .push(Held { env, since: now });
                return Enqueued::Held;
            }
        }

        self.push_ready(env);
        Enqueued::Ready
    }

    fn push_ready(&mut self, env: Envelope) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.ready += 1;
        let priority = env.priority;

        match env.order {
            DeliveryOrder::Fifo => {
                let sender = env.sender;
                let queue = self.fifo.entry(sender).or_default();
                if queue.is_empty() {
                    self.heads.push(Reverse((priority, arrival, Lane::Fifo(sender))));
                }
                queue.push_back(Ready { env, arrival });
            }
            DeliveryOrder::Total => {
                if self.total.is_empty() {
                    self.heads.push(Reverse((priority, arrival, Lane::Total)));
                }
                self.total.push_back(Ready { env, arrival });
            }
            DeliveryOrder::Causal => {
                self.loose.insert(arrival, env);
                self.heads.push(Reverse((priority, arrival, Lane::Loose(arrival))));
            }
        }
    }

    /// Remove the most urgent deliverable message and expose its lane's next head
    fn pop(&mut self) -> Option<Envelope> {
        let Reverse((_, _, lane)) = self.heads.pop()?;
        let env = match lane {
            Lane::Fifo(sender) => {
                let queue = self.fifo.get_mut(&sender)?;
                let entry = queue.pop_front()?;
                match head_of(queue, lane) {
                    Some(head) => self.heads.push(head),
                    None => {
                        self.fifo.remove(&sender);
                    }
                }
                entry.env
            }
            Lane::Total => {
                let entry = self.total.pop_front()?;
                if let Some(head) = head_of(&self.total, lane) {
                    self.heads.push(head);
                }
                entry.env
            }
            Lane::Loose(arrival) => self.loose.remove(&arrival)?,
        };
        self.ready -= 1;
        Some(env)
    }

    fn expire_held(&mut self, now: Instant, hold: Duration) -> Vec<MessageId> {
        let mut dropped = Vec::new();
        self.held.retain(|_, waiting| {
            waiting.retain(|h| {
                let keep = now.saturating_duration_since(h.since) <= hold;
                if !keep {
                    dropped.push(h.env.id());
                }
                keep
            });
            !waiting.is_empty()
        });
        dropped
    }

    fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(env) = self.pop() {
            let id = env.id();
            self.delivered.insert(id);
            if let Some(waiting) = self.held.remove(&id) {
                for held in waiting {
                    self.push_ready(held.env);
                }
            }
            out.push(env);
        }
        out
    }

    fn pending(&self) -> usize {
        self.ready + self.held.values().map(Vec::len).sum::<usize>()
    }
}

struct Mailbox {
    state: Mutex<MailboxState>,
    notify: Notify,
}

impl Mailbox {
    fn new(id_window: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState::new(id_window)),
            notify: Notify::new(),
        }
    }
}

/// The message bus
pub struct MessageBus {
    config: BusConfig,
    clock: SharedClock,
    events: EventLog,
    mailboxes: RwLock<HashMap<AgentId, Arc<Mailbox>>>,
    subscriptions: RwLock<HashMap<String, BTreeSet<AgentId>>>,
    /// Next global sequence number for total-order messages
    total_order: Mutex<u64>,
}

impl MessageBus {
    pub fn new(config: BusConfig, clock: SharedClock, events: EventLog) -> Self {
        Self {
            config,
            clock,
            events,
            mailboxes: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            total_order: Mutex::new(0),
        }
    }

    /// Create a mailbox for an agent (no-op if it already has one)
    pub fn register(&self, agent: AgentId) {
        self.mailboxes
            .write()
            .entry(agent)
            .or_insert_with(|| Arc::new(Mailbox::new(self.config.id_window)));
    }

    /// Drop an agent's mailbox and subscriptions
    pub fn deregister(&self, agent: &AgentId) -> bool {
        let removed = self.mailboxes.write().remove(agent);
        let mut subs = self.subscriptions.write();
        for members in subs.values_mut() {
            members.remove(agent);
        }
        subs.retain(|_, members| !members.is_empty());

        match removed {
            Some(mailbox) => {
                mailbox.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, agent: &AgentId) -> bool {
        self.mailboxes.read().contains_key(agent)
    }

    fn mailbox(&self, agent: &AgentId) -> Result<Arc<Mailbox>> {
        self.mailboxes
            .read()
            .get(agent)
            .cloned()
            .ok_or(ConclaveError::AgentNotFound(*agent))
    }

    /// Subscribe an agent to topics
    pub fn subscribe<I, S>(&self, agent: AgentId, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.is_registered(&agent) {
            return Err(ConclaveError::AgentNotFound(agent));
        }
        let mut subs = self.subscriptions.write();
        for topic in topics {
            subs.entry(topic.into()).or_default().insert(agent);
        }
        Ok(())
    }

    /// Remove an agent's subscriptions to topics
    pub fn unsubscribe<I, S>(&self, agent: &AgentId, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subs = self.subscriptions.write();
        for topic in topics {
            let topic = topic.into();
            if let Some(members) = subs.get_mut(&topic) {
                members.remove(agent);
                if members.is_empty() {
                    subs.remove(&topic);
                }
            }
        }
    }

    /// Current subscribers of a topic
    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        self.subscriptions
            .read()
            .get(topic)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    fn recipients(&self, message: &Message) -> Result<Vec<(AgentId, Arc<Mailbox>)>> {
        match &message.destination {
            Destination::Agent(id) => Ok(vec![(*id, self.mailbox(id)?)]),
            Destination::Topic(topic) => {
                let members = self.subscribers(topic);
                let boxes = self.mailboxes.read();
                Ok(members
                    .into_iter()
                    .filter_map(|id| boxes.get(&id).map(|m| (id, Arc::clone(m))))
                    .collect())
            }
            Destination::Broadcast => {
                let boxes = self.mailboxes.read();
                let mut all: Vec<_> = boxes
                    .iter()
                    .filter(|(id, _)| **id != message.sender)
                    .map(|(id, m)| (*id, Arc::clone(m)))
                    .collect();
                all.sort_by_key(|(id, _)| *id);
                Ok(all)
            }
        }
    }

    /// Route a message to its destination
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub fn send(&self, message: Message) -> Result<MessageId> {
        let message = Arc::new(message);
        let recipients = self.recipients(&message)?;
        let id = message.id;

        self.events.append(Event::MessageSent {
            message_id: id,
            sender: message.sender,
            destination: message.destination.clone(),
        });

        if message.order == DeliveryOrder::Total {
            let mut next = self.total_order.lock();
            let seq = *next;
            *next += 1;
            for (agent, mailbox) in &recipients {
                self.enqueue(agent, mailbox, &message, Some(seq), false);
            }
        } else {
            for (agent, mailbox) in &recipients {
                self.enqueue(agent, mailbox, &message, None, false);
            }
        }

        debug!(
            sender = %message.sender,
            recipients = recipients.len(),
            order = ?message.order,
            "Message sent"
        );
        Ok(id)
    }

    /// Send a message to every other registered agent
    pub fn broadcast(&self, message: Message) -> Result<MessageId> {
        if message.destination != Destination::Broadcast {
            return Err(ConclaveError::InvalidArgument(
                "broadcast requires a broadcast destination".into(),
            ));
        }
        self.send(message)
    }

    /// Publish a payload to a topic
    pub fn publish(&self, sender: AgentId, topic: impl Into<String>, payload: Value) -> Result<MessageId> {
        self.send(Message::topic(sender, topic, payload))
    }

    /// Deliver a message to one recipient again, bypassing duplicate suppression
    pub fn resend(&self, message: &Message, recipient: AgentId) -> Result<()> {
        let mailbox = self.mailbox(&recipient)?;
        let message = Arc::new(message.clone());
        if message.order == DeliveryOrder::Total {
            let mut next = self.total_order.lock();
            let seq = *next;
            *next += 1;
            self.enqueue(&recipient, &mailbox, &message, Some(seq), true);
        } else {
            self.enqueue(&recipient, &mailbox, &message, None, true);
        }
        debug!(message_id = %message.id, recipient = %recipient, "Message resent");
        Ok(())
    }

    fn enqueue(
        &self,
        agent: &AgentId,
        mailbox: &Mailbox,
        message: &Arc<Message>,
        total_seq: Option<u64>,
        force: bool,
    ) {
        let env = Envelope {
            message: Arc::clone(message),
            total_seq,
        };
        let outcome = mailbox.state.lock().enqueue(env, self.clock.now(), force);
        match outcome {
            Enqueued::Ready => mailbox.notify.notify_one(),
            Enqueued::Held => {
                debug!(message_id = %message.id, recipient = %agent, "Holding message for its predecessor")
            }
            Enqueued::Duplicate => {
                debug!(message_id = %message.id, recipient = %agent, "Dropping duplicate message")
            }
        }
    }

    fn drain(&self, agent: AgentId, mailbox: &Mailbox) -> Vec<Envelope> {
        let (batch, dropped) = {
            let mut state = mailbox.state.lock();
            let dropped = state.expire_held(self.clock.now(), self.config.causal_hold_timeout);
            (state.drain(), dropped)
        };

        for message_id in dropped {
            warn!(message_id = %message_id, recipient = %agent, "Causal predecessor never arrived, dropping message");
            self.events.append(Event::MessageDropped {
                message_id,
                recipient: agent,
                reason: "causal predecessor not delivered in time".into(),
            });
        }
        for env in &batch {
            self.events.append(Event::MessageDelivered {
                message_id: env.id(),
                recipient: agent,
            });
        }
        batch
    }

    /// Take whatever is deliverable right now
    pub fn try_receive(&self, agent: AgentId) -> Result<Inbox> {
        let mailbox = self.mailbox(&agent)?;
        Ok(Inbox::new(self.drain(agent, &mailbox)))
    }

    /// Wait until at least one message is deliverable or `timeout` elapses
    pub async fn receive(&self, agent: AgentId, timeout: Duration) -> Result<Inbox> {
        let deadline = Instant::now() + timeout;
        loop {
            let mailbox = self.mailbox(&agent)?;
            let batch = self.drain(agent, &mailbox);
            if !batch.is_empty() {
                return Ok(Inbox::new(batch));
            }

            if tokio::time::timeout_at(deadline, mailbox.notify.notified())
                .await
                .is_err()
            {
                let batch = self.drain(agent, &mailbox);
                if batch.is_empty() {
                    return Err(ConclaveError::TimedOut(format!("messages for agent {agent}")));
                }
                return Ok(Inbox::new(batch));
            }
        }
    }

    /// Messages queued or held for an agent
    pub fn pending(&self, agent: &AgentId) -> usize {
        self.mailbox(agent).map(|m| m.state.lock().pending()).unwrap_or(0)
    }
}
