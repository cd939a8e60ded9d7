//! Bus messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{AgentId, MessageId, Priority};

/// Where a message goes. Exactly one target kind per message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target")]
pub enum Destination {
    /// Point-to-point
    Agent(AgentId),
    /// Every subscriber of the topic
    Topic(String),
    /// Every registered agent except the sender
    Broadcast,
}

/// Ordering guarantee requested for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrder {
    /// Send order per (sender, recipient)
    #[default]
    Fifo,
    /// Never before the causal predecessor at the same recipient
    Causal,
    /// One global order shared by all recipients
    Total,
}

/// An immutable message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: AgentId,
    pub destination: Destination,
    pub payload: Value,
    pub priority: Priority,
    pub order: DeliveryOrder,
    /// Message that must be delivered first (causal order only)
    pub causal_predecessor: Option<MessageId>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn build(sender: AgentId, destination: Destination, payload: Value) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            destination,
            payload,
            priority: Priority::Normal,
            order: DeliveryOrder::Fifo,
            causal_predecessor: None,
            created_at: Utc::now(),
        }
    }

    /// Point-to-point message
    pub fn direct(sender: AgentId, recipient: AgentId, payload: Value) -> Self {
        Self::build(sender, Destination::Agent(recipient), payload)
    }

    /// Message for every subscriber of `topic`
    pub fn topic(sender: AgentId, topic: impl Into<String>, payload: Value) -> Self {
        Self::build(sender, Destination::Topic(topic.into()), payload)
    }

    /// Message for every other registered agent
    pub fn broadcast(sender: AgentId, payload: Value) -> Self {
        Self::build(sender, Destination::Broadcast, payload)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_order(mut self, order: DeliveryOrder) -> Self {
        self.order = order;
        self
    }

    /// Deliver only after `predecessor`; implies causal order
    pub fn after(mut self, predecessor: MessageId) -> Self {
        self.causal_predecessor = Some(predecessor);
        self.order = DeliveryOrder::Causal;
        self
    }
}

/// A message as handed to one recipient
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message: std::sync::Arc<Message>,
    /// Global sequence number, set for total-order messages
    pub total_seq: Option<u64>,
}

impl Envelope {
    pub fn id(&self) -> MessageId {
        self.message.id
    }
}

impl std::ops::Deref for Envelope {
    type Target = Message;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}
