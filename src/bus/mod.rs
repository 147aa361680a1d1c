//! Signal bus: ordered, at-least-once publish/subscribe partitioned by topic.

pub mod dedup;
pub mod envelope;
pub mod inbox;
pub mod memory;
pub mod topic;

pub use dedup::Deduplicator;
pub use envelope::{BusMessage, Envelope, Publisher};
pub use inbox::{Inbox, InboxStats};
pub use memory::InMemoryBus;
pub use topic::{MessagePriority, Topic, TopicFilter};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::Result;

/// Bus contract shared by the in-process and postgres-backed implementations.
///
/// Order within a topic is preserved. Messages not acknowledged by a consumer are
/// delivered again when that consumer subscribes under the same name.
#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Append a message; returns it with its assigned offset
    async fn publish(&self, envelope: Envelope) -> Result<Envelope>;

    /// Start receiving every unacknowledged and future message matching `filter`
    async fn subscribe(&self, consumer: &str, filter: TopicFilter) -> Result<Subscription>;

    /// Mark a delivered message as consumed
    async fn ack(&self, consumer: &str, envelope: &Envelope) -> Result<()>;

    /// Highest sequence id published by `producer_id` (0 if none)
    async fn last_sequence(&self, producer_id: &str) -> Result<u64>;
}

/// A single-consumer stream of deliveries
pub struct Subscription {
    consumer: String,
    receiver: mpsc::UnboundedReceiver<Envelope>,
    closed: bool,
}

impl Subscription {
    pub fn new(consumer: impl Into<String>, receiver: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            consumer: consumer.into(),
            receiver,
            closed: false,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Wait for the next delivery; `None` once the bus side is gone
    pub async fn recv(&mut self) -> Option<Envelope> {
        let next = self.receiver.recv().await;
        if next.is_none() {
            self.closed = true;
        }
        next
    }

    /// Non-blocking receive of an already delivered message
    pub fn try_recv(&mut self) -> Option<Envelope> {
        match self.receiver.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
