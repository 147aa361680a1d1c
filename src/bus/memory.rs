use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use super::envelope::Envelope;
use super::topic::TopicFilter;
use super::{SignalBus, Subscription};
use crate::error::{QuorumError, Result};

struct Subscriber {
    filter: TopicFilter,
    sender: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct BusLog {
    messages: VecDeque<Envelope>,
    next_offset: i64,
    subscribers: HashMap<String, Subscriber>,
    /// Every consumer that ever subscribed, live or not
    filters: HashMap<String, TopicFilter>,
    acked: HashMap<String, HashSet<i64>>,
}

impl BusLog {
    /// Every known consumer has acknowledged `message` or does not take its topic
    fn settled(&self, message: &Envelope) -> bool {
        let Some(offset) = message.offset else {
            return true;
        };
        self.filters.iter().all(|(consumer, filter)| {
            !filter.matches(&message.topic)
                || self
                    .acked
                    .get(consumer)
                    .map_or(false, |acked| acked.contains(&offset))
        })
    }

    /// Drop settled messages from the front until at most `retention` remain
    fn compact(&mut self, retention: usize) -> usize {
        let mut dropped = 0;
        while self.messages.len() > retention {
            match self.messages.front() {
                Some(front) if self.settled(front) => {}
                _ => break,
            }
            if let Some(offset) = self.messages.pop_front().and_then(|m| m.offset) {
                for acked in self.acked.values_mut() {
                    acked.remove(&offset);
                }
            }
            dropped += 1;
        }
        dropped
    }
}

/// In-process bus. Durable for the life of the process: unacknowledged messages are
/// replayed to a consumer that subscribes again.
///
/// Without a retention limit the whole log is kept. With one, the oldest messages are
/// dropped once every consumer that has subscribed is done with them, so the log holds
/// at most `retention` messages plus whatever is still unacknowledged behind the
/// oldest pending one. A consumer that first subscribes after a message was dropped
/// never sees it.
#[derive(Default)]
pub struct InMemoryBus {
    log: Mutex<BusLog>,
    sequences: DashMap<String, u64>,
    retention: Option<usize>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` settled messages
    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: Some(retention),
            ..Self::default()
        }
    }

    fn compact(&self, log: &mut BusLog) {
        if let Some(retention) = self.retention {
            let dropped = log.compact(retention);
            if dropped > 0 {
                trace!(dropped, retained = log.messages.len(), "bus log compacted");
            }
        }
    }

    /// Number of messages currently retained
    pub async fn len(&self) -> usize {
        self.log.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages on topics matching `filter`, in publish order
    pub async fn messages(&self, filter: &TopicFilter) -> Vec<Envelope> {
        self.log
            .lock()
            .await
            .messages
            .iter()
            .filter(|m| filter.matches(&m.topic))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SignalBus for InMemoryBus {
    async fn publish(&self, mut envelope: Envelope) -> Result<Envelope> {
        let mut log = self.log.lock().await;
        log.next_offset += 1;
        let offset = log.next_offset;
        envelope.offset = Some(offset);

        self.sequences
            .entry(envelope.producer_id.clone())
            .and_modify(|s| *s = (*s).max(envelope.sequence_id))
            .or_insert(envelope.sequence_id);

        // Deliver to live subscribers; drop the ones whose receiver is gone
        log.subscribers.retain(|consumer, sub| {
            if !sub.filter.matches(&envelope.topic) {
                return true;
            }
            let alive = sub.sender.send(envelope.clone()).is_ok();
            if !alive {
                debug!(consumer = %consumer, "subscriber went away");
            }
            alive
        });

        trace!(topic = %envelope.topic, offset, producer_id = %envelope.producer_id, "published");
        log.messages.push_back(envelope.clone());
        self.compact(&mut log);
        Ok(envelope)
    }

    async fn subscribe(&self, consumer: &str, filter: TopicFilter) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut log = self.log.lock().await;

        let acked = log.acked.get(consumer).cloned().unwrap_or_default();
        let mut replayed = 0usize;
        for message in log.messages.iter().filter(|m| filter.matches(&m.topic)) {
            if message.offset.map_or(false, |o| acked.contains(&o)) {
                continue;
            }
            if tx.send(message.clone()).is_err() {
                return Err(QuorumError::BusClosed(consumer.to_string()));
            }
            replayed += 1;
        }

        log.filters.insert(consumer.to_string(), filter.clone());
        log.subscribers.insert(
            consumer.to_string(),
            Subscriber {
                filter,
                sender: tx,
            },
        );
        debug!(consumer = %consumer, replayed, "subscribed");
        Ok(Subscription::new(consumer, rx))
    }

    async fn ack(&self, consumer: &str, envelope: &Envelope) -> Result<()> {
        let Some(offset) = envelope.offset else {
            return Err(QuorumError::Internal(format!(
                "cannot ack unpublished message {}",
                envelope.message_id
            )));
        };
        let mut log = self.log.lock().await;
        log.acked
            .entry(consumer.to_string())
            .or_default()
            .insert(offset);
        self.compact(&mut log);
        Ok(())
    }

    async fn last_sequence(&self, producer_id: &str) -> Result<u64> {
        Ok(self.sequences.get(producer_id).map(|s| *s).unwrap_or(0))
    }
}
