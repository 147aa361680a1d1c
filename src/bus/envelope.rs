use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::topic::Topic;
use super::SignalBus;
use crate::domain::{Allocation, Intervention, Recovery, RiskReport, Signal, Transaction};
use crate::error::{QuorumError, Result};

/// A message as carried by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub topic: Topic,
    pub producer_id: String,
    /// Per-producer monotonically increasing counter
    pub sequence_id: u64,
    pub published_at: DateTime<Utc>,
    pub payload: Value,
    /// Position in the bus log, assigned on publish
    #[serde(default)]
    pub offset: Option<i64>,
}

impl Envelope {
    pub fn new(topic: Topic, producer_id: impl Into<String>, sequence_id: u64, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            topic,
            producer_id: producer_id.into(),
            sequence_id,
            published_at: Utc::now(),
            payload,
            offset: None,
        }
    }

    /// Decode the payload according to the topic
    pub fn decode(&self) -> Result<BusMessage> {
        match &self.topic {
            Topic::Signals(topic_producer) => {
                let signal: Signal = self.payload_as()?;
                if &signal.producer_id != topic_producer {
                    return Err(self.malformed(format!(
                        "signal producer {} published on topic of {}",
                        signal.producer_id, topic_producer
                    )));
                }
                if signal.sequence_id != self.sequence_id {
                    return Err(self.malformed(format!(
                        "signal sequence {} disagrees with envelope sequence {}",
                        signal.sequence_id, self.sequence_id
                    )));
                }
                signal.validate().map_err(|e| self.malformed(e.to_string()))?;
                Ok(BusMessage::Signal(signal))
            }
            Topic::Allocations => {
                let allocation: Allocation = self.payload_as()?;
                allocation
                    .validate()
                    .map_err(|e| self.malformed(e.to_string()))?;
                Ok(BusMessage::Allocation(allocation))
            }
            Topic::Transactions => Ok(BusMessage::Transaction(self.payload_as()?)),
            Topic::RiskIntervention => Ok(BusMessage::Intervention(self.payload_as()?)),
            Topic::RiskRecovery => Ok(BusMessage::Recovery(self.payload_as()?)),
            Topic::RiskReport => Ok(BusMessage::RiskReport(self.payload_as()?)),
        }
    }

    fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| self.malformed(e.to_string()))
    }

    fn malformed(&self, reason: String) -> QuorumError {
        QuorumError::MalformedMessage {
            topic: self.topic.name(),
            reason,
        }
    }
}

/// Typed payloads
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Signal(Signal),
    Allocation(Allocation),
    Transaction(Transaction),
    Intervention(Intervention),
    Recovery(Recovery),
    RiskReport(RiskReport),
}

/// Publishes on behalf of one producer, stamping monotonically increasing sequence ids
pub struct Publisher {
    bus: Arc<dyn SignalBus>,
    producer_id: String,
    last_sequence: AtomicU64,
}

impl Publisher {
    /// Seeds the sequence from the bus so a restarted producer never reuses an id
    pub async fn new(bus: Arc<dyn SignalBus>, producer_id: impl Into<String>) -> Result<Self> {
        let producer_id = producer_id.into();
        let last = bus.last_sequence(&producer_id).await?;
        debug!(producer_id = %producer_id, last_sequence = last, "publisher ready");
        Ok(Self {
            bus,
            producer_id,
            last_sequence: AtomicU64::new(last),
        })
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    /// Reserve the next sequence id
    pub fn next_sequence(&self) -> u64 {
        self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn publish<T: Serialize>(&self, topic: Topic, payload: &T) -> Result<Envelope> {
        let sequence = self.next_sequence();
        self.publish_sequenced(topic, sequence, payload).await
    }

    /// Publish with a sequence id obtained from `next_sequence`
    pub async fn publish_sequenced<T: Serialize>(
        &self,
        topic: Topic,
        sequence_id: u64,
        payload: &T,
    ) -> Result<Envelope> {
        let envelope = Envelope::new(
            topic,
            self.producer_id.clone(),
            sequence_id,
            serde_json::to_value(payload)?,
        );
        self.bus.publish(envelope).await
    }
}
