//! Dead letter sink
//!
//! Envelopes that fail to decode are written to the ledger together with the decode
//! error and acknowledged on the bus. They are never reprocessed automatically.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::bus::{Envelope, SignalBus};
use crate::error::{QuorumError, Result};
use crate::ledger::{DeadLetter, Ledger, RetryPolicy};

/// Dead letter statistics
#[derive(Debug, Clone, Default)]
pub struct DeadLetterStats {
    pub entries_recorded: u64,
    pub entries_failed: u64,
    pub by_topic: HashMap<String, u64>,
    pub last_recorded: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

pub struct DeadLetterSink {
    ledger: Arc<dyn Ledger>,
    bus: Arc<dyn SignalBus>,
    retry: RetryPolicy,
    stats: Arc<RwLock<DeadLetterStats>>,
}

impl DeadLetterSink {
    pub fn new(ledger: Arc<dyn Ledger>, bus: Arc<dyn SignalBus>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            bus,
            retry,
            stats: Arc::new(RwLock::new(DeadLetterStats::default())),
        }
    }

    /// Park a malformed delivery and acknowledge it.
    ///
    /// The message is only acknowledged once it is durably recorded; if recording
    /// fails it stays on the bus and will be delivered again.
    pub async fn route(&self, consumer: &str, envelope: &Envelope, cause: &QuorumError) -> Result<()> {
        warn!(
            consumer,
            topic = %envelope.topic,
            producer_id = %envelope.producer_id,
            sequence_id = envelope.sequence_id,
            error = %cause,
            "routing malformed message to dead letters"
        );

        let letter = DeadLetter {
            consumer: consumer.to_string(),
            topic: envelope.topic.name(),
            producer_id: envelope.producer_id.clone(),
            sequence_id: envelope.sequence_id,
            bus_offset: envelope.offset,
            payload: envelope.payload.clone(),
            error: cause.to_string(),
            recorded_at: Utc::now(),
        };

        let ledger = &self.ledger;
        let letter_ref = &letter;
        if let Err(e) = self
            .retry
            .run("record_dead_letter", move || ledger.record_dead_letter(letter_ref))
            .await
        {
            error!(consumer, topic = %envelope.topic, "failed to record dead letter: {}", e);
            let mut stats = self.stats.write().await;
            stats.entries_failed += 1;
            stats.last_error = Some(e.to_string());
            return Err(e);
        }

        self.bus.ack(consumer, envelope).await?;

        let mut stats = self.stats.write().await;
        stats.entries_recorded += 1;
        *stats.by_topic.entry(letter.topic).or_default() += 1;
        stats.last_recorded = Some(letter.recorded_at);
        Ok(())
    }

    /// Get current statistics
    pub async fn get_stats(&self) -> DeadLetterStats {
        self.stats.read().await.clone()
    }
}
