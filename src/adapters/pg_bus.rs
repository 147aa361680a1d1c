//! Postgres-backed signal bus for multi-process deployments.
//!
//! Messages are appended to `bus_messages`; each subscription runs one poller task per
//! topic filter and delivers rows the consumer has not acknowledged in `bus_offsets`.
//!
//! Offsets come from a sequence and are not commit-ordered across publishers, so the
//! poller keeps no high-water mark. It tracks the offsets it has handed over and not yet
//! seen acknowledged, and asks for everything else that is unacknowledged.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::bus::{Envelope, SignalBus, Subscription, Topic, TopicFilter};
use crate::config::BusConfig;
use crate::error::{QuorumError, Result};

const SELECT_EXACT: &str = r#"
    SELECT offset_id, message_id, topic, producer_id, sequence_id, payload, published_at
    FROM bus_messages m
    WHERE m.topic = $1 AND m.offset_id <> ALL($2)
      AND NOT EXISTS (
          SELECT 1 FROM bus_offsets o WHERE o.consumer = $3 AND o.message_offset = m.offset_id
      )
    ORDER BY m.offset_id ASC
    LIMIT $4
"#;

const SELECT_ALL_SIGNALS: &str = r#"
    SELECT offset_id, message_id, topic, producer_id, sequence_id, payload, published_at
    FROM bus_messages m
    WHERE starts_with(m.topic, 'signals.') AND m.offset_id <> ALL($1)
      AND NOT EXISTS (
          SELECT 1 FROM bus_offsets o WHERE o.consumer = $2 AND o.message_offset = m.offset_id
      )
    ORDER BY m.offset_id ASC
    LIMIT $3
"#;

const SELECT_ACKED: &str = r#"
    SELECT message_offset FROM bus_offsets
    WHERE consumer = $1 AND message_offset = ANY($2)
"#;

#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
    poll_interval: Duration,
    batch_size: i64,
}

impl PgBus {
    pub fn new(pool: PgPool, config: &BusConfig) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            batch_size: config.batch_size.max(1),
        }
    }

    /// Unacknowledged rows for `leaf`, skipping the offsets in `in_flight`
    async fn fetch(&self, leaf: &TopicFilter, consumer: &str, in_flight: &[i64]) -> Result<Vec<PgRow>> {
        let rows = match leaf {
            TopicFilter::Exact(topic) => {
                sqlx::query(SELECT_EXACT)
                    .bind(topic.name())
                    .bind(in_flight)
                    .bind(consumer)
                    .bind(self.batch_size)
                    .fetch_all(&self.pool)
                    .await?
            }
            TopicFilter::AllSignals => {
                sqlx::query(SELECT_ALL_SIGNALS)
                    .bind(in_flight)
                    .bind(consumer)
                    .bind(self.batch_size)
                    .fetch_all(&self.pool)
                    .await?
            }
            TopicFilter::Any(_) => {
                return Err(QuorumError::Internal(
                    "poller expects a flattened topic filter".to_string(),
                ))
            }
        };
        Ok(rows)
    }

    /// The subset of `offsets` the consumer has acknowledged
    async fn acked(&self, consumer: &str, offsets: &[i64]) -> Result<Vec<i64>> {
        let rows = sqlx::query(SELECT_ACKED)
            .bind(consumer)
            .bind(offsets)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("message_offset")).collect())
    }

    fn spawn_poller(&self, consumer: String, leaf: TopicFilter, tx: mpsc::UnboundedSender<Envelope>) {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut in_flight: BTreeSet<i64> = BTreeSet::new();
            let mut interval = tokio::time::interval(bus.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while !tx.is_closed() {
                interval.tick().await;

                if !in_flight.is_empty() {
                    let pending: Vec<i64> = in_flight.iter().copied().collect();
                    match bus.acked(&consumer, &pending).await {
                        Ok(done) => {
                            for offset in done {
                                in_flight.remove(&offset);
                            }
                        }
                        Err(e) => warn!(consumer = %consumer, "bus ack check failed: {}", e),
                    }
                }

                let skip: Vec<i64> = in_flight.iter().copied().collect();
                let rows = match bus.fetch(&leaf, &consumer, &skip).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(consumer = %consumer, "bus poll failed: {}", e);
                        continue;
                    }
                };

                for row in rows {
                    let offset: i64 = row.get("offset_id");
                    in_flight.insert(offset);
                    match envelope_from_row(&row) {
                        Ok(envelope) => {
                            if tx.send(envelope).is_err() {
                                debug!(consumer = %consumer, "subscription dropped, poller exiting");
                                return;
                            }
                        }
                        Err(e) => error!(consumer = %consumer, offset, "unreadable bus row: {}", e),
                    }
                }
            }
        });
    }
}

fn envelope_from_row(row: &PgRow) -> Result<Envelope> {
    let topic: String = row.get("topic");
    Ok(Envelope {
        message_id: row.get("message_id"),
        topic: Topic::parse(&topic)?,
        producer_id: row.get("producer_id"),
        sequence_id: row.get::<i64, _>("sequence_id") as u64,
        published_at: row.get("published_at"),
        payload: row.get("payload"),
        offset: Some(row.get("offset_id")),
    })
}

#[async_trait]
impl SignalBus for PgBus {
    async fn publish(&self, mut envelope: Envelope) -> Result<Envelope> {
        let sequence = i64::try_from(envelope.sequence_id).map_err(|_| {
            QuorumError::Validation(format!("sequence id {} out of range", envelope.sequence_id))
        })?;
        let row = sqlx::query(
            r#"
            INSERT INTO bus_messages (message_id, topic, producer_id, sequence_id, payload, published_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING offset_id
            "#,
        )
        .bind(envelope.message_id)
        .bind(envelope.topic.name())
        .bind(&envelope.producer_id)
        .bind(sequence)
        .bind(&envelope.payload)
        .bind(envelope.published_at)
        .fetch_one(&self.pool)
        .await?;

        envelope.offset = Some(row.get("offset_id"));
        Ok(envelope)
    }

    async fn subscribe(&self, consumer: &str, filter: TopicFilter) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let leaves = filter.leaves();
        for leaf in leaves.iter().cloned() {
            self.spawn_poller(consumer.to_string(), leaf, tx.clone());
        }
        debug!(consumer, pollers = leaves.len(), "subscribed to postgres bus");
        Ok(Subscription::new(consumer, rx))
    }

    async fn ack(&self, consumer: &str, envelope: &Envelope) -> Result<()> {
        let Some(offset) = envelope.offset else {
            return Err(QuorumError::Internal(format!(
                "cannot ack unpublished message {}",
                envelope.message_id
            )));
        };
        sqlx::query(
            r#"
            INSERT INTO bus_offsets (consumer, message_offset) VALUES ($1, $2)
            ON CONFLICT (consumer, message_offset) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(offset)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_sequence(&self, producer_id: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence_id), 0)::BIGINT AS last FROM bus_messages WHERE producer_id = $1",
        )
        .bind(producer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("last") as u64)
    }
}
