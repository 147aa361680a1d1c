//! Manager agent: collects analyst signals, aggregates them into allocations and
//! learns analyst weights from resolved outcomes.
//!
//! A cycle closes every `aggregation_window_ms`. The window is persisted signal by
//! signal in the ledger, so a restarted manager rebuilds it from the signals not yet
//! assigned to a cycle.

pub mod aggregator;
pub mod outcome;
pub mod weights;
pub mod window;

pub use aggregator::Aggregator;
pub use outcome::OutcomeResolver;
pub use weights::WeightLearner;
pub use window::{Admission, SignalWindow};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::context::AgentContext;
use super::traits::{Agent, AgentRole};
use super::{collect_deliveries, only_fatal, INBOX_CAPACITY};
use crate::adapters::market_data::MarketDataProvider;
use crate::bus::{BusMessage, Deduplicator, Envelope, Inbox, Publisher, Topic, TopicFilter};
use crate::config::{ManagerConfig, QuorumPolicy};
use crate::domain::{
    Allocation, InterventionAction, Signal, SignalKey, TransactionStatus, WeightSet,
};
use crate::error::{QuorumError, Result};
use crate::ledger::{CycleRecord, CycleStatus};

/// Compare-and-swap attempts for one weight update
const WEIGHT_CAS_ATTEMPTS: u32 = 3;

pub struct ManagerAgent {
    id: String,
    config: ManagerConfig,
    aggregator: Aggregator,
    learner: WeightLearner,
    resolver: OutcomeResolver,
    window: SignalWindow,
    dedup: Deduplicator,
    weights: WeightSet,
    known_producers: BTreeSet<String>,
    last_cycle_id: u64,
    intervention: Option<InterventionAction>,
    rejected: BTreeSet<String>,
}

impl ManagerAgent {
    pub fn new(config: ManagerConfig, market: Arc<dyn MarketDataProvider>) -> Self {
        let max_age = chrono::Duration::milliseconds(config.max_signal_age_ms as i64);
        let holding_period = chrono::Duration::milliseconds(config.holding_period_ms as i64);
        Self {
            id: "manager".to_string(),
            aggregator: Aggregator::new(config.max_positions, config.prior_weight),
            learner: WeightLearner::new(config.alpha, config.prior_weight, config.performance_window),
            resolver: OutcomeResolver::new(holding_period, config.hold_band, market),
            window: SignalWindow::new(max_age),
            dedup: Deduplicator::new(config.dedup_capacity),
            weights: WeightSet::default(),
            known_producers: config.producers.iter().cloned().collect(),
            last_cycle_id: 0,
            intervention: None,
            rejected: BTreeSet::new(),
            config,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn weights(&self) -> &WeightSet {
        &self.weights
    }

    pub fn intervention(&self) -> Option<InterventionAction> {
        self.intervention
    }

    pub fn window(&self) -> &SignalWindow {
        &self.window
    }

    pub fn last_cycle_id(&self) -> u64 {
        self.last_cycle_id
    }

    fn subscription_filter(&self) -> TopicFilter {
        let signals = if self.config.producers.is_empty() {
            TopicFilter::AllSignals
        } else {
            TopicFilter::any(
                self.config
                    .producers
                    .iter()
                    .map(|p| TopicFilter::exact(Topic::signals(p.clone()))),
            )
        };
        TopicFilter::any([
            TopicFilter::exact(Topic::RiskIntervention),
            TopicFilter::exact(Topic::RiskRecovery),
            TopicFilter::exact(Topic::Transactions),
            signals,
        ])
    }

    /// Rebuild in-memory state from the ledger
    pub async fn restore(&mut self, ctx: &AgentContext) -> Result<()> {
        let ledger = &ctx.ledger;

        self.last_cycle_id = ctx
            .with_retry("last_cycle_id", move || ledger.last_cycle_id())
            .await?;

        self.weights = ctx.with_retry("load_weights", move || ledger.load_weights()).await?;
        if self.weights.is_empty() && !self.config.producers.is_empty() {
            let initial = WeightSet::from_map(
                weights::equal_weights(&self.config.producers),
                0,
                Utc::now(),
            );
            let initial_ref = &initial;
            match ctx
                .with_retry("save_weights", move || ledger.save_weights(initial_ref))
                .await
            {
                Ok(version) => self.weights = WeightSet { version, ..initial },
                Err(QuorumError::VersionConflict { .. }) => {
                    self.weights = ctx.with_retry("load_weights", move || ledger.load_weights()).await?;
                }
                Err(e) => return Err(e),
            }
        }
        self.known_producers.extend(self.weights.weights.keys().cloned());

        let risk = ctx
            .with_retry("load_risk_state", move || ledger.load_risk_state())
            .await?;
        if risk.threshold_breached {
            let action = risk.breach_action.unwrap_or(InterventionAction::ReduceExposure);
            warn!(agent = %self.id, %action, drawdown = risk.current_drawdown, "risk breach in force at start, withholding allocations");
            self.intervention = Some(action);
        }

        let since = Utc::now() - chrono::Duration::milliseconds(self.config.max_signal_age_ms as i64);
        let pending = ctx
            .with_retry("pending_signals", move || ledger.pending_signals(since))
            .await?;
        let now = Utc::now();
        for signal in pending {
            self.dedup.insert(&signal.key());
            self.known_producers.insert(signal.producer_id.clone());
            self.window.admit(signal, now);
        }

        info!(
            agent = %self.id,
            last_cycle_id = self.last_cycle_id,
            weights_version = self.weights.version,
            open_signals = self.window.len(),
            "manager state restored"
        );
        Ok(())
    }

    /// Act on one decoded message
    pub async fn handle(&mut self, ctx: &AgentContext, message: BusMessage) -> Result<()> {
        match message {
            BusMessage::Signal(signal) => self.on_signal(ctx, signal).await,
            BusMessage::Transaction(tx) => {
                if tx.status == TransactionStatus::Rejected {
                    debug!(
                        agent = %self.id,
                        symbol = %tx.symbol,
                        reason = tx.reason.as_deref().unwrap_or(""),
                        "order rejected, flagged for reconsideration"
                    );
                    self.rejected.insert(tx.symbol);
                }
                Ok(())
            }
            BusMessage::Intervention(intervention) => {
                let action = match self.intervention {
                    Some(current) if current.severity() > intervention.action.severity() => current,
                    _ => intervention.action,
                };
                warn!(
                    agent = %self.id,
                    %action,
                    drawdown = intervention.drawdown,
                    reason = %intervention.reason,
                    "intervention received, withholding allocations"
                );
                self.intervention = Some(action);
                Ok(())
            }
            BusMessage::Recovery(recovery) => {
                if self.intervention.take().is_some() {
                    info!(agent = %self.id, drawdown = recovery.drawdown, "risk recovered, resuming allocations");
                }
                Ok(())
            }
            BusMessage::Allocation(_) | BusMessage::RiskReport(_) => Ok(()),
        }
    }

    async fn on_signal(&mut self, ctx: &AgentContext, signal: Signal) -> Result<()> {
        let key = signal.key();
        if self.dedup.contains(&key) {
            debug!(agent = %self.id, producer_id = %key.producer_id, sequence_id = key.sequence_id, "duplicate signal ignored");
            return Ok(());
        }

        let ledger = &ctx.ledger;
        let signal_ref = &signal;
        let stored = ctx
            .with_retry("record_signal", move || ledger.record_signal(signal_ref))
            .await?;
        self.dedup.insert(&key);
        if !stored {
            debug!(agent = %self.id, producer_id = %key.producer_id, sequence_id = key.sequence_id, "signal already recorded, ignored");
            return Ok(());
        }

        self.known_producers.insert(signal.producer_id.clone());
        let admission = self.window.admit(signal, Utc::now());
        debug!(
            agent = %self.id,
            producer_id = %key.producer_id,
            sequence_id = key.sequence_id,
            ?admission,
            "signal received"
        );
        Ok(())
    }

    /// Close the open window as the next cycle.
    ///
    /// `Ok(None)` when no signals arrived. The cycle is bounded by `cycle_timeout_ms`;
    /// a cycle that overruns is abandoned and recorded as FAILED.
    pub async fn close_cycle(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
    ) -> Result<Option<CycleRecord>> {
        if self.window.is_empty() {
            debug!(agent = %self.id, "no signals in window, nothing to aggregate");
            return Ok(None);
        }

        let closed = self.window.take();
        let cycle_id = self.last_cycle_id + 1;
        let keys = closed.keys();
        let opened_at = closed.opened_at();
        let timeout = self.config.cycle_timeout();

        match tokio::time::timeout(timeout, self.settle_cycle(ctx, publisher, cycle_id, closed)).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                let err = QuorumError::CycleTimeout(format!(
                    "cycle {} exceeded {}ms",
                    cycle_id,
                    timeout.as_millis()
                ));
                error!(agent = %self.id, cycle_id, error = %err, "cycle abandoned");
                self.record_failed_cycle(ctx, cycle_id, opened_at, keys, err.to_string())
                    .await
                    .map(Some)
            }
        }
    }

    async fn settle_cycle(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        cycle_id: u64,
        closed: SignalWindow,
    ) -> Result<CycleRecord> {
        let keys = closed.keys();
        let signals = closed.signals();
        let reported = closed.producers().len();
        let required = self.config.min_quorum;

        let mut record = CycleRecord {
            cycle_id,
            status: CycleStatus::Published,
            producers_reported: reported,
            signal_count: keys.len(),
            allocation_id: None,
            reason: None,
            opened_at: closed.opened_at(),
            closed_at: Utc::now(),
        };

        if let Some(action) = self.intervention {
            record.status = CycleStatus::Withheld;
            record.reason = Some(format!("{} intervention in force", action));
            self.commit(ctx, &record, None, &keys).await?;
            info!(agent = %self.id, cycle_id, %action, "allocation withheld");
            return Ok(record);
        }

        let scale = if reported >= required {
            1.0
        } else {
            match self.config.quorum_policy {
                QuorumPolicy::Skip => {
                    let err = QuorumError::QuorumNotMet { reported, required };
                    record.status = CycleStatus::Skipped;
                    record.reason = Some(err.to_string());
                    self.commit(ctx, &record, None, &keys).await?;
                    warn!(agent = %self.id, cycle_id, error = %err, "cycle skipped");
                    return Ok(record);
                }
                QuorumPolicy::Degrade => reported as f64 / required as f64,
            }
        };

        let allocation = self.build_allocation(cycle_id, &signals, reported, scale);
        allocation.validate()?;
        record.allocation_id = Some(allocation.allocation_id);
        self.commit(ctx, &record, Some(&allocation), &keys).await?;
        self.rejected.clear();

        let sequence = publisher.next_sequence();
        let allocation_ref = &allocation;
        ctx.with_retry("publish_allocation", move || {
            publisher.publish_sequenced(Topic::Allocations, sequence, allocation_ref)
        })
        .await?;

        info!(
            agent = %self.id,
            cycle_id,
            allocation_id = %allocation.allocation_id,
            producers = reported,
            signals = keys.len(),
            gross_weight = allocation.gross_weight(),
            confidence = scale,
            "allocation published"
        );
        Ok(record)
    }

    fn build_allocation(&self, cycle_id: u64, signals: &[Signal], reported: usize, scale: f64) -> Allocation {
        let mut allocation = self.aggregator.aggregate(cycle_id, signals, &self.weights, scale);
        let rationale = &mut allocation.rationale;
        rationale.producers_reported = reported;
        rationale.quorum_required = self.config.min_quorum;
        rationale.confidence = scale;
        rationale.rejected_since_last_cycle = self.rejected.iter().cloned().collect();
        if scale < 1.0 {
            rationale.note = Some(format!(
                "degraded: {} of {} required producers reported",
                reported, self.config.min_quorum
            ));
        }
        allocation
    }

    async fn commit(
        &mut self,
        ctx: &AgentContext,
        record: &CycleRecord,
        allocation: Option<&Allocation>,
        keys: &[SignalKey],
    ) -> Result<()> {
        let ledger = &ctx.ledger;
        ctx.with_retry("commit_cycle", move || ledger.commit_cycle(record, allocation, keys))
            .await?;
        self.last_cycle_id = record.cycle_id;
        Ok(())
    }

    async fn record_failed_cycle(
        &mut self,
        ctx: &AgentContext,
        cycle_id: u64,
        opened_at: chrono::DateTime<Utc>,
        keys: Vec<SignalKey>,
        reason: String,
    ) -> Result<CycleRecord> {
        let record = CycleRecord {
            cycle_id,
            status: CycleStatus::Failed,
            producers_reported: 0,
            signal_count: keys.len(),
            allocation_id: None,
            reason: Some(reason),
            opened_at,
            closed_at: Utc::now(),
        };

        let ledger = &ctx.ledger;
        let stored = ctx.with_retry("last_cycle_id", move || ledger.last_cycle_id()).await?;
        if stored >= cycle_id {
            // the commit landed before the deadline; only publishing was cut short
            warn!(agent = %self.id, cycle_id, "cycle committed before timeout, allocation may be unpublished");
            self.last_cycle_id = stored;
            return Ok(record);
        }
        self.commit(ctx, &record, None, &keys).await?;
        Ok(record)
    }

    /// Resolve due outcomes, then recompute and persist the analyst weights
    pub async fn update_weights(&mut self, ctx: &AgentContext) -> Result<WeightSet> {
        let resolved = self.resolver.resolve_due(&ctx.ledger, &ctx.retry).await?;
        let ledger = &ctx.ledger;
        let mut last_conflict = None;

        for attempt in 1..=WEIGHT_CAS_ATTEMPTS {
            let current = ctx.with_retry("load_weights", move || ledger.load_weights()).await?;
            let producers: Vec<String> = self
                .known_producers
                .iter()
                .chain(current.weights.keys())
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if producers.is_empty() {
                self.weights = current;
                return Ok(self.weights.clone());
            }

            let mut history = BTreeMap::new();
            let window = self.learner.window;
            for producer in &producers {
                let records = ctx
                    .with_retry("recent_performance", move || {
                        ledger.recent_performance(producer, window)
                    })
                    .await?;
                history.insert(producer.clone(), records);
            }

            let next = self.learner.update(&current.as_map(), &history, &producers);
            let candidate = WeightSet::from_map(next, current.version, Utc::now());
            let candidate_ref = &candidate;
            match ctx
                .with_retry("save_weights", move || ledger.save_weights(candidate_ref))
                .await
            {
                Ok(version) => {
                    self.weights = WeightSet { version, ..candidate };
                    info!(
                        agent = %self.id,
                        version,
                        resolved = resolved.len(),
                        weights = ?self.weights.as_map(),
                        "analyst weights updated"
                    );
                    return Ok(self.weights.clone());
                }
                Err(e @ QuorumError::VersionConflict { .. }) => {
                    warn!(agent = %self.id, attempt, error = %e, "weight update lost a race, re-reading");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or_else(|| {
            QuorumError::Internal("weight update made no attempt".to_string())
        }))
    }

    /// Decode, handle and acknowledge one delivery
    async fn process(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<()> {
        let message = match envelope.decode() {
            Ok(message) => message,
            Err(e) => return only_fatal(&self.id, "dead_letter", ctx.dead_letter(&envelope, &e).await),
        };

        match self.handle(ctx, message).await {
            Ok(()) => only_fatal(&self.id, "ack", ctx.ack(&envelope).await),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    agent = %self.id,
                    topic = %envelope.topic,
                    producer_id = %envelope.producer_id,
                    sequence_id = envelope.sequence_id,
                    error = %e,
                    "message could not be handled"
                );
                only_fatal(&self.id, "dead_letter", ctx.dead_letter(&envelope, &e).await)
            }
        }
    }
}

#[async_trait]
impl Agent for ManagerAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> AgentRole {
        AgentRole::Manager
    }

    async fn run(mut self, mut ctx: AgentContext) -> Result<()> {
        info!(
            agent = %self.id,
            window_ms = self.config.aggregation_window_ms,
            min_quorum = self.config.min_quorum,
            policy = ?self.config.quorum_policy,
            "manager agent starting"
        );

        self.restore(&ctx).await?;
        let publisher = ctx.publisher().await?;
        let mut subscription = ctx.subscribe(self.subscription_filter()).await?;
        let mut inbox = Inbox::new(INBOX_CAPACITY);

        let window = self.config.aggregation_window();
        let mut cycle_tick = interval_at(Instant::now() + window, window);
        cycle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut weight_tick = interval(self.config.weight_update_interval());
        weight_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                delivery = subscription.recv() => {
                    collect_deliveries(delivery, &mut subscription, &mut inbox)?;
                    while let Some(envelope) = inbox.pop() {
                        self.process(&ctx, envelope).await?;
                    }
                }
                _ = cycle_tick.tick() => {
                    let result = self.close_cycle(&ctx, &publisher).await.map(|_| ());
                    only_fatal(&self.id, "close_cycle", result)?;
                }
                _ = weight_tick.tick() => {
                    let result = self.update_weights(&ctx).await.map(|_| ());
                    only_fatal(&self.id, "update_weights", result)?;
                }
                _ = ctx.shutdown_rx().recv() => {
                    info!(agent = %self.id, "shutting down");
                    break;
                }
            }
        }

        debug!(agent = %self.id, inbox = %inbox.stats(), "manager agent stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::market_data::MockMarketDataProvider;
    use crate::bus::{InMemoryBus, SignalBus};
    use crate::domain::{
        Action, Horizon, Intervention, PerformanceRecord, PortfolioSnapshot, Recovery, RiskState,
        Transaction,
    };
    use crate::ledger::{DeadLetter, InMemoryLedger, Ledger, RetryPolicy};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    struct Harness {
        bus: Arc<InMemoryBus>,
        ledger: Arc<InMemoryLedger>,
        ctx: AgentContext,
        publisher: Publisher,
        _shutdown: broadcast::Sender<()>,
    }

    async fn harness() -> Harness {
        let bus = Arc::new(InMemoryBus::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let (shutdown, rx) = broadcast::channel(1);
        let ctx = AgentContext::new("manager", bus.clone(), ledger.clone(), RetryPolicy::default(), rx);
        let publisher = ctx.publisher().await.unwrap();
        Harness {
            bus,
            ledger,
            ctx,
            publisher,
            _shutdown: shutdown,
        }
    }

    fn config(min_quorum: usize, policy: QuorumPolicy) -> ManagerConfig {
        ManagerConfig {
            min_quorum,
            quorum_policy: policy,
            producers: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        }
    }

    fn manager(config: ManagerConfig) -> ManagerAgent {
        let mut market = MockMarketDataProvider::new();
        market.expect_latest_price().returning(|_| Ok(dec!(110)));
        ManagerAgent::new(config, Arc::new(market))
    }

    fn signal(producer: &str, seq: u64, symbol: &str, action: Action, confidence: f64) -> Signal {
        Signal {
            producer_id: producer.into(),
            symbol: symbol.into(),
            action,
            confidence,
            horizon: Horizon::LongTerm,
            timestamp: Utc::now(),
            sequence_id: seq,
            reference_price: Some(dec!(100)),
            rationale: None,
        }
    }

    #[tokio::test]
    async fn test_restore_seeds_equal_weights() {
        let h = harness().await;
        let mut m = manager(config(3, QuorumPolicy::Skip));
        m.restore(&h.ctx).await.unwrap();
        assert_eq!(m.weights().version, 1);
        assert!((m.weights().sum() - 1.0).abs() < 1e-9);
        assert!((m.weights().get("b").unwrap() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_full_quorum_publishes_allocation() {
        let h = harness().await;
        let mut m = manager(config(3, QuorumPolicy::Skip));
        m.restore(&h.ctx).await.unwrap();

        for (producer, action, confidence) in
            [("a", Action::Buy, 0.8), ("b", Action::Buy, 0.6), ("c", Action::Sell, 0.9)]
        {
            m.handle(&h.ctx, BusMessage::Signal(signal(producer, 1, "X", action, confidence)))
                .await
                .unwrap();
        }
        m.handle(&h.ctx, BusMessage::Signal(signal("a", 2, "Y", Action::Sell, 0.5)))
            .await
            .unwrap();

        let mut sub = h.bus.subscribe("trader", TopicFilter::exact(Topic::Allocations)).await.unwrap();
        let record = m.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Published);
        assert_eq!(record.cycle_id, 1);
        assert_eq!(record.signal_count, 4);

        let allocation = match sub.recv().await.unwrap().decode().unwrap() {
            BusMessage::Allocation(a) => a,
            other => panic!("unexpected {other:?}"),
        };
        assert!((allocation.target_for("X") - 1.0).abs() < 1e-9);
        assert_eq!(allocation.target_for("Y"), 0.0);
        assert_eq!(allocation.rationale.producers_reported, 3);
        assert_eq!(allocation.rationale.confidence, 1.0);
        let stored = h.ledger.latest_allocation().await.unwrap().unwrap();
        assert_eq!(stored.allocation_id, allocation.allocation_id);
        assert!(m.window().is_empty());
    }

    #[tokio::test]
    async fn test_quorum_skip_and_degrade() {
        let h = harness().await;
        let mut skip = manager(config(3, QuorumPolicy::Skip));
        skip.restore(&h.ctx).await.unwrap();
        skip.handle(&h.ctx, BusMessage::Signal(signal("a", 1, "X", Action::Buy, 0.9)))
            .await
            .unwrap();
        let record = skip.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Skipped);
        assert!(record.reason.unwrap().contains("1 of 3"));
        assert!(h.ledger.latest_allocation().await.unwrap().is_none());

        let mut degrade = manager(config(3, QuorumPolicy::Degrade));
        degrade.restore(&h.ctx).await.unwrap();
        assert_eq!(degrade.last_cycle_id(), 1);
        degrade
            .handle(&h.ctx, BusMessage::Signal(signal("a", 2, "X", Action::Buy, 0.9)))
            .await
            .unwrap();
        degrade
            .handle(&h.ctx, BusMessage::Signal(signal("b", 1, "Y", Action::Buy, 0.9)))
            .await
            .unwrap();
        let record = degrade.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Published);
        assert_eq!(record.cycle_id, 2);
        let allocation = h.ledger.latest_allocation().await.unwrap().unwrap();
        assert!((allocation.gross_weight() - 2.0 / 3.0).abs() < 1e-9);
        assert!(allocation.rationale.note.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_signal_not_reaggregated() {
        let h = harness().await;
        let mut m = manager(config(1, QuorumPolicy::Skip));
        m.restore(&h.ctx).await.unwrap();

        let original = signal("a", 7, "X", Action::Buy, 0.9);
        m.handle(&h.ctx, BusMessage::Signal(original.clone())).await.unwrap();
        m.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        let first = h.ledger.latest_allocation().await.unwrap().unwrap();

        // redelivery after the cycle closed
        m.handle(&h.ctx, BusMessage::Signal(original.clone())).await.unwrap();
        assert!(m.window().is_empty());
        assert!(m.close_cycle(&h.ctx, &h.publisher).await.unwrap().is_none());

        // a fresh manager (restart) also ignores it: the ledger already has it
        let mut restarted = manager(config(1, QuorumPolicy::Skip));
        restarted.restore(&h.ctx).await.unwrap();
        restarted.handle(&h.ctx, BusMessage::Signal(original)).await.unwrap();
        assert!(restarted.window().is_empty());
        assert_eq!(h.ledger.latest_allocation().await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_intervention_withholds_until_recovery() {
        let h = harness().await;
        let mut m = manager(config(1, QuorumPolicy::Skip));
        m.restore(&h.ctx).await.unwrap();

        m.handle(
            &h.ctx,
            BusMessage::Intervention(Intervention {
                action: InterventionAction::Halt,
                reason: "drawdown".into(),
                drawdown: 16.0,
                issued_at: Utc::now(),
            }),
        )
        .await
        .unwrap();
        // a later, milder intervention does not downgrade
        m.handle(
            &h.ctx,
            BusMessage::Intervention(Intervention {
                action: InterventionAction::ReduceExposure,
                reason: "drawdown".into(),
                drawdown: 11.0,
                issued_at: Utc::now(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(m.intervention(), Some(InterventionAction::Halt));

        m.handle(&h.ctx, BusMessage::Signal(signal("a", 1, "X", Action::Buy, 0.9)))
            .await
            .unwrap();
        let record = m.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Withheld);
        assert!(h.ledger.latest_allocation().await.unwrap().is_none());

        m.handle(
            &h.ctx,
            BusMessage::Recovery(Recovery {
                drawdown: 5.0,
                issued_at: Utc::now(),
            }),
        )
        .await
        .unwrap();
        m.handle(&h.ctx, BusMessage::Signal(signal("a", 2, "X", Action::Buy, 0.9)))
            .await
            .unwrap();
        let record = m.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Published);
    }

    #[tokio::test]
    async fn test_rejections_fed_back_once() {
        let h = harness().await;
        let mut m = manager(config(1, QuorumPolicy::Skip));
        m.restore(&h.ctx).await.unwrap();

        let order = crate::domain::OrderRequest::new(None, "X", crate::domain::Side::Buy, 10, dec!(100));
        let mut rejected = Transaction::pending(&order);
        rejected.reject("insufficient liquidity").unwrap();
        m.handle(&h.ctx, BusMessage::Transaction(rejected)).await.unwrap();

        m.handle(&h.ctx, BusMessage::Signal(signal("a", 1, "X", Action::Buy, 0.9)))
            .await
            .unwrap();
        m.close_cycle(&h.ctx, &h.publisher).await.unwrap();
        let first = h.ledger.latest_allocation().await.unwrap().unwrap();
        assert_eq!(first.rationale.rejected_since_last_cycle, vec!["X".to_string()]);

        m.handle(&h.ctx, BusMessage::Signal(signal("a", 2, "X", Action::Buy, 0.9)))
            .await
            .unwrap();
        m.close_cycle(&h.ctx, &h.publisher).await.unwrap();
        let second = h.ledger.latest_allocation().await.unwrap().unwrap();
        assert!(second.rationale.rejected_since_last_cycle.is_empty());
    }

    #[tokio::test]
    async fn test_weight_update_learns_from_outcomes() {
        let h = harness().await;
        let mut cfg = config(1, QuorumPolicy::Skip);
        cfg.holding_period_ms = 0;
        let mut m = manager(cfg);
        m.restore(&h.ctx).await.unwrap();

        // price moves 100 -> 110: BUY right, SELL wrong
        let mut old = signal("a", 1, "X", Action::Buy, 0.9);
        old.timestamp = Utc::now() - chrono::Duration::hours(1);
        h.ledger.record_signal(&old).await.unwrap();
        let mut wrong = signal("b", 1, "X", Action::Sell, 0.9);
        wrong.timestamp = Utc::now() - chrono::Duration::hours(1);
        h.ledger.record_signal(&wrong).await.unwrap();

        let updated = m.update_weights(&h.ctx).await.unwrap();
        assert_eq!(updated.version, 2);
        assert!((updated.sum() - 1.0).abs() < 1e-9);
        let a = updated.get("a").unwrap();
        let b = updated.get("b").unwrap();
        let c = updated.get("c").unwrap();
        assert!(a > b);
        // c has no history and keeps the prior
        assert!((c / a - 0.2 / (0.2 + 0.8 / 3.0)).abs() < 1e-9);
        assert_eq!(h.ledger.load_weights().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_restart_rebuilds_open_window_and_breach() {
        let h = harness().await;
        let pending = signal("a", 1, "X", Action::Buy, 0.9);
        h.ledger.record_signal(&pending).await.unwrap();
        h.ledger
            .save_risk_state(&crate::domain::RiskState {
                threshold_breached: true,
                breach_action: Some(InterventionAction::ReduceExposure),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut m = manager(config(1, QuorumPolicy::Skip));
        m.restore(&h.ctx).await.unwrap();
        assert_eq!(m.window().len(), 1);
        assert_eq!(m.intervention(), Some(InterventionAction::ReduceExposure));

        // the redelivered copy is a duplicate
        m.handle(&h.ctx, BusMessage::Signal(pending)).await.unwrap();
        assert_eq!(m.window().len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_closes_cycles() {
        let bus = Arc::new(InMemoryBus::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let (shutdown, rx) = broadcast::channel(1);
        let ctx = AgentContext::new("manager", bus.clone(), ledger.clone(), RetryPolicy::default(), rx);

        let mut cfg = config(1, QuorumPolicy::Skip);
        cfg.aggregation_window_ms = 50;
        let handle = tokio::spawn(manager(cfg).run(ctx));

        let analyst = Publisher::new(bus.clone(), "a").await.unwrap();
        let seq = analyst.next_sequence();
        let s = signal("a", seq, "X", Action::Buy, 0.9);
        analyst.publish_sequenced(Topic::signals("a"), seq, &s).await.unwrap();

        let mut sub = bus.subscribe("watcher", TopicFilter::exact(Topic::Allocations)).await.unwrap();
        let delivered = tokio::time::timeout(std::time::Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(delivered.decode().unwrap(), BusMessage::Allocation(_)));

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(ledger.cycles().await.len(), 1);
    }

    /// Where the first `commit_cycle` stalls
    #[derive(Clone, Copy)]
    enum Stall {
        BeforeCommit,
        AfterCommit,
    }

    /// In-memory ledger whose first cycle commit takes `delay`
    struct StallingLedger {
        inner: Arc<InMemoryLedger>,
        stall: Stall,
        delay: Duration,
        armed: AtomicBool,
    }

    #[async_trait]
    impl Ledger for StallingLedger {
        async fn record_signal(&self, signal: &Signal) -> Result<bool> {
            self.inner.record_signal(signal).await
        }

        async fn pending_signals(&self, since: chrono::DateTime<Utc>) -> Result<Vec<Signal>> {
            self.inner.pending_signals(since).await
        }

        async fn unresolved_signals(&self, before: chrono::DateTime<Utc>) -> Result<Vec<Signal>> {
            self.inner.unresolved_signals(before).await
        }

        async fn last_cycle_id(&self) -> Result<u64> {
            self.inner.last_cycle_id().await
        }

        async fn commit_cycle(
            &self,
            record: &CycleRecord,
            allocation: Option<&Allocation>,
            signals: &[SignalKey],
        ) -> Result<()> {
            let stalled = self.armed.swap(false, Ordering::SeqCst);
            if stalled && matches!(self.stall, Stall::BeforeCommit) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.commit_cycle(record, allocation, signals).await?;
            if stalled && matches!(self.stall, Stall::AfterCommit) {
                tokio::time::sleep(self.delay).await;
            }
            Ok(())
        }

        async fn latest_allocation(&self) -> Result<Option<Allocation>> {
            self.inner.latest_allocation().await
        }

        async fn record_transaction(&self, tx: &Transaction) -> Result<()> {
            self.inner.record_transaction(tx).await
        }

        async fn settle_transaction(&self, tx: &Transaction) -> Result<()> {
            self.inner.settle_transaction(tx).await
        }

        async fn has_transactions_for(&self, allocation_id: Uuid) -> Result<bool> {
            self.inner.has_transactions_for(allocation_id).await
        }

        async fn positions(&self) -> Result<BTreeMap<String, i64>> {
            self.inner.positions().await
        }

        async fn cash_flow(&self) -> Result<Decimal> {
            self.inner.cash_flow().await
        }

        async fn record_performance(&self, record: &PerformanceRecord) -> Result<()> {
            self.inner.record_performance(record).await
        }

        async fn recent_performance(
            &self,
            producer_id: &str,
            limit: usize,
        ) -> Result<Vec<PerformanceRecord>> {
            self.inner.recent_performance(producer_id, limit).await
        }

        async fn record_portfolio_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
            self.inner.record_portfolio_snapshot(snapshot).await
        }

        async fn portfolio_history(&self, limit: usize) -> Result<Vec<PortfolioSnapshot>> {
            self.inner.portfolio_history(limit).await
        }

        async fn load_weights(&self) -> Result<WeightSet> {
            self.inner.load_weights().await
        }

        async fn save_weights(&self, set: &WeightSet) -> Result<i64> {
            self.inner.save_weights(set).await
        }

        async fn load_risk_state(&self) -> Result<RiskState> {
            self.inner.load_risk_state().await
        }

        async fn save_risk_state(&self, state: &RiskState) -> Result<i64> {
            self.inner.save_risk_state(state).await
        }

        async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
            self.inner.record_dead_letter(letter).await
        }
    }

    async fn stalling_harness(stall: Stall) -> Harness {
        let bus = Arc::new(InMemoryBus::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let stalling = Arc::new(StallingLedger {
            inner: ledger.clone(),
            stall,
            delay: Duration::from_millis(500),
            armed: AtomicBool::new(true),
        });
        let (shutdown, rx) = broadcast::channel(1);
        let ctx = AgentContext::new("manager", bus.clone(), stalling, RetryPolicy::default(), rx);
        let publisher = ctx.publisher().await.unwrap();
        Harness {
            bus,
            ledger,
            ctx,
            publisher,
            _shutdown: shutdown,
        }
    }

    fn quick_timeout() -> ManagerConfig {
        ManagerConfig {
            cycle_timeout_ms: 50,
            ..config(1, QuorumPolicy::Skip)
        }
    }

    #[tokio::test]
    async fn test_overrunning_cycle_recorded_failed() {
        let h = stalling_harness(Stall::BeforeCommit).await;
        let mut m = manager(quick_timeout());
        m.restore(&h.ctx).await.unwrap();
        m.handle(&h.ctx, BusMessage::Signal(signal("a", 1, "X", Action::Buy, 0.9)))
            .await
            .unwrap();

        let record = m.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Failed);
        assert_eq!(record.cycle_id, 1);
        assert!(record.reason.as_deref().unwrap().contains("exceeded 50ms"));

        let cycles = h.ledger.cycles().await;
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].status, CycleStatus::Failed);
        assert_eq!(cycles[0].signal_count, 1);
        assert!(h.ledger.latest_allocation().await.unwrap().is_none());
        assert!(h.bus.messages(&TopicFilter::exact(Topic::Allocations)).await.is_empty());
        assert_eq!(m.last_cycle_id(), 1);
        assert!(m.window().is_empty());

        // the signals were consumed by the failed cycle
        let since = Utc::now() - chrono::Duration::hours(1);
        assert!(h.ledger.pending_signals(since).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_after_commit_keeps_committed_cycle() {
        let h = stalling_harness(Stall::AfterCommit).await;
        let mut m = manager(quick_timeout());
        m.restore(&h.ctx).await.unwrap();
        m.handle(&h.ctx, BusMessage::Signal(signal("a", 1, "X", Action::Buy, 0.9)))
            .await
            .unwrap();

        let record = m.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Failed);

        // the ledger keeps what was committed; nothing went out on the bus
        let cycles = h.ledger.cycles().await;
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].status, CycleStatus::Published);
        assert!(h.ledger.latest_allocation().await.unwrap().is_some());
        assert!(h.bus.messages(&TopicFilter::exact(Topic::Allocations)).await.is_empty());
        assert_eq!(m.last_cycle_id(), 1);

        // the next cycle numbers on from the committed one
        m.handle(&h.ctx, BusMessage::Signal(signal("a", 2, "X", Action::Buy, 0.9)))
            .await
            .unwrap();
        let next = m.close_cycle(&h.ctx, &h.publisher).await.unwrap().unwrap();
        assert_eq!(next.cycle_id, 2);
        assert_eq!(next.status, CycleStatus::Published);
        assert_eq!(h.bus.messages(&TopicFilter::exact(Topic::Allocations)).await.len(), 1);
    }
}
