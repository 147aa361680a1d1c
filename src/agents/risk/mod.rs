//! Risk agent: evaluates the portfolio value series and issues interventions
//!
//! Evaluates on a fixed cadence and after every batch of fills. State is persisted
//! (compare-and-swap) before any control message goes out; a message that could not be
//! published is sent again on the next evaluation.

pub mod metrics;
pub mod monitor;

pub use metrics::RiskMetrics;
pub use monitor::{Control, RiskMonitor, Thresholds};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::context::AgentContext;
use super::traits::{Agent, AgentRole};
use super::{collect_deliveries, only_fatal, INBOX_CAPACITY};
use crate::bus::{BusMessage, Envelope, Inbox, Publisher, Topic, TopicFilter};
use crate::config::RiskConfig;
use crate::domain::{Intervention, Recovery, RiskReport, RiskState};
use crate::error::{QuorumError, Result};

/// Control message waiting to be published
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Intervention(Intervention),
    Recovery(Recovery),
}

impl Outgoing {
    fn topic(&self) -> Topic {
        match self {
            Outgoing::Intervention(_) => Topic::RiskIntervention,
            Outgoing::Recovery(_) => Topic::RiskRecovery,
        }
    }
}

pub struct RiskAgent {
    id: String,
    config: RiskConfig,
    monitor: RiskMonitor,
    state: RiskState,
    unsent: Option<Outgoing>,
}

impl RiskAgent {
    pub fn new(config: RiskConfig) -> Self {
        let monitor = RiskMonitor::new(Thresholds::from(&config));
        Self {
            id: "risk".to_string(),
            config,
            monitor,
            state: RiskState::default(),
            unsent: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    /// Load the persisted state; an active breach is announced again
    async fn restore(&mut self, ctx: &AgentContext) -> Result<()> {
        let ledger = &ctx.ledger;
        self.state = ctx
            .with_retry("load_risk_state", move || ledger.load_risk_state())
            .await?;

        if let (true, Some(action)) = (self.state.threshold_breached, self.state.breach_action) {
            self.unsent = Some(Outgoing::Intervention(Intervention {
                action,
                reason: format!(
                    "breach in force: drawdown {:.2}%",
                    self.state.current_drawdown
                ),
                drawdown: self.state.current_drawdown,
                issued_at: Utc::now(),
            }));
        }
        info!(
            agent = %self.id,
            version = self.state.version,
            breached = self.state.threshold_breached,
            drawdown = self.state.current_drawdown,
            "risk state restored"
        );
        Ok(())
    }

    /// One evaluation. Returns the report published, if there was anything to evaluate.
    async fn evaluate(&mut self, ctx: &AgentContext, publisher: &Publisher) -> Result<Option<RiskReport>> {
        if let Some(outgoing) = self.unsent.take() {
            self.send(ctx, publisher, outgoing).await?;
        }

        let ledger = &ctx.ledger;
        let limit = self.config.history_limit;
        let history = ctx
            .with_retry("portfolio_history", move || ledger.portfolio_history(limit))
            .await?;
        let values: Vec<f64> = history.iter().filter_map(|s| s.value.to_f64()).collect();
        let computed =
            metrics::compute(&values, self.config.risk_free_rate, self.config.periods_per_year);
        let (Some(metrics), Some(latest)) = (computed, history.last()) else {
            debug!(agent = %self.id, "no portfolio history yet");
            return Ok(None);
        };

        let now = Utc::now();
        let (mut next, control) =
            self.monitor
                .evaluate(&self.state, &metrics, latest.recorded_at, now);
        let saved = &next;
        let result = ctx
            .with_retry("save_risk_state", move || ledger.save_risk_state(saved))
            .await;
        match result {
            Ok(version) => next.version = version,
            Err(e @ QuorumError::VersionConflict { .. }) => {
                warn!(agent = %self.id, error = %e, "risk state changed underneath, reloading");
                self.state = ctx
                    .with_retry("load_risk_state", move || ledger.load_risk_state())
                    .await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.state = next;

        if let Some(control) = control {
            let outgoing = self.outgoing(control, &metrics);
            self.send(ctx, publisher, outgoing).await?;
        }

        let report = RiskReport {
            current_drawdown: metrics.current_drawdown,
            max_drawdown: self.state.max_drawdown,
            sharpe_estimate: metrics.sharpe,
            volatility: metrics.volatility,
            var_95: metrics.var_95,
            var_99: metrics.var_99,
            threshold_breached: self.state.threshold_breached,
            portfolio_value: metrics.latest_value,
            observations: metrics.observations,
            evaluated_at: now,
        };
        let sequence_id = publisher.next_sequence();
        let published = &report;
        let result = ctx
            .with_retry("publish_risk_report", move || {
                publisher.publish_sequenced(Topic::RiskReport, sequence_id, published)
            })
            .await
            .map(|_| ());
        only_fatal(&self.id, "publish_risk_report", result)?;

        debug!(
            agent = %self.id,
            drawdown = report.current_drawdown,
            max_drawdown = report.max_drawdown,
            volatility = ?report.volatility,
            sharpe = ?report.sharpe_estimate,
            var_95 = ?report.var_95,
            breached = report.threshold_breached,
            streak = self.state.recovery_streak,
            "risk evaluated"
        );
        Ok(Some(report))
    }

    fn outgoing(&self, control: Control, metrics: &RiskMetrics) -> Outgoing {
        let drawdown = metrics.current_drawdown;
        match control {
            Control::Intervene { action, threshold } => Outgoing::Intervention(Intervention {
                action,
                reason: format!("drawdown {drawdown:.2}% beyond {threshold:.2}% threshold"),
                drawdown,
                issued_at: Utc::now(),
            }),
            Control::Recover => Outgoing::Recovery(Recovery {
                drawdown,
                issued_at: Utc::now(),
            }),
        }
    }

    /// Publish a control message; on failure it is kept for the next evaluation
    async fn send(&mut self, ctx: &AgentContext, publisher: &Publisher, outgoing: Outgoing) -> Result<()> {
        let sequence_id = publisher.next_sequence();
        let message = &outgoing;
        let result = ctx
            .with_retry("publish_control", move || {
                publisher.publish_sequenced(message.topic(), sequence_id, message)
            })
            .await;

        match result {
            Ok(envelope) => {
                match &outgoing {
                    Outgoing::Intervention(i) => warn!(
                        agent = %self.id,
                        action = %i.action,
                        drawdown = i.drawdown,
                        sequence_id = envelope.sequence_id,
                        "intervention issued"
                    ),
                    Outgoing::Recovery(r) => info!(
                        agent = %self.id,
                        drawdown = r.drawdown,
                        sequence_id = envelope.sequence_id,
                        "recovery issued"
                    ),
                }
                Ok(())
            }
            Err(e) => {
                warn!(agent = %self.id, topic = %outgoing.topic(), error = %e, "control message not sent, will retry");
                self.unsent = Some(outgoing);
                only_fatal(&self.id, "publish_control", Err(e))
            }
        }
    }

    /// True when the delivery was a fill
    async fn process(&mut self, ctx: &AgentContext, envelope: Envelope) -> Result<bool> {
        let filled = match envelope.decode() {
            Ok(BusMessage::Transaction(tx)) => tx.is_filled(),
            Ok(_) => false,
            Err(e) => {
                only_fatal(&self.id, "dead_letter", ctx.dead_letter(&envelope, &e).await)?;
                return Ok(false);
            }
        };
        only_fatal(&self.id, "ack", ctx.ack(&envelope).await)?;
        Ok(filled)
    }
}

#[async_trait]
impl Agent for RiskAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> AgentRole {
        AgentRole::Risk
    }

    async fn run(mut self, mut ctx: AgentContext) -> Result<()> {
        info!(
            agent = %self.id,
            breach_pct = self.config.drawdown_threshold_pct,
            halt_pct = self.config.halt_threshold_pct,
            recovery_pct = self.config.recovery_threshold_pct,
            recovery_window = self.config.recovery_window,
            "risk agent starting"
        );

        self.restore(&ctx).await?;
        let publisher = ctx.publisher().await?;
        let mut subscription = ctx.subscribe(TopicFilter::exact(Topic::Transactions)).await?;
        let mut inbox = Inbox::new(INBOX_CAPACITY);

        let mut evaluation_tick = interval(self.config.evaluation_interval());
        evaluation_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                delivery = subscription.recv() => {
                    collect_deliveries(delivery, &mut subscription, &mut inbox)?;
                    let mut fills = 0usize;
                    while let Some(envelope) = inbox.pop() {
                        if self.process(&ctx, envelope).await? {
                            fills += 1;
                        }
                    }
                    if fills > 0 {
                        let result = self.evaluate(&ctx, &publisher).await.map(|_| ());
                        only_fatal(&self.id, "evaluate", result)?;
                    }
                }
                _ = evaluation_tick.tick() => {
                    let result = self.evaluate(&ctx, &publisher).await.map(|_| ());
                    only_fatal(&self.id, "evaluate", result)?;
                }
                _ = ctx.shutdown_rx().recv() => {
                    info!(agent = %self.id, "shutting down");
                    break;
                }
            }
        }

        debug!(agent = %self.id, inbox = %inbox.stats(), "risk agent stopped");
        Ok(())
    }
}
