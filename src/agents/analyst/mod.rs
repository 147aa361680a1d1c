//! Analyst agent: one generic producer, parameterised by a scoring strategy

pub mod profiles;
pub mod strategy;

pub use profiles::Profile;
pub use strategy::{
    Comparison, CriteriaStrategy, Criterion, Evaluation, FnStrategy, SentimentCriterion, Strategy,
    Threshold,
};

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::context::AgentContext;
use super::traits::{Agent, AgentRole};
use crate::adapters::market_data::{MarketDataProvider, SentimentProvider};
use crate::bus::{Publisher, Topic};
use crate::domain::{Horizon, Signal};
use crate::error::Result;

pub struct AnalystAgent<S: Strategy> {
    producer_id: String,
    strategy: S,
    symbols: Vec<String>,
    horizon: Horizon,
    cadence: Duration,
    market: Arc<dyn MarketDataProvider>,
    sentiment: Option<Arc<dyn SentimentProvider>>,
}

impl<S: Strategy> AnalystAgent<S> {
    pub fn new(
        producer_id: impl Into<String>,
        strategy: S,
        symbols: Vec<String>,
        horizon: Horizon,
        cadence: Duration,
        market: Arc<dyn MarketDataProvider>,
    ) -> Self {
        Self {
            producer_id: producer_id.into(),
            strategy,
            symbols,
            horizon,
            cadence,
            market,
            sentiment: None,
        }
    }

    pub fn with_sentiment(mut self, provider: Arc<dyn SentimentProvider>) -> Self {
        self.sentiment = Some(provider);
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Score one symbol and stamp the resulting signal with the next sequence id.
    ///
    /// `Ok(None)` when the strategy has no opinion.
    pub async fn evaluate(&self, symbol: &str, publisher: &Publisher) -> Result<Option<Signal>> {
        let snapshot = self.market.fundamentals(symbol).await?;

        let sentiment = match (&self.sentiment, self.strategy.uses_sentiment()) {
            (Some(provider), true) => match provider.sentiment(symbol).await {
                Ok(score) => Some(score.clamp(-1.0, 1.0)),
                Err(e) => {
                    warn!(agent = %self.producer_id, symbol, error = %e, "sentiment unavailable");
                    None
                }
            },
            _ => None,
        };

        let Some(evaluation) = self.strategy.evaluate(&snapshot, sentiment) else {
            debug!(agent = %self.producer_id, symbol, "insufficient data, no signal");
            return Ok(None);
        };

        let reference_price = self.market.latest_price(symbol).await.ok();
        let signal = Signal {
            producer_id: publisher.producer_id().to_string(),
            symbol: symbol.to_string(),
            action: evaluation.action,
            confidence: evaluation.confidence,
            horizon: self.horizon,
            timestamp: Utc::now(),
            sequence_id: publisher.next_sequence(),
            reference_price,
            rationale: Some(evaluation.rationale),
        };
        signal.validate()?;
        Ok(Some(signal))
    }

    /// Evaluate every symbol and publish the signals; returns how many were published
    async fn scan(&self, ctx: &AgentContext, publisher: &Publisher) -> Result<usize> {
        let topic = Topic::signals(publisher.producer_id());
        let mut published = 0;

        for symbol in &self.symbols {
            let signal = match self.evaluate(symbol, publisher).await {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(e) => {
                    warn!(agent = %self.producer_id, symbol = %symbol, error = %e, "evaluation failed");
                    continue;
                }
            };

            let signal_ref = &signal;
            let topic_ref = &topic;
            ctx.with_retry("publish_signal", move || {
                publisher.publish_sequenced(topic_ref.clone(), signal_ref.sequence_id, signal_ref)
            })
            .await?;

            debug!(
                agent = %self.producer_id,
                symbol = %signal.symbol,
                sequence_id = signal.sequence_id,
                action = %signal.action,
                confidence = signal.confidence,
                "signal published"
            );
            published += 1;
        }
        Ok(published)
    }
}

#[async_trait]
impl<S: Strategy> Agent for AnalystAgent<S> {
    fn id(&self) -> &str {
        &self.producer_id
    }

    fn role(&self) -> AgentRole {
        AgentRole::Analyst
    }

    async fn run(self, mut ctx: AgentContext) -> Result<()> {
        info!(
            agent = %self.producer_id,
            strategy = self.strategy.name(),
            symbols = self.symbols.len(),
            horizon = %self.horizon,
            "analyst agent starting"
        );

        if self.symbols.is_empty() {
            warn!(agent = %self.producer_id, "no symbols configured, exiting");
            return Ok(());
        }

        let publisher = ctx.publisher().await?;
        let mut scan_tick = interval(self.cadence);
        scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = scan_tick.tick() => {
                    match self.scan(&ctx, &publisher).await {
                        Ok(count) => debug!(agent = %self.producer_id, count, "scan complete"),
                        Err(e) => error!(agent = %self.producer_id, error = %e, "publishing failed, will retry next scan"),
                    }
                }
                _ = ctx.shutdown_rx().recv() => {
                    info!(agent = %self.producer_id, "shutting down");
                    break;
                }
            }
        }

        info!(agent = %self.producer_id, "analyst agent stopped");
        Ok(())
    }
}
