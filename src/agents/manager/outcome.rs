//! Holding-period resolution of past signals into performance records

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::adapters::market_data::MarketDataProvider;
use crate::domain::PerformanceRecord;
use crate::error::Result;
use crate::ledger::{Ledger, RetryPolicy};

pub struct OutcomeResolver {
    holding_period: Duration,
    hold_band: f64,
    market: Arc<dyn MarketDataProvider>,
}

impl OutcomeResolver {
    pub fn new(holding_period: Duration, hold_band: f64, market: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            holding_period,
            hold_band,
            market,
        }
    }

    /// Resolve every signal whose holding period has elapsed; returns the records written
    pub async fn resolve_due(
        &self,
        ledger: &Arc<dyn Ledger>,
        retry: &RetryPolicy,
    ) -> Result<Vec<PerformanceRecord>> {
        let cutoff = Utc::now() - self.holding_period;
        let due = retry
            .run("unresolved_signals", move || ledger.unresolved_signals(cutoff))
            .await?;

        let mut resolved = Vec::with_capacity(due.len());
        for signal in due {
            let exit_price = match self.market.latest_price(&signal.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(
                        producer_id = %signal.producer_id,
                        sequence_id = signal.sequence_id,
                        symbol = %signal.symbol,
                        error = %e,
                        "cannot resolve signal outcome yet"
                    );
                    continue;
                }
            };
            let Some(record) = PerformanceRecord::resolve(&signal, exit_price, self.hold_band) else {
                continue;
            };

            let record_ref = &record;
            retry
                .run("record_performance", move || ledger.record_performance(record_ref))
                .await?;
            debug!(
                producer_id = %record.producer_id,
                signal_id = record.signal_id,
                correct = record.outcome_correct,
                realized_return = record.realized_return,
                "signal outcome resolved"
            );
            resolved.push(record);
        }
        Ok(resolved)
    }
}
