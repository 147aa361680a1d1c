use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::signal::{Action, Signal};

/// Resolved outcome of one signal after its holding period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub producer_id: String,
    /// The producer's sequence_id of the resolved signal
    pub signal_id: u64,
    pub symbol: String,
    pub outcome_correct: bool,
    pub realized_return: f64,
    pub recorded_at: DateTime<Utc>,
}

impl PerformanceRecord {
    /// Resolve a signal against the price at the end of its holding period.
    ///
    /// BUY is correct on a positive return, SELL on a negative one, HOLD when the
    /// move stays within `hold_band`. Signals without a reference price cannot be
    /// resolved.
    pub fn resolve(signal: &Signal, exit_price: Decimal, hold_band: f64) -> Option<Self> {
        let entry = signal.reference_price?;
        if entry <= Decimal::ZERO || exit_price <= Decimal::ZERO {
            return None;
        }
        let realized_return = ((exit_price - entry) / entry).to_f64()?;
        let outcome_correct = match signal.action {
            Action::Buy => realized_return > 0.0,
            Action::Sell => realized_return < 0.0,
            Action::Hold => realized_return.abs() <= hold_band,
        };

        Some(Self {
            producer_id: signal.producer_id.clone(),
            signal_id: signal.sequence_id,
            symbol: signal.symbol.clone(),
            outcome_correct,
            realized_return,
            recorded_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalystWeight {
    pub producer_id: String,
    /// In [0, 1]
    pub weight: f64,
    pub updated_at: DateTime<Utc>,
}

/// A full, versioned set of analyst weights. Owned exclusively by the manager.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeightSet {
    pub weights: BTreeMap<String, AnalystWeight>,
    /// Version this set was read at (0 = nothing stored yet)
    pub version: i64,
}

impl WeightSet {
    pub fn get(&self, producer_id: &str) -> Option<f64> {
        self.weights.get(producer_id).map(|w| w.weight)
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().map(|w| w.weight).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn as_map(&self) -> BTreeMap<String, f64> {
        self.weights
            .iter()
            .map(|(k, v)| (k.clone(), v.weight))
            .collect()
    }

    pub fn from_map(map: BTreeMap<String, f64>, version: i64, at: DateTime<Utc>) -> Self {
        let weights = map
            .into_iter()
            .map(|(producer_id, weight)| {
                (
                    producer_id.clone(),
                    AnalystWeight {
                        producer_id,
                        weight,
                        updated_at: at,
                    },
                )
            })
            .collect();
        Self { weights, version }
    }
}

/// Portfolio valuation at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub value: Decimal,
    pub cash: Decimal,
    pub recorded_at: DateTime<Utc>,
}
