//! Weighted voting: signals + analyst weights -> target allocation

use chrono::Utc;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::{Allocation, Contribution, Rationale, Signal, SymbolTarget, WeightSet};

#[derive(Debug, Clone)]
pub struct Aggregator {
    /// Keep only the N strongest positive votes
    max_positions: Option<usize>,
    /// Weight for a producer missing from the weight set
    fallback_weight: f64,
}

impl Aggregator {
    pub fn new(max_positions: Option<usize>, fallback_weight: f64) -> Self {
        Self {
            max_positions,
            fallback_weight,
        }
    }

    fn weight_of(&self, weights: &WeightSet, producer_id: &str) -> f64 {
        weights.get(producer_id).unwrap_or(self.fallback_weight)
    }

    /// Per-symbol weighted vote: Σ weight × directional value
    pub fn votes(&self, signals: &[Signal], weights: &WeightSet) -> BTreeMap<String, f64> {
        let mut votes = BTreeMap::new();
        for signal in signals {
            *votes.entry(signal.symbol.clone()).or_insert(0.0) +=
                self.weight_of(weights, &signal.producer_id) * signal.directional_value();
        }
        votes
    }

    /// Build an allocation for `cycle_id`.
    ///
    /// Positive votes are scaled proportionally so the targets sum to `scale` (at
    /// most 1); non-positive votes get a zero target. Targets are ordered by vote,
    /// ties by symbol.
    pub fn aggregate(
        &self,
        cycle_id: u64,
        signals: &[Signal],
        weights: &WeightSet,
        scale: f64,
    ) -> Allocation {
        let scale = scale.clamp(0.0, 1.0);
        let votes = self.votes(signals, weights);

        let mut ranked: Vec<(&String, f64)> = votes.iter().map(|(s, v)| (s, *v)).collect();
        ranked.sort_by_key(|(symbol, vote)| (Reverse(OrderedFloat(*vote)), (*symbol).clone()));

        let limit = self.max_positions.unwrap_or(usize::MAX);
        let held: Vec<&String> = ranked
            .iter()
            .filter(|(_, vote)| *vote > 0.0)
            .take(limit)
            .map(|(symbol, _)| *symbol)
            .collect();
        let positive_total: f64 = held.iter().map(|s| votes[*s]).sum();

        let targets = ranked
            .iter()
            .map(|(symbol, vote)| {
                let target_weight = if positive_total > 0.0 && held.contains(symbol) {
                    vote / positive_total * scale
                } else {
                    0.0
                };
                SymbolTarget {
                    symbol: (*symbol).clone(),
                    target_weight,
                    net_vote: *vote,
                }
            })
            .collect();

        let contributions = signals
            .iter()
            .map(|signal| {
                let weight = self.weight_of(weights, &signal.producer_id);
                Contribution {
                    producer_id: signal.producer_id.clone(),
                    sequence_id: signal.sequence_id,
                    symbol: signal.symbol.clone(),
                    action: signal.action,
                    confidence: signal.confidence,
                    weight,
                    vote: weight * signal.directional_value(),
                }
            })
            .collect();

        Allocation {
            allocation_id: Uuid::new_v4(),
            cycle_id,
            targets,
            rationale: Rationale {
                contributions,
                weights_version: weights.version,
                weights: weights.as_map(),
                confidence: scale,
                ..Default::default()
            },
            generated_at: Utc::now(),
        }
    }
}
