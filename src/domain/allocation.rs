use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::signal::Action;
use crate::error::{QuorumError, Result};

/// Tolerance for floating point sums of weights
pub const WEIGHT_EPSILON: f64 = 1e-9;

/// One signal's share of a symbol vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub producer_id: String,
    pub sequence_id: u64,
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    /// Analyst weight applied
    pub weight: f64,
    /// weight * directional value
    pub vote: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTarget {
    pub symbol: String,
    /// In [0, 1]; 0 means exit / stay out
    pub target_weight: f64,
    pub net_vote: f64,
}

/// Why an allocation looks the way it does
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rationale {
    pub contributions: Vec<Contribution>,
    pub weights_version: i64,
    pub weights: BTreeMap<String, f64>,
    pub producers_reported: usize,
    pub quorum_required: usize,
    /// 1.0 for a full quorum, reported/quorum when degraded
    pub confidence: f64,
    /// Symbols with REJECTED orders since the previous cycle
    #[serde(default)]
    pub rejected_since_last_cycle: Vec<String>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Target capital allocation. Immutable once published; superseded, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: Uuid,
    pub cycle_id: u64,
    pub targets: Vec<SymbolTarget>,
    pub rationale: Rationale,
    pub generated_at: DateTime<Utc>,
}

impl Allocation {
    /// Sum of target weights; the cash residual is 1 - gross
    pub fn gross_weight(&self) -> f64 {
        self.targets.iter().map(|t| t.target_weight).sum()
    }

    pub fn target_for(&self, symbol: &str) -> f64 {
        self.targets
            .iter()
            .find(|t| t.symbol == symbol)
            .map(|t| t.target_weight)
            .unwrap_or(0.0)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.symbol.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        for target in &self.targets {
            if !target.target_weight.is_finite()
                || target.target_weight < 0.0
                || target.target_weight > 1.0 + WEIGHT_EPSILON
            {
                return Err(QuorumError::Validation(format!(
                    "allocation {} has target {} for {} outside [0, 1]",
                    self.allocation_id, target.target_weight, target.symbol
                )));
            }
        }
        let gross = self.gross_weight();
        if gross > 1.0 + WEIGHT_EPSILON {
            return Err(QuorumError::Validation(format!(
                "allocation {} gross weight {:.6} exceeds 1",
                self.allocation_id, gross
            )));
        }
        Ok(())
    }
}
