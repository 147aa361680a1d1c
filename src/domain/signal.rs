use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{QuorumError, Result};

/// Recommendation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Action {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            "HOLD" => Ok(Action::Hold),
            _ => Err(format!("Unknown action: {}", s)),
        }
    }
}

/// Trading cadence mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Horizon {
    /// Frequent small rebalances
    ShortTerm,
    /// Periodic threshold-triggered rebalances
    LongTerm,
}

impl Horizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::ShortTerm => "SHORT_TERM",
            Horizon::LongTerm => "LONG_TERM",
        }
    }
}

impl Default for Horizon {
    fn default() -> Self {
        Horizon::LongTerm
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Horizon {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "SHORT_TERM" => Ok(Horizon::ShortTerm),
            "LONG_TERM" => Ok(Horizon::LongTerm),
            _ => Err(format!("Unknown horizon: {}", s)),
        }
    }
}

/// Identity of a published signal, used for idempotent consumption
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalKey {
    pub producer_id: String,
    pub sequence_id: u64,
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.producer_id, self.sequence_id)
    }
}

/// An analyst's recommendation for one symbol. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub producer_id: String,
    pub symbol: String,
    pub action: Action,
    /// In [0, 1]
    pub confidence: f64,
    pub horizon: Horizon,
    pub timestamp: DateTime<Utc>,
    /// Per-producer monotonically increasing counter
    pub sequence_id: u64,
    /// Price observed when the signal was produced; used to resolve outcomes
    #[serde(default)]
    pub reference_price: Option<Decimal>,
    #[serde(default)]
    pub rationale: Option<String>,
}

impl Signal {
    pub fn key(&self) -> SignalKey {
        SignalKey {
            producer_id: self.producer_id.clone(),
            sequence_id: self.sequence_id,
        }
    }

    /// BUY -> +confidence, SELL -> -confidence, HOLD -> 0
    pub fn directional_value(&self) -> f64 {
        match self.action {
            Action::Buy => self.confidence,
            Action::Sell => -self.confidence,
            Action::Hold => 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.producer_id.trim().is_empty() {
            return Err(QuorumError::Validation("signal has empty producer_id".into()));
        }
        if self.symbol.trim().is_empty() {
            return Err(QuorumError::Validation(format!(
                "signal {} has empty symbol",
                self.key()
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(QuorumError::Validation(format!(
                "signal {} confidence {} outside [0, 1]",
                self.key(),
                self.confidence
            )));
        }
        if let Some(price) = self.reference_price {
            if price <= Decimal::ZERO {
                return Err(QuorumError::Validation(format!(
                    "signal {} reference price {} must be positive",
                    self.key(),
                    price
                )));
            }
        }
        Ok(())
    }
}
