use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the risk agent tells the rest of the system to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionAction {
    /// Stop new buys and trim existing positions
    ReduceExposure,
    /// Stop all trading
    Halt,
}

impl InterventionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionAction::ReduceExposure => "REDUCE_EXPOSURE",
            InterventionAction::Halt => "HALT",
        }
    }

    /// HALT outranks REDUCE_EXPOSURE
    pub fn severity(&self) -> u8 {
        match self {
            InterventionAction::ReduceExposure => 1,
            InterventionAction::Halt => 2,
        }
    }
}

impl fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub action: InterventionAction,
    pub reason: String,
    /// Drawdown (percent) that triggered the intervention
    pub drawdown: f64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recovery {
    pub drawdown: f64,
    pub issued_at: DateTime<Utc>,
}

/// Periodic metrics published on `risk.report`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskReport {
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub sharpe_estimate: Option<f64>,
    pub volatility: Option<f64>,
    /// Historical one-period loss (percent) at 95% / 99%
    #[serde(default)]
    pub var_95: Option<f64>,
    #[serde(default)]
    pub var_99: Option<f64>,
    pub threshold_breached: bool,
    pub portfolio_value: f64,
    pub observations: usize,
    pub evaluated_at: DateTime<Utc>,
}

/// Persisted risk state. Single writer: the risk agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    /// Percent below the running peak
    pub current_drawdown: f64,
    pub max_drawdown: f64,
    pub sharpe_estimate: Option<f64>,
    pub threshold_breached: bool,
    /// Strongest action issued for the current breach
    pub breach_action: Option<InterventionAction>,
    /// Consecutive observations below the recovery threshold while breached
    pub recovery_streak: u32,
    /// Timestamp of the newest portfolio snapshot evaluated
    #[serde(default)]
    pub last_observation_at: Option<DateTime<Utc>>,
    pub last_evaluated_at: DateTime<Utc>,
    /// Version this state was read at (0 = nothing stored yet)
    pub version: i64,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            current_drawdown: 0.0,
            max_drawdown: 0.0,
            sharpe_estimate: None,
            threshold_breached: false,
            breach_action: None,
            recovery_streak: 0,
            last_observation_at: None,
            last_evaluated_at: Utc::now(),
            version: 0,
        }
    }
}

impl RiskState {
    pub fn is_halted(&self) -> bool {
        self.threshold_breached
    }
}
