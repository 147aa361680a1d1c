//! Breach / recovery decisions with hysteresis

use chrono::{DateTime, Utc};

use super::metrics::RiskMetrics;
use crate::config::RiskConfig;
use crate::domain::{InterventionAction, RiskState};

/// Control message the evaluation calls for
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    Intervene {
        action: InterventionAction,
        threshold: f64,
    },
    Recover,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub breach_pct: f64,
    pub halt_pct: f64,
    pub recovery_pct: f64,
    pub recovery_window: u32,
}

impl From<&RiskConfig> for Thresholds {
    fn from(config: &RiskConfig) -> Self {
        Self {
            breach_pct: config.drawdown_threshold_pct,
            halt_pct: config.halt_threshold_pct,
            recovery_pct: config.recovery_threshold_pct,
            recovery_window: config.recovery_window.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskMonitor {
    thresholds: Thresholds,
}

impl RiskMonitor {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Next state from `state` and `metrics`, plus the control message to send.
    /// `observed_at` is the timestamp of the newest snapshot behind `metrics`.
    ///
    /// Breach when the drawdown exceeds the breach threshold (HALT at or above the halt
    /// threshold). While breached, crossing the halt threshold escalates a
    /// REDUCE_EXPOSURE breach. Recovery needs `recovery_window` consecutive observations
    /// below the recovery threshold; any other observation resets the streak. Evaluating
    /// the same observation again leaves the streak where it is.
    pub fn evaluate(
        &self,
        state: &RiskState,
        metrics: &RiskMetrics,
        observed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (RiskState, Option<Control>) {
        let t = &self.thresholds;
        let drawdown = metrics.current_drawdown;
        let fresh = state
            .last_observation_at
            .map_or(true, |seen| observed_at > seen);

        let mut next = state.clone();
        next.current_drawdown = drawdown;
        next.max_drawdown = state.max_drawdown.max(metrics.max_drawdown);
        next.sharpe_estimate = metrics.sharpe;
        next.last_evaluated_at = now;
        if fresh {
            next.last_observation_at = Some(observed_at);
        }

        if !state.threshold_breached {
            if drawdown <= t.breach_pct {
                return (next, None);
            }
            let (action, threshold) = if drawdown >= t.halt_pct {
                (InterventionAction::Halt, t.halt_pct)
            } else {
                (InterventionAction::ReduceExposure, t.breach_pct)
            };
            next.threshold_breached = true;
            next.breach_action = Some(action);
            next.recovery_streak = 0;
            return (next, Some(Control::Intervene { action, threshold }));
        }

        let current = state
            .breach_action
            .unwrap_or(InterventionAction::ReduceExposure);
        if drawdown >= t.halt_pct && current != InterventionAction::Halt {
            next.breach_action = Some(InterventionAction::Halt);
            next.recovery_streak = 0;
            return (
                next,
                Some(Control::Intervene {
                    action: InterventionAction::Halt,
                    threshold: t.halt_pct,
                }),
            );
        }

        if !fresh {
            return (next, None);
        }
        if drawdown < t.recovery_pct {
            next.recovery_streak = state.recovery_streak + 1;
            if next.recovery_streak >= t.recovery_window {
                next.threshold_breached = false;
                next.breach_action = None;
                next.recovery_streak = 0;
                return (next, Some(Control::Recover));
            }
        } else {
            next.recovery_streak = 0;
        }
        (next, None)
    }
}
