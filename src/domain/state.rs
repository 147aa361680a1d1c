use serde::{Deserialize, Serialize};
use std::fmt;

/// Trader execution state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TraderState {
    /// Waiting for an allocation
    Idle,
    /// Diffing an allocation against the current portfolio
    Evaluating,
    /// Orders submitted, waiting for outcomes
    Executing,
    /// All orders resolved, bookkeeping done
    Settled,
    /// Intervention in force; nothing is executed until recovery
    Halted,
}

impl TraderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraderState::Idle => "IDLE",
            TraderState::Evaluating => "EVALUATING",
            TraderState::Executing => "EXECUTING",
            TraderState::Settled => "SETTLED",
            TraderState::Halted => "HALTED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: TraderState) -> bool {
        use TraderState::*;

        match (self, target) {
            // Intervention wins from anywhere
            (Idle | Evaluating | Executing | Settled, Halted) => true,

            (Idle, Evaluating) => true,

            (Evaluating, Executing) => true,
            (Evaluating, Idle) => true, // Nothing to trade

            (Executing, Settled) => true,

            (Settled, Idle) => true,

            // Recovery only
            (Halted, Idle) => true,

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<TraderState> {
        use TraderState::*;

        match self {
            Idle => vec![Evaluating, Halted],
            Evaluating => vec![Executing, Idle, Halted],
            Executing => vec![Settled, Halted],
            Settled => vec![Idle, Halted],
            Halted => vec![Idle],
        }
    }

    /// Is an allocation currently being worked?
    pub fn is_busy(&self) -> bool {
        matches!(self, TraderState::Evaluating | TraderState::Executing)
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, TraderState::Halted)
    }
}

impl Default for TraderState {
    fn default() -> Self {
        TraderState::Idle
    }
}

impl fmt::Display for TraderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TraderState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "IDLE" => Ok(TraderState::Idle),
            "EVALUATING" => Ok(TraderState::Evaluating),
            "EXECUTING" => Ok(TraderState::Executing),
            "SETTLED" => Ok(TraderState::Settled),
            "HALTED" => Ok(TraderState::Halted),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TraderState,
    pub to: TraderState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: TraderState, to: TraderState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use TraderState::*;

        assert!(Idle.can_transition_to(Evaluating));
        assert!(Evaluating.can_transition_to(Executing));
        assert!(Evaluating.can_transition_to(Idle));
        assert!(Executing.can_transition_to(Settled));
        assert!(Settled.can_transition_to(Idle));
        assert!(Halted.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Idle));
        assert!(!Halted.can_transition_to(Evaluating));
        assert!(!Halted.can_transition_to(Halted));
    }

    #[test]
    fn test_halt_reachable_from_every_active_state() {
        use TraderState::*;

        for state in [Idle, Evaluating, Executing, Settled] {
            assert!(state.can_transition_to(Halted), "{state} cannot halt");
            assert!(state.valid_transitions().contains(&Halted));
        }
        assert_eq!(Halted.valid_transitions(), vec![Idle]);
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!(TraderState::try_from("idle").unwrap(), TraderState::Idle);
        assert_eq!(
            TraderState::try_from("HALTED").unwrap(),
            TraderState::Halted
        );
        assert!(TraderState::try_from("LEG1_FILLED").is_err());
    }
}
