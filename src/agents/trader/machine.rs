//! Trader execution state, published on a watch channel

use std::collections::VecDeque;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::{StateTransition, TraderState};
use crate::error::{QuorumError, Result};

const HISTORY_LIMIT: usize = 100;

pub struct StateMachine {
    state: TraderState,
    tx: watch::Sender<TraderState>,
    rx: watch::Receiver<TraderState>,
    history: VecDeque<StateTransition>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(TraderState::Idle);
        Self {
            state: TraderState::Idle,
            tx,
            rx,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn state(&self) -> TraderState {
        self.state
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<TraderState> {
        self.rx.clone()
    }

    pub fn transition(&mut self, to: TraderState, reason: &str) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(QuorumError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }

        let transition = StateTransition::new(self.state, to, reason);
        if to.is_halted() {
            info!(from = %self.state, to = %to, reason, "trader state change");
        } else {
            debug!(from = %self.state, to = %to, reason, "trader state change");
        }
        self.state = to;
        self.tx.send_replace(to);

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(transition);
        Ok(())
    }

    /// Recent transitions, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
