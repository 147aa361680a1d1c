//! Open aggregation window

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Signal, SignalKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// A newer sequence from the same producer for the symbol is already held
    Superseded,
    /// Older than the configured maximum signal age
    Stale,
}

/// Signals collected for the cycle being assembled.
///
/// Holds the newest signal per (producer, symbol). Every admitted key, including the
/// superseded ones, is assigned to the cycle when it closes.
#[derive(Debug)]
pub struct SignalWindow {
    max_age: Duration,
    opened_at: DateTime<Utc>,
    latest: BTreeMap<(String, String), Signal>,
    keys: BTreeSet<SignalKey>,
}

impl SignalWindow {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            opened_at: Utc::now(),
            latest: BTreeMap::new(),
            keys: BTreeSet::new(),
        }
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn admit(&mut self, signal: Signal, now: DateTime<Utc>) -> Admission {
        if now - signal.timestamp > self.max_age {
            return Admission::Stale;
        }

        self.keys.insert(signal.key());
        let slot = (signal.producer_id.clone(), signal.symbol.clone());
        match self.latest.get(&slot) {
            Some(held) if held.sequence_id >= signal.sequence_id => Admission::Superseded,
            _ => {
                self.latest.insert(slot, signal);
                Admission::Admitted
            }
        }
    }

    /// Distinct producers with at least one signal in the window
    pub fn producers(&self) -> BTreeSet<String> {
        self.latest.keys().map(|(producer, _)| producer.clone()).collect()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.latest.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<SignalKey> {
        self.keys.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    /// Hand over the window contents and open a fresh one
    pub fn take(&mut self) -> SignalWindow {
        let next = SignalWindow::new(self.max_age);
        std::mem::replace(self, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, Horizon};

    fn signal(producer: &str, symbol: &str, seq: u64, age_secs: i64) -> Signal {
        Signal {
            producer_id: producer.into(),
            symbol: symbol.into(),
            action: Action::Buy,
            confidence: 0.5,
            horizon: Horizon::LongTerm,
            timestamp: Utc::now() - Duration::seconds(age_secs),
            sequence_id: seq,
            reference_price: None,
            rationale: None,
        }
    }

    #[test]
    fn test_newest_sequence_wins() {
        let mut window = SignalWindow::new(Duration::hours(1));
        let now = Utc::now();
        assert_eq!(window.admit(signal("a", "X", 2, 0), now), Admission::Admitted);
        // arrives late, out of order
        assert_eq!(window.admit(signal("a", "X", 1, 0), now), Admission::Superseded);
        assert_eq!(window.admit(signal("a", "X", 3, 0), now), Admission::Admitted);
        assert_eq!(window.admit(signal("b", "X", 1, 0), now), Admission::Admitted);

        assert_eq!(window.len(), 2);
        assert_eq!(window.producers().len(), 2);
        let held: Vec<u64> = window
            .signals()
            .iter()
            .filter(|s| s.producer_id == "a")
            .map(|s| s.sequence_id)
            .collect();
        assert_eq!(held, vec![3]);
        assert_eq!(window.keys().len(), 4);
    }

    #[test]
    fn test_stale_signals_rejected() {
        let mut window = SignalWindow::new(Duration::minutes(5));
        assert_eq!(
            window.admit(signal("a", "X", 1, 600), Utc::now()),
            Admission::Stale
        );
        assert!(window.is_empty());
        assert!(window.keys().is_empty());
    }

    #[test]
    fn test_take_resets() {
        let mut window = SignalWindow::new(Duration::hours(1));
        window.admit(signal("a", "X", 1, 0), Utc::now());
        let closed = window.take();
        assert_eq!(closed.len(), 1);
        assert!(window.is_empty());
        assert!(closed.opened_at() <= window.opened_at());
    }
}
