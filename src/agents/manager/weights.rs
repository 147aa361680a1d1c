//! Adaptive analyst weights (exponential moving average of recent accuracy)

use std::collections::BTreeMap;

use crate::domain::PerformanceRecord;

#[derive(Debug, Clone)]
pub struct WeightLearner {
    /// Smoothing constant in (0, 1]
    pub alpha: f64,
    /// Raw weight of a producer without performance history
    pub prior_weight: f64,
    /// K most recent outcomes considered
    pub window: usize,
}

impl WeightLearner {
    pub fn new(alpha: f64, prior_weight: f64, window: usize) -> Self {
        Self {
            alpha,
            prior_weight,
            window: window.max(1),
        }
    }

    /// Fraction of correct outcomes among the newest `window` records
    pub fn accuracy(&self, records: &[PerformanceRecord]) -> Option<f64> {
        let recent = &records[..records.len().min(self.window)];
        if recent.is_empty() {
            return None;
        }
        let correct = recent.iter().filter(|r| r.outcome_correct).count();
        Some(correct as f64 / recent.len() as f64)
    }

    /// α × accuracy + (1 − α) × old
    pub fn blend(&self, accuracy: f64, old_weight: f64) -> f64 {
        self.alpha * accuracy + (1.0 - self.alpha) * old_weight
    }

    /// Next weights for `producers`, normalized to sum to 1.
    ///
    /// `history` holds each producer's records newest first.
    pub fn update(
        &self,
        current: &BTreeMap<String, f64>,
        history: &BTreeMap<String, Vec<PerformanceRecord>>,
        producers: &[String],
    ) -> BTreeMap<String, f64> {
        let raw = producers
            .iter()
            .map(|producer| {
                let records = history.get(producer).map(Vec::as_slice).unwrap_or(&[]);
                let weight = match self.accuracy(records) {
                    Some(accuracy) => {
                        let old = current.get(producer).copied().unwrap_or(self.prior_weight);
                        self.blend(accuracy, old)
                    }
                    None => self.prior_weight,
                };
                (producer.clone(), weight)
            })
            .collect();
        normalize(raw)
    }
}

/// Scale weights to sum to 1; an all-zero set becomes an equal split
pub fn normalize(mut weights: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    if weights.is_empty() {
        return weights;
    }
    for weight in weights.values_mut() {
        if !weight.is_finite() || *weight < 0.0 {
            *weight = 0.0;
        }
    }
    let total: f64 = weights.values().sum();
    if total > 0.0 {
        for weight in weights.values_mut() {
            *weight /= total;
        }
    } else {
        let share = 1.0 / weights.len() as f64;
        for weight in weights.values_mut() {
            *weight = share;
        }
    }
    weights
}

/// Equal weights for a fresh producer set
pub fn equal_weights(producers: &[String]) -> BTreeMap<String, f64> {
    normalize(producers.iter().map(|p| (p.clone(), 0.0)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn records(producer: &str, correct: usize, total: usize) -> Vec<PerformanceRecord> {
        (0..total)
            .map(|i| PerformanceRecord {
                producer_id: producer.into(),
                signal_id: i as u64,
                symbol: "AAPL".into(),
                outcome_correct: i < correct,
                realized_return: 0.0,
                recorded_at: Utc::now(),
            })
            .collect()
    }

    fn producers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sum(weights: &BTreeMap<String, f64>) -> f64 {
        weights.values().sum()
    }

    #[test]
    fn test_ema_scenario() {
        let learner = WeightLearner::new(0.2, 0.2, 10);
        let accuracy = learner.accuracy(&records("a", 6, 10)).unwrap();
        assert!((accuracy - 0.6).abs() < 1e-12);
        assert!((learner.blend(accuracy, 0.25) - 0.32).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_uses_newest_window() {
        let learner = WeightLearner::new(0.2, 0.2, 4);
        // newest four: all correct
        assert_eq!(learner.accuracy(&records("a", 4, 12)), Some(1.0));
        assert_eq!(learner.accuracy(&[]), None);
    }

    #[test]
    fn test_update_normalizes() {
        let learner = WeightLearner::new(0.2, 0.2, 10);
        let current: BTreeMap<String, f64> = [
            ("a".to_string(), 0.25),
            ("b".to_string(), 0.25),
            ("c".to_string(), 0.25),
            ("d".to_string(), 0.25),
        ]
        .into();
        let mut history = BTreeMap::new();
        history.insert("a".to_string(), records("a", 6, 10));
        history.insert("b".to_string(), records("b", 2, 10));

        let next = learner.update(&current, &history, &producers(&["a", "b", "c", "d", "e"]));
        assert_eq!(next.len(), 5);
        assert!((sum(&next) - 1.0).abs() < 1e-9);
        // raw: a 0.32, b 0.24, c/d/e prior 0.2
        assert!((next["a"] - 0.32 / 1.16).abs() < 1e-9);
        assert!(next["a"] > next["b"]);
        assert_eq!(next["c"], next["e"]);
    }

    #[test]
    fn test_degenerate_inputs() {
        let zero: BTreeMap<String, f64> =
            [("a".to_string(), 0.0), ("b".to_string(), f64::NAN)].into();
        let split = normalize(zero);
        assert_eq!(split["a"], 0.5);
        assert_eq!(split["b"], 0.5);

        assert!(normalize(BTreeMap::new()).is_empty());
        let equal = equal_weights(&producers(&["x", "y", "z", "w"]));
        assert!((sum(&equal) - 1.0).abs() < 1e-12);
        assert_eq!(equal["x"], 0.25);
    }
}
