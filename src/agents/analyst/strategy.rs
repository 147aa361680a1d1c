//! Scoring strategies: the only thing that differs between analysts

use serde::{Deserialize, Serialize};

use crate::adapters::market_data::{FundamentalSnapshot, Metric};
use crate::domain::Action;

/// Result of scoring one symbol
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub action: Action,
    /// In [0, 1]
    pub confidence: f64,
    pub rationale: String,
}

impl Evaluation {
    pub fn new(action: Action, confidence: f64, rationale: impl Into<String>) -> Self {
        Self {
            action,
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            rationale: rationale.into(),
        }
    }
}

pub trait Strategy: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether `evaluate` should be given a sentiment score
    fn uses_sentiment(&self) -> bool;

    /// `None` when the data is insufficient to form an opinion
    fn evaluate(&self, snapshot: &FundamentalSnapshot, sentiment: Option<f64>) -> Option<Evaluation>;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn uses_sentiment(&self) -> bool {
        (**self).uses_sentiment()
    }

    fn evaluate(&self, snapshot: &FundamentalSnapshot, sentiment: Option<f64>) -> Option<Evaluation> {
        (**self).evaluate(snapshot, sentiment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Above,
    Below,
}

impl Comparison {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparison::Above => ">",
            Comparison::Below => "<",
        }
    }
}

/// Fixed number, or a multiple of another metric of the same snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Threshold {
    Fixed(f64),
    Relative { metric: Metric, factor: f64 },
}

impl Threshold {
    fn resolve(&self, snapshot: &FundamentalSnapshot) -> Option<f64> {
        match self {
            Threshold::Fixed(value) => Some(*value),
            Threshold::Relative { metric, factor } => snapshot.metric(*metric).map(|v| v * factor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub metric: Metric,
    pub comparison: Comparison,
    pub threshold: Threshold,
    pub weight: f64,
}

impl Criterion {
    pub fn above(metric: Metric, threshold: f64) -> Self {
        Self {
            metric,
            comparison: Comparison::Above,
            threshold: Threshold::Fixed(threshold),
            weight: 1.0,
        }
    }

    pub fn below(metric: Metric, threshold: f64) -> Self {
        Self {
            metric,
            comparison: Comparison::Below,
            threshold: Threshold::Fixed(threshold),
            weight: 1.0,
        }
    }

    /// `metric < factor * other`
    pub fn below_relative(metric: Metric, other: Metric, factor: f64) -> Self {
        Self {
            metric,
            comparison: Comparison::Below,
            threshold: Threshold::Relative {
                metric: other,
                factor,
            },
            weight: 1.0,
        }
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// `None` if the metric (or the metric the threshold refers to) is missing
    fn check(&self, snapshot: &FundamentalSnapshot) -> Option<(bool, f64, f64)> {
        let value = snapshot.metric(self.metric)?;
        let threshold = self.threshold.resolve(snapshot)?;
        Some((self.comparison.holds(value, threshold), value, threshold))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentCriterion {
    pub above: f64,
    pub weight: f64,
}

/// Weighted checklist scoring.
///
/// Score is the summed weight of satisfied criteria; max score the summed weight of
/// every criterion that could be checked. BUY at `buy_score` or more, HOLD at
/// `hold_score` or more, SELL below. Confidence is score / max score.
#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaStrategy {
    pub name: String,
    pub criteria: Vec<Criterion>,
    pub sentiment: Option<SentimentCriterion>,
    pub buy_score: f64,
    pub hold_score: f64,
}

impl CriteriaStrategy {
    pub fn new(name: impl Into<String>, buy_score: f64, hold_score: f64) -> Self {
        Self {
            name: name.into(),
            criteria: Vec::new(),
            sentiment: None,
            buy_score,
            hold_score,
        }
    }

    pub fn criterion(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn with_sentiment(mut self, above: f64, weight: f64) -> Self {
        self.sentiment = Some(SentimentCriterion { above, weight });
        self
    }
}

impl Strategy for CriteriaStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn uses_sentiment(&self) -> bool {
        self.sentiment.is_some()
    }

    fn evaluate(&self, snapshot: &FundamentalSnapshot, sentiment: Option<f64>) -> Option<Evaluation> {
        let mut score = 0.0;
        let mut max_score = 0.0;
        let mut checked = 0usize;
        let mut met = Vec::new();

        for criterion in &self.criteria {
            let Some((passed, value, threshold)) = criterion.check(snapshot) else {
                continue;
            };
            checked += 1;
            max_score += criterion.weight;
            if passed {
                score += criterion.weight;
                met.push(format!(
                    "{} {:.2} {} {:.2}",
                    criterion.metric,
                    value,
                    criterion.comparison.symbol(),
                    threshold
                ));
            }
        }

        if checked == 0 {
            return None;
        }

        if let (Some(rule), Some(sentiment)) = (&self.sentiment, sentiment) {
            max_score += rule.weight;
            if sentiment > rule.above {
                score += rule.weight;
                met.push(format!("sentiment {:.2} > {:.2}", sentiment, rule.above));
            }
        }

        let action = if score >= self.buy_score {
            Action::Buy
        } else if score >= self.hold_score {
            Action::Hold
        } else {
            Action::Sell
        };

        let rationale = if met.is_empty() {
            format!("score {:.1}/{:.1}, no criteria met", score, max_score)
        } else {
            format!("score {:.1}/{:.1}: {}", score, max_score, met.join(", "))
        };

        Some(Evaluation::new(action, score / max_score, rationale))
    }
}

/// Strategy backed by a closure
pub struct FnStrategy<F> {
    name: String,
    uses_sentiment: bool,
    f: F,
}

impl<F> FnStrategy<F>
where
    F: Fn(&FundamentalSnapshot, Option<f64>) -> Option<Evaluation> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, uses_sentiment: bool, f: F) -> Self {
        Self {
            name: name.into(),
            uses_sentiment,
            f,
        }
    }
}

impl<F> Strategy for FnStrategy<F>
where
    F: Fn(&FundamentalSnapshot, Option<f64>) -> Option<Evaluation> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn uses_sentiment(&self) -> bool {
        self.uses_sentiment
    }

    fn evaluate(&self, snapshot: &FundamentalSnapshot, sentiment: Option<f64>) -> Option<Evaluation> {
        (self.f)(snapshot, sentiment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> FundamentalSnapshot {
        FundamentalSnapshot {
            symbol: "JPM".into(),
            pe_ratio: Some(11.0),
            sector_pe: Some(14.0),
            roe: Some(15.0),
            debt_to_equity: Some(1.2),
            ..Default::default()
        }
    }

    fn strategy() -> CriteriaStrategy {
        CriteriaStrategy::new("test", 2.0, 1.0)
            .criterion(Criterion::above(Metric::Roe, 10.0))
            .criterion(Criterion::below(Metric::DebtToEquity, 0.5))
            .criterion(Criterion::below_relative(Metric::PeRatio, Metric::SectorPe, 1.0))
            .criterion(Criterion::above(Metric::DividendYield, 0.0))
    }

    #[test]
    fn test_missing_metrics_are_not_scored() {
        let eval = strategy().evaluate(&snapshot(), None).unwrap();
        // dividend yield is missing: 2 of 3 checkable criteria met
        assert_eq!(eval.action, Action::Buy);
        assert!((eval.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert!(eval.rationale.contains("ROE"));
    }

    #[test]
    fn test_no_data_means_no_opinion() {
        let empty = FundamentalSnapshot {
            symbol: "XYZ".into(),
            ..Default::default()
        };
        assert!(strategy().evaluate(&empty, Some(0.9)).is_none());
    }

    #[test]
    fn test_relative_threshold_needs_reference_metric() {
        let mut snap = snapshot();
        snap.sector_pe = None;
        snap.roe = Some(5.0);
        let eval = strategy().evaluate(&snap, None).unwrap();
        // only ROE and D/E are checkable, neither met
        assert_eq!(eval.action, Action::Sell);
        assert_eq!(eval.confidence, 0.0);
    }

    #[test]
    fn test_sentiment_counts_toward_score() {
        let strategy = CriteriaStrategy::new("s", 2.0, 1.0)
            .criterion(Criterion::above(Metric::Roe, 10.0))
            .with_sentiment(0.2, 1.0);
        assert!(strategy.uses_sentiment());

        let bullish = strategy.evaluate(&snapshot(), Some(0.5)).unwrap();
        assert_eq!(bullish.action, Action::Buy);
        assert_eq!(bullish.confidence, 1.0);

        let bearish = strategy.evaluate(&snapshot(), Some(-0.5)).unwrap();
        assert_eq!(bearish.action, Action::Hold);
        assert_eq!(bearish.confidence, 0.5);
    }

    #[test]
    fn test_closure_strategy() {
        let strategy = FnStrategy::new("always-buy", false, |snap: &FundamentalSnapshot, _| {
            Some(Evaluation::new(Action::Buy, 1.5, format!("{} looks fine", snap.symbol)))
        });
        let boxed: Box<dyn Strategy> = Box::new(strategy);
        let eval = boxed.evaluate(&snapshot(), None).unwrap();
        assert_eq!(boxed.name(), "always-buy");
        assert_eq!(eval.confidence, 1.0);
        assert_eq!(eval.rationale, "JPM looks fine");
    }
}
