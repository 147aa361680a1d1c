//! The five analyst configurations

use std::fmt;
use std::str::FromStr;

use super::strategy::{CriteriaStrategy, Criterion, Evaluation, FnStrategy, Strategy};
use crate::adapters::market_data::{CyclePhase, FundamentalSnapshot, MacroIndicators, Metric};
use crate::domain::Action;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
    Value,
    Quality,
    Growth,
    DeepValue,
    Macro,
}

impl Profile {
    pub const ALL: [Profile; 5] = [
        Profile::Value,
        Profile::Quality,
        Profile::Growth,
        Profile::DeepValue,
        Profile::Macro,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Value => "value",
            Profile::Quality => "quality",
            Profile::Growth => "growth",
            Profile::DeepValue => "deep-value",
            Profile::Macro => "macro",
        }
    }

    /// Producer id used on the bus (`signals.<producer_id>`)
    pub fn producer_id(&self) -> String {
        format!("{}-analyst", self.as_str())
    }

    pub fn strategy(&self) -> Box<dyn Strategy> {
        match self {
            Profile::Value => Box::new(value()),
            Profile::Quality => Box::new(quality()),
            Profile::Growth => Box::new(growth()),
            Profile::DeepValue => Box::new(deep_value()),
            Profile::Macro => Box::new(FnStrategy::new("macro", false, macro_outlook)),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "value" => Ok(Profile::Value),
            "quality" => Ok(Profile::Quality),
            "growth" => Ok(Profile::Growth),
            "deep-value" => Ok(Profile::DeepValue),
            "macro" => Ok(Profile::Macro),
            _ => Err(format!("Unknown analyst profile: {}", s)),
        }
    }
}

pub fn value() -> CriteriaStrategy {
    CriteriaStrategy::new("value", 4.0, 2.0)
        .criterion(Criterion::above(Metric::Roe, 10.0))
        .criterion(Criterion::below(Metric::DebtToEquity, 0.5))
        .criterion(Criterion::above(Metric::EarningsGrowth5y, 5.0))
        .criterion(Criterion::below_relative(Metric::PeRatio, Metric::SectorPe, 1.0))
        .criterion(Criterion::below(Metric::PbRatio, 1.5))
}

pub fn quality() -> CriteriaStrategy {
    CriteriaStrategy::new("quality", 4.0, 2.5)
        .criterion(Criterion::above(Metric::Roe, 15.0))
        .criterion(Criterion::below(Metric::DebtToEquity, 0.3))
        .criterion(Criterion::above(Metric::EarningsGrowth10y, 7.0))
        .criterion(Criterion::below_relative(Metric::PeRatio, Metric::SectorPe, 0.8))
        .criterion(Criterion::below(Metric::PbRatio, 1.0))
        .with_sentiment(0.2, 1.0)
}

pub fn growth() -> CriteriaStrategy {
    CriteriaStrategy::new("growth", 3.5, 2.0)
        .criterion(Criterion::above(Metric::EarningsGrowth3y, 15.0).weighted(2.0))
        .criterion(Criterion::above(Metric::FreeCashFlow, 0.0))
        .criterion(Criterion::above(Metric::InsiderNetBuying, 0.0).weighted(1.5))
        .with_sentiment(0.2, 0.5)
}

pub fn deep_value() -> CriteriaStrategy {
    CriteriaStrategy::new("deep-value", 4.0, 2.5)
        .criterion(Criterion::below(Metric::PeRatio, 15.0))
        .criterion(Criterion::below(Metric::PbRatio, 1.5))
        .criterion(Criterion::above(Metric::CurrentRatio, 2.0))
        .criterion(Criterion::below(Metric::DebtToEquity, 0.5))
        .criterion(Criterion::above(Metric::DividendYield, 0.0))
        .criterion(Criterion::above(Metric::EarningsGrowth10y, 3.0))
}

const MACRO_BUY_SCORE: f64 = 0.3;
const MACRO_SELL_SCORE: f64 = -0.3;

/// Economy-wide tilt; the same view for every symbol
pub fn macro_outlook(snapshot: &FundamentalSnapshot, _sentiment: Option<f64>) -> Option<Evaluation> {
    let m: &MacroIndicators = snapshot.macro_indicators.as_ref()?;
    let mut score: f64 = 0.0;
    let mut notes = Vec::new();

    if m.interest_rate > 4.0 {
        score -= 0.2;
        notes.push("high rates");
    } else if m.interest_rate < 2.0 {
        score += 0.1;
        notes.push("low rates");
    }

    if m.gdp_growth > 3.0 {
        score += 0.2;
        notes.push("strong growth");
    } else if m.gdp_growth < 1.0 {
        score -= 0.15;
        notes.push("weak growth");
    }

    if m.inflation_rate > 4.0 {
        score -= 0.15;
        notes.push("high inflation");
    } else if m.inflation_rate < 1.0 {
        score -= 0.1;
        notes.push("deflation risk");
    }

    if m.yield_curve < -0.1 {
        score -= 0.3;
        notes.push("inverted yield curve");
    }

    if m.market_volatility > 25.0 {
        score -= 0.1;
        notes.push("elevated volatility");
    }

    match m.cycle_phase {
        Some(CyclePhase::EarlyExpansion) => {
            score += 0.3;
            notes.push("early expansion");
        }
        Some(CyclePhase::LateExpansion) => {
            score += 0.1;
            notes.push("late expansion");
        }
        Some(CyclePhase::EarlyContraction) => {
            score -= 0.3;
            notes.push("early contraction");
        }
        Some(CyclePhase::LateContraction) => {
            score += 0.2;
            notes.push("late contraction");
        }
        None => {}
    }

    let score = score.clamp(-1.0, 1.0);
    let action = if score > MACRO_BUY_SCORE {
        Action::Buy
    } else if score < MACRO_SELL_SCORE {
        Action::Sell
    } else {
        Action::Hold
    };
    let confidence = 0.5 + score.abs() / 2.0;
    let rationale = if notes.is_empty() {
        format!("macro score {:.2}, neutral backdrop", score)
    } else {
        format!("macro score {:.2}: {}", score, notes.join(", "))
    };

    Some(Evaluation::new(action, confidence, rationale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn undervalued_bank() -> FundamentalSnapshot {
        FundamentalSnapshot {
            symbol: "JPM".into(),
            pe_ratio: Some(11.0),
            sector_pe: Some(13.0),
            pb_ratio: Some(1.2),
            roe: Some(15.0),
            debt_to_equity: Some(0.4),
            earnings_growth_5y: Some(8.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_profile_names() {
        for profile in Profile::ALL {
            assert_eq!(profile.as_str().parse::<Profile>().unwrap(), profile);
            assert_eq!(profile.strategy().name(), profile.as_str());
        }
        assert_eq!("deep_value".parse::<Profile>().unwrap(), Profile::DeepValue);
        assert_eq!(Profile::Growth.producer_id(), "growth-analyst");
        assert!("momentum".parse::<Profile>().is_err());
    }

    #[test]
    fn test_sentiment_usage() {
        assert!(!Profile::Value.strategy().uses_sentiment());
        assert!(Profile::Quality.strategy().uses_sentiment());
        assert!(Profile::Growth.strategy().uses_sentiment());
        assert!(!Profile::DeepValue.strategy().uses_sentiment());
        assert!(!Profile::Macro.strategy().uses_sentiment());
    }

    #[test]
    fn test_value_buys_undervalued_bank() {
        let eval = value().evaluate(&undervalued_bank(), None).unwrap();
        assert_eq!(eval.action, Action::Buy);
        assert_eq!(eval.confidence, 1.0);
    }

    #[test]
    fn test_growth_weights() {
        let snap = FundamentalSnapshot {
            symbol: "AMZN".into(),
            earnings_growth_3y: Some(25.0),
            free_cash_flow: Some(-1.0),
            insider_net_buying: Some(2.0),
            ..Default::default()
        };
        // 2.0 + 1.5 of 4.5 without sentiment
        let eval = growth().evaluate(&snap, None).unwrap();
        assert_eq!(eval.action, Action::Buy);
        assert!((eval.confidence - 3.5 / 4.5).abs() < 1e-9);
    }

    #[test]
    fn test_macro_outlook() {
        let mut snap = FundamentalSnapshot {
            symbol: "AAPL".into(),
            ..Default::default()
        };
        assert!(macro_outlook(&snap, None).is_none());

        snap.macro_indicators = Some(MacroIndicators {
            inflation_rate: 5.0,
            interest_rate: 5.0,
            gdp_growth: 0.5,
            yield_curve: -0.5,
            ..Default::default()
        });
        let eval = macro_outlook(&snap, None).unwrap();
        assert_eq!(eval.action, Action::Sell);
        assert!((eval.confidence - 0.9).abs() < 1e-9);

        snap.macro_indicators = Some(MacroIndicators {
            inflation_rate: 2.0,
            interest_rate: 1.5,
            gdp_growth: 3.5,
            market_volatility: 15.0,
            cycle_phase: Some(CyclePhase::EarlyExpansion),
            ..Default::default()
        });
        let eval = macro_outlook(&snap, None).unwrap();
        assert_eq!(eval.action, Action::Buy);
        assert!((eval.confidence - 0.8).abs() < 1e-9);

        // inverted curve alone sits exactly on the threshold
        snap.macro_indicators = Some(MacroIndicators {
            inflation_rate: 2.0,
            interest_rate: 3.0,
            gdp_growth: 2.0,
            yield_curve: -0.2,
            ..Default::default()
        });
        assert_eq!(macro_outlook(&snap, None).unwrap().action, Action::Hold);
    }
}
