//! Market, fundamental and sentiment data collaborators

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{QuorumError, Result};

/// Fundamental metric names usable in scoring criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    PeRatio,
    SectorPe,
    PbRatio,
    /// Return on equity, percent
    Roe,
    DebtToEquity,
    /// Annualised earnings growth, percent
    EarningsGrowth3y,
    EarningsGrowth5y,
    EarningsGrowth10y,
    FreeCashFlow,
    /// Net insider buying over the last quarter (negative = selling)
    InsiderNetBuying,
    CurrentRatio,
    /// Percent
    DividendYield,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::PeRatio => "P/E",
            Metric::SectorPe => "sector P/E",
            Metric::PbRatio => "P/B",
            Metric::Roe => "ROE",
            Metric::DebtToEquity => "D/E",
            Metric::EarningsGrowth3y => "3y growth",
            Metric::EarningsGrowth5y => "5y growth",
            Metric::EarningsGrowth10y => "10y growth",
            Metric::FreeCashFlow => "free cash flow",
            Metric::InsiderNetBuying => "insider buying",
            Metric::CurrentRatio => "current ratio",
            Metric::DividendYield => "dividend yield",
        };
        write!(f, "{}", name)
    }
}

/// Business cycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    EarlyExpansion,
    LateExpansion,
    EarlyContraction,
    LateContraction,
}

/// Economy-wide indicators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroIndicators {
    pub inflation_rate: f64,
    pub interest_rate: f64,
    pub gdp_growth: f64,
    pub unemployment_rate: f64,
    pub manufacturing_pmi: f64,
    pub market_volatility: f64,
    /// 10y - 2y spread
    pub yield_curve: f64,
    #[serde(default)]
    pub cycle_phase: Option<CyclePhase>,
}

/// Per-symbol financial metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundamentalSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub pe_ratio: Option<f64>,
    pub sector_pe: Option<f64>,
    pub pb_ratio: Option<f64>,
    pub roe: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub earnings_growth_3y: Option<f64>,
    pub earnings_growth_5y: Option<f64>,
    pub earnings_growth_10y: Option<f64>,
    pub free_cash_flow: Option<f64>,
    pub insider_net_buying: Option<f64>,
    pub current_ratio: Option<f64>,
    pub dividend_yield: Option<f64>,
    pub macro_indicators: Option<MacroIndicators>,
}

impl FundamentalSnapshot {
    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::PeRatio => self.pe_ratio,
            Metric::SectorPe => self.sector_pe,
            Metric::PbRatio => self.pb_ratio,
            Metric::Roe => self.roe,
            Metric::DebtToEquity => self.debt_to_equity,
            Metric::EarningsGrowth3y => self.earnings_growth_3y,
            Metric::EarningsGrowth5y => self.earnings_growth_5y,
            Metric::EarningsGrowth10y => self.earnings_growth_10y,
            Metric::FreeCashFlow => self.free_cash_flow,
            Metric::InsiderNetBuying => self.insider_net_buying,
            Metric::CurrentRatio => self.current_ratio,
            Metric::DividendYield => self.dividend_yield,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fundamentals(&self, symbol: &str) -> Result<FundamentalSnapshot>;

    async fn latest_price(&self, symbol: &str) -> Result<Decimal>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SentimentProvider: Send + Sync {
    /// Bounded score in [-1, 1]
    async fn sentiment(&self, symbol: &str) -> Result<f64>;
}

/// Fixture file layout
#[derive(Debug, Clone, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    macro_indicators: Option<MacroIndicators>,
    #[serde(default)]
    symbols: Vec<FundamentalSnapshot>,
    #[serde(default)]
    sentiment: HashMap<String, f64>,
}

/// Fixture-backed provider for dry runs and tests. Prices can be moved at runtime.
#[derive(Default)]
pub struct StaticMarketData {
    snapshots: RwLock<HashMap<String, FundamentalSnapshot>>,
    sentiment: RwLock<HashMap<String, f64>>,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON fixture (`{"macro_indicators": {..}, "symbols": [..], "sentiment": {..}}`)
    pub fn from_json(json: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(json)?;
        let snapshots = fixture
            .symbols
            .into_iter()
            .map(|mut s| {
                if s.macro_indicators.is_none() {
                    s.macro_indicators = fixture.macro_indicators.clone();
                }
                (s.symbol.clone(), s)
            })
            .collect();
        Ok(Self {
            snapshots: RwLock::new(snapshots),
            sentiment: RwLock::new(fixture.sentiment),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let data = Self::from_json(&json)?;
        info!("Loaded market data fixture from {}", path.as_ref().display());
        Ok(data)
    }

    pub async fn insert(&self, snapshot: FundamentalSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(snapshot.symbol.clone(), snapshot);
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        let snapshot = snapshots
            .get_mut(symbol)
            .ok_or_else(|| QuorumError::MarketDataUnavailable(symbol.to_string()))?;
        snapshot.price = price;
        Ok(())
    }

    pub async fn set_sentiment(&self, symbol: &str, score: f64) {
        self.sentiment
            .write()
            .await
            .insert(symbol.to_string(), score.clamp(-1.0, 1.0));
    }

    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.snapshots.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[async_trait]
impl MarketDataProvider for StaticMarketData {
    async fn fundamentals(&self, symbol: &str) -> Result<FundamentalSnapshot> {
        self.snapshots
            .read()
            .await
            .get(symbol)
            .cloned()
            .ok_or_else(|| QuorumError::MarketDataUnavailable(symbol.to_string()))
    }

    async fn latest_price(&self, symbol: &str) -> Result<Decimal> {
        self.snapshots
            .read()
            .await
            .get(symbol)
            .map(|s| s.price)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or_else(|| QuorumError::MarketDataUnavailable(symbol.to_string()))
    }
}

#[async_trait]
impl SentimentProvider for StaticMarketData {
    async fn sentiment(&self, symbol: &str) -> Result<f64> {
        Ok(self
            .sentiment
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const FIXTURE: &str = r#"{
        "macro_indicators": {
            "inflation_rate": 2.8, "interest_rate": 3.5, "gdp_growth": 2.1,
            "unemployment_rate": 4.2, "manufacturing_pmi": 53.2,
            "market_volatility": 18.5, "yield_curve": -0.15
        },
        "symbols": [
            {"symbol": "AAPL", "price": "150", "pe_ratio": 28.0, "roe": 150.0},
            {"symbol": "JPM", "price": "140.5", "pb_ratio": 1.4}
        ],
        "sentiment": {"AAPL": 0.4}
    }"#;

    #[tokio::test]
    async fn test_fixture_loading() {
        let data = StaticMarketData::from_json(FIXTURE).unwrap();
        assert_eq!(data.symbols().await, vec!["AAPL", "JPM"]);

        let aapl = data.fundamentals("AAPL").await.unwrap();
        assert_eq!(aapl.price, dec!(150));
        assert_eq!(aapl.metric(Metric::PeRatio), Some(28.0));
        assert_eq!(aapl.metric(Metric::PbRatio), None);
        assert_eq!(aapl.macro_indicators.unwrap().yield_curve, -0.15);

        assert_eq!(data.sentiment("AAPL").await.unwrap(), 0.4);
        assert_eq!(data.sentiment("JPM").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_price_updates_and_missing_symbols() {
        let data = StaticMarketData::from_json(FIXTURE).unwrap();
        data.set_price("JPM", dec!(120)).await.unwrap();
        assert_eq!(data.latest_price("JPM").await.unwrap(), dec!(120));

        assert!(matches!(
            data.latest_price("TSLA").await,
            Err(QuorumError::MarketDataUnavailable(_))
        ));
        assert!(data.set_price("TSLA", dec!(1)).await.is_err());
    }
}
