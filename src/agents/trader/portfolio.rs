//! Cash plus whole-share positions

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::warn;

use crate::domain::{PortfolioSnapshot, Side, Transaction};
use crate::error::{QuorumError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    cash: Decimal,
    positions: BTreeMap<String, u64>,
}

impl Portfolio {
    pub fn new(cash: Decimal) -> Self {
        Self {
            cash,
            positions: BTreeMap::new(),
        }
    }

    /// Rebuild from the ledger's net FILLED quantities
    pub fn from_ledger(positions: BTreeMap<String, i64>, cash: Decimal) -> Self {
        let positions = positions
            .into_iter()
            .filter_map(|(symbol, quantity)| {
                if quantity < 0 {
                    warn!(symbol = %symbol, quantity, "negative net position in ledger, ignoring");
                }
                u64::try_from(quantity)
                    .ok()
                    .filter(|q| *q > 0)
                    .map(|q| (symbol, q))
            })
            .collect();
        Self { cash, positions }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> u64 {
        self.positions.get(symbol).copied().unwrap_or(0)
    }

    pub fn positions(&self) -> &BTreeMap<String, u64> {
        &self.positions
    }

    /// Cash plus positions at `prices`; `None` when a held symbol has no price
    pub fn market_value(&self, prices: &BTreeMap<String, Decimal>) -> Option<Decimal> {
        let mut value = self.cash;
        for (symbol, quantity) in &self.positions {
            let price = prices.get(symbol)?;
            value += *price * Decimal::from(*quantity);
        }
        Some(value)
    }

    pub fn snapshot(&self, prices: &BTreeMap<String, Decimal>) -> Option<PortfolioSnapshot> {
        self.market_value(prices).map(|value| PortfolioSnapshot {
            value,
            cash: self.cash,
            recorded_at: Utc::now(),
        })
    }

    /// Book a filled transaction; anything else leaves the portfolio untouched
    pub fn apply(&mut self, tx: &Transaction) -> Result<()> {
        if !tx.is_filled() {
            return Ok(());
        }

        match tx.side {
            Side::Buy => {
                self.cash -= tx.notional();
                *self.positions.entry(tx.symbol.clone()).or_insert(0) += tx.quantity;
            }
            Side::Sell => {
                let held = self.position(&tx.symbol);
                if tx.quantity > held {
                    return Err(QuorumError::Validation(format!(
                        "sell of {} {} exceeds held {}",
                        tx.quantity, tx.symbol, held
                    )));
                }
                self.cash += tx.notional();
                if held == tx.quantity {
                    self.positions.remove(&tx.symbol);
                } else {
                    self.positions.insert(tx.symbol.clone(), held - tx.quantity);
                }
            }
        }
        Ok(())
    }
}
