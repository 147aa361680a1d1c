//! Allocation to order list, per horizon
//!
//! SHORT_TERM trades every difference worth at least `min_trade_value`. LONG_TERM only
//! touches symbols whose weight drifted past `drift_threshold`, and at most once per
//! `min_interval`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::portfolio::Portfolio;
use crate::config::TraderConfig;
use crate::domain::{Allocation, Horizon, OrderRequest, Side};

/// Share of cash held back from buys to absorb slippage
const CASH_BUFFER: Decimal = Decimal::from_parts(5, 0, 0, false, 3);

#[derive(Debug, Clone, PartialEq)]
pub enum RebalancePolicy {
    Frequent {
        min_trade_value: Decimal,
    },
    Periodic {
        drift_threshold: f64,
        min_interval: Duration,
    },
}

impl RebalancePolicy {
    pub fn for_horizon(horizon: Horizon, config: &TraderConfig) -> Self {
        match horizon {
            Horizon::ShortTerm => RebalancePolicy::Frequent {
                min_trade_value: config.min_trade_value,
            },
            Horizon::LongTerm => RebalancePolicy::Periodic {
                drift_threshold: config.drift_threshold,
                min_interval: Duration::milliseconds(config.rebalance_interval_ms as i64),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rebalancer {
    policy: RebalancePolicy,
    last_rebalance: Option<DateTime<Utc>>,
}

impl Rebalancer {
    pub fn new(policy: RebalancePolicy) -> Self {
        Self {
            policy,
            last_rebalance: None,
        }
    }

    pub fn policy(&self) -> &RebalancePolicy {
        &self.policy
    }

    pub fn mark_rebalanced(&mut self, at: DateTime<Utc>) {
        self.last_rebalance = Some(at);
    }

    /// Orders moving `portfolio` toward `allocation`: sells first, then buys trimmed to
    /// the cash available after the sells.
    pub fn plan(
        &self,
        allocation: &Allocation,
        portfolio: &Portfolio,
        prices: &BTreeMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> Vec<OrderRequest> {
        if let (RebalancePolicy::Periodic { min_interval, .. }, Some(last)) =
            (&self.policy, self.last_rebalance)
        {
            if now - last < *min_interval {
                debug!(
                    allocation_id = %allocation.allocation_id,
                    last_rebalance = %last,
                    "rebalance interval not elapsed"
                );
                return Vec::new();
            }
        }

        let Some(total) = portfolio.market_value(prices) else {
            warn!(
                allocation_id = %allocation.allocation_id,
                "cannot value portfolio, a held symbol has no price"
            );
            return Vec::new();
        };
        if total <= Decimal::ZERO {
            return Vec::new();
        }

        let in_allocation: BTreeSet<&str> = allocation.symbols().collect();
        let universe: BTreeSet<&str> = in_allocation
            .iter()
            .copied()
            .chain(portfolio.positions().keys().map(String::as_str))
            .collect();

        let mut sells = Vec::new();
        let mut buys = Vec::new();
        for symbol in universe {
            let Some(price) = prices.get(symbol).copied().filter(|p| *p > Decimal::ZERO) else {
                warn!(allocation_id = %allocation.allocation_id, symbol, "no price, symbol skipped");
                continue;
            };
            let held = portfolio.position(symbol);

            if !in_allocation.contains(symbol) {
                sells.push(OrderRequest::new(
                    Some(allocation.allocation_id),
                    symbol,
                    Side::Sell,
                    held,
                    price,
                ));
                continue;
            }

            let target_weight = allocation.target_for(symbol);
            let current_value = price * Decimal::from(held);
            let target_value = total * Decimal::try_from(target_weight).unwrap_or(Decimal::ZERO);
            let diff = target_value - current_value;

            let worth_trading = match &self.policy {
                RebalancePolicy::Frequent { min_trade_value } => diff.abs() >= *min_trade_value,
                RebalancePolicy::Periodic { drift_threshold, .. } => {
                    let current_weight = (current_value / total).to_f64().unwrap_or(0.0);
                    (current_weight - target_weight).abs() > *drift_threshold
                }
            };
            if !worth_trading {
                continue;
            }

            let quantity = (diff.abs() / price).floor().to_u64().unwrap_or(0);
            if diff < Decimal::ZERO {
                let quantity = quantity.min(held);
                if quantity > 0 {
                    sells.push(OrderRequest::new(
                        Some(allocation.allocation_id),
                        symbol,
                        Side::Sell,
                        quantity,
                        price,
                    ));
                }
            } else if quantity > 0 {
                buys.push(OrderRequest::new(
                    Some(allocation.allocation_id),
                    symbol,
                    Side::Buy,
                    quantity,
                    price,
                ));
            }
        }

        let mut available = portfolio.cash() + sells.iter().map(OrderRequest::notional).sum::<Decimal>();
        for buy in &mut buys {
            buy.quantity = buy.quantity.min(affordable(available, buy.reference_price));
            available -= buy.notional();
        }
        buys.retain(|order| order.quantity > 0);

        sells.extend(buys);
        sells
    }
}

/// Whole shares `cash` buys at `price`, keeping the slippage buffer
pub fn affordable(cash: Decimal, price: Decimal) -> u64 {
    if cash <= Decimal::ZERO || price <= Decimal::ZERO {
        return 0;
    }
    (cash * (Decimal::ONE - CASH_BUFFER) / price)
        .floor()
        .to_u64()
        .unwrap_or(0)
}
