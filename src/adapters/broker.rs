//! Execution venue collaborator

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use super::market_data::MarketDataProvider;
use crate::config::PaperBrokerConfig;
use crate::domain::{OrderRequest, Side};
use crate::error::Result;

/// Outcome of one logical order submission
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled { price: Decimal },
    Rejected { reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderOutcome>;
}

/// Simulated venue: fills at the latest market price moved against the order by the
/// configured slippage; optionally rejects at random.
pub struct PaperBroker {
    market: Arc<dyn MarketDataProvider>,
    config: PaperBrokerConfig,
}

impl PaperBroker {
    pub fn new(market: Arc<dyn MarketDataProvider>, config: PaperBrokerConfig) -> Self {
        Self { market, config }
    }

    fn fill_price(&self, side: Side, market_price: Decimal) -> Decimal {
        let slip = market_price * Decimal::from(self.config.slippage_bps) / Decimal::from(10_000);
        let price = match side {
            Side::Buy => market_price + slip,
            Side::Sell => market_price - slip,
        };
        price.round_dp(4)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit(&self, order: &OrderRequest) -> Result<OrderOutcome> {
        if order.quantity == 0 {
            return Ok(OrderOutcome::Rejected {
                reason: "zero quantity".to_string(),
            });
        }

        if self.config.reject_probability > 0.0
            && rand::thread_rng().gen_bool(self.config.reject_probability.min(1.0))
        {
            return Ok(OrderOutcome::Rejected {
                reason: "paper venue rejected the order".to_string(),
            });
        }

        let market_price = match self.market.latest_price(&order.symbol).await {
            Ok(price) => price,
            Err(e) => {
                return Ok(OrderOutcome::Rejected {
                    reason: e.to_string(),
                })
            }
        };
        let price = self.fill_price(order.side, market_price);
        debug!(
            symbol = %order.symbol,
            side = %order.side,
            quantity = order.quantity,
            %price,
            "paper fill"
        );
        Ok(OrderOutcome::Filled { price })
    }
}
