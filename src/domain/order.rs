use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{QuorumError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Side {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err(format!("Unknown side: {}", s)),
        }
    }
}

/// Transaction status. Only PENDING -> {FILLED, REJECTED}; never reversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Filled,
    Rejected,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Filled => "FILLED",
            TransactionStatus::Rejected => "REJECTED",
        }
    }

    pub fn can_transition_to(&self, target: TransactionStatus) -> bool {
        matches!(
            (self, target),
            (TransactionStatus::Pending, TransactionStatus::Filled)
                | (TransactionStatus::Pending, TransactionStatus::Rejected)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TransactionStatus {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(TransactionStatus::Pending),
            "FILLED" => Ok(TransactionStatus::Filled),
            "REJECTED" => Ok(TransactionStatus::Rejected),
            _ => Err(format!("Unknown transaction status: {}", s)),
        }
    }
}

/// Order request (what the trader wants the venue to do)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: Uuid,
    /// None for protective orders issued under an intervention
    pub allocation_id: Option<Uuid>,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    /// Price the order was sized with
    pub reference_price: Decimal,
}

impl OrderRequest {
    pub fn new(
        allocation_id: Option<Uuid>,
        symbol: impl Into<String>,
        side: Side,
        quantity: u64,
        reference_price: Decimal,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            allocation_id,
            symbol: symbol.into(),
            side,
            quantity,
            reference_price,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.reference_price * Decimal::from(self.quantity)
    }
}

/// Execution record persisted to the ledger and published on `transactions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: Uuid,
    /// Back-reference to the allocation that caused it (not ownership)
    pub allocation_id: Option<Uuid>,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub executed_at: DateTime<Utc>,
    pub status: TransactionStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Transaction {
    pub fn pending(order: &OrderRequest) -> Self {
        Self {
            transaction_id: order.order_id,
            allocation_id: order.allocation_id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price: order.reference_price,
            executed_at: Utc::now(),
            status: TransactionStatus::Pending,
            reason: None,
        }
    }

    pub fn fill(&mut self, price: Decimal) -> Result<()> {
        self.transition(TransactionStatus::Filled)?;
        self.price = price;
        self.executed_at = Utc::now();
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TransactionStatus::Rejected)?;
        self.reason = Some(reason.into());
        self.executed_at = Utc::now();
        Ok(())
    }

    fn transition(&mut self, target: TransactionStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(QuorumError::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    pub fn notional(&self) -> Decimal {
        self.price * Decimal::from(self.quantity)
    }

    pub fn is_filled(&self) -> bool {
        self.status == TransactionStatus::Filled
    }
}
