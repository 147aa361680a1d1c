//! Shared ledger: durable record of signals, allocations, transactions and the
//! versioned state the learning loop and risk monitor own.

pub mod memory;
pub mod retry;

pub use memory::InMemoryLedger;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::domain::{
    Allocation, PerformanceRecord, PortfolioSnapshot, RiskState, Signal, SignalKey, Transaction,
    WeightSet,
};
use crate::error::Result;

/// How an aggregation cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    /// Allocation published
    Published,
    /// Quorum not met under the skip policy
    Skipped,
    /// Intervention in force
    Withheld,
    /// Timed out or could not be persisted
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Published => "PUBLISHED",
            CycleStatus::Skipped => "SKIPPED",
            CycleStatus::Withheld => "WITHHELD",
            CycleStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for CycleStatus {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "PUBLISHED" => Ok(CycleStatus::Published),
            "SKIPPED" => Ok(CycleStatus::Skipped),
            "WITHHELD" => Ok(CycleStatus::Withheld),
            "FAILED" => Ok(CycleStatus::Failed),
            _ => Err(format!("Unknown cycle status: {}", s)),
        }
    }
}

/// Audit row for one aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: u64,
    pub status: CycleStatus,
    pub producers_reported: usize,
    pub signal_count: usize,
    pub allocation_id: Option<Uuid>,
    pub reason: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// A message that could not be decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub consumer: String,
    pub topic: String,
    pub producer_id: String,
    pub sequence_id: u64,
    pub bus_offset: Option<i64>,
    pub payload: Value,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

/// Durable store shared by every agent.
///
/// `save_weights` and `save_risk_state` are compare-and-swap writes: they succeed
/// only when the stored version still equals the version the caller read, and
/// return the new version. Otherwise they fail with `VersionConflict`.
#[async_trait]
pub trait Ledger: Send + Sync {
    // ==================== Recommendations ====================

    /// Store a signal; false if `(producer_id, sequence_id)` was already stored
    async fn record_signal(&self, signal: &Signal) -> Result<bool>;

    /// Stored signals not yet assigned to a cycle, timestamp at or after `since`
    async fn pending_signals(&self, since: DateTime<Utc>) -> Result<Vec<Signal>>;

    /// Signals with a reference price, produced before `before`, without an outcome
    async fn unresolved_signals(&self, before: DateTime<Utc>) -> Result<Vec<Signal>>;

    // ==================== Cycles & allocations ====================

    async fn last_cycle_id(&self) -> Result<u64>;

    /// Atomically persist the cycle, its allocation and the signal assignment
    async fn commit_cycle(
        &self,
        record: &CycleRecord,
        allocation: Option<&Allocation>,
        signals: &[SignalKey],
    ) -> Result<()>;

    async fn latest_allocation(&self) -> Result<Option<Allocation>>;

    // ==================== Transactions ====================

    /// Insert a PENDING transaction
    async fn record_transaction(&self, tx: &Transaction) -> Result<()>;

    /// Move a stored PENDING transaction to its terminal status
    async fn settle_transaction(&self, tx: &Transaction) -> Result<()>;

    async fn has_transactions_for(&self, allocation_id: Uuid) -> Result<bool>;

    /// Net FILLED quantity per symbol
    async fn positions(&self) -> Result<BTreeMap<String, i64>>;

    /// Cash moved by FILLED transactions: sell notional minus buy notional
    async fn cash_flow(&self) -> Result<Decimal>;

    // ==================== Performance ====================

    /// Store an outcome and mark the signal resolved
    async fn record_performance(&self, record: &PerformanceRecord) -> Result<()>;

    /// Newest first
    async fn recent_performance(
        &self,
        producer_id: &str,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>>;

    // ==================== Portfolio ====================

    async fn record_portfolio_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()>;

    /// The most recent `limit` snapshots, oldest first
    async fn portfolio_history(&self, limit: usize) -> Result<Vec<PortfolioSnapshot>>;

    // ==================== Versioned state ====================

    async fn load_weights(&self) -> Result<WeightSet>;

    async fn save_weights(&self, set: &WeightSet) -> Result<i64>;

    async fn load_risk_state(&self) -> Result<RiskState>;

    async fn save_risk_state(&self, state: &RiskState) -> Result<i64>;

    // ==================== Dead letters ====================

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_status_names() {
        for status in [
            CycleStatus::Published,
            CycleStatus::Skipped,
            CycleStatus::Withheld,
            CycleStatus::Failed,
        ] {
            assert_eq!(CycleStatus::try_from(status.as_str()).unwrap(), status);
        }
        assert!(CycleStatus::try_from("OPEN").is_err());
    }
}
