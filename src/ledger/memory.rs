use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CycleRecord, DeadLetter, Ledger};
use crate::domain::{
    Allocation, PerformanceRecord, PortfolioSnapshot, RiskState, Side, Signal, SignalKey,
    Transaction, TransactionStatus, WeightSet,
};
use crate::error::{QuorumError, Result};

#[derive(Debug, Clone)]
struct StoredSignal {
    signal: Signal,
    cycle_id: Option<u64>,
    resolved: bool,
}

#[derive(Default)]
struct LedgerState {
    signals: BTreeMap<SignalKey, StoredSignal>,
    cycles: Vec<CycleRecord>,
    allocations: Vec<Allocation>,
    transactions: Vec<Transaction>,
    transaction_index: HashMap<Uuid, usize>,
    performance: Vec<PerformanceRecord>,
    snapshots: Vec<PortfolioSnapshot>,
    weights: Vec<WeightSet>,
    risk_states: Vec<RiskState>,
    dead_letters: Vec<DeadLetter>,
}

/// Process-local ledger with the same semantics as the postgres one
#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cycles(&self) -> Vec<CycleRecord> {
        self.state.read().await.cycles.clone()
    }

    pub async fn allocations(&self) -> Vec<Allocation> {
        self.state.read().await.allocations.clone()
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.state.read().await.transactions.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.read().await.dead_letters.clone()
    }

    /// Every persisted risk state, oldest first
    pub async fn risk_history(&self) -> Vec<RiskState> {
        self.state.read().await.risk_states.clone()
    }

    pub async fn signal_count(&self) -> usize {
        self.state.read().await.signals.len()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn record_signal(&self, signal: &Signal) -> Result<bool> {
        let mut state = self.state.write().await;
        let key = signal.key();
        if state.signals.contains_key(&key) {
            return Ok(false);
        }
        state.signals.insert(
            key,
            StoredSignal {
                signal: signal.clone(),
                cycle_id: None,
                resolved: false,
            },
        );
        Ok(true)
    }

    async fn pending_signals(&self, since: DateTime<Utc>) -> Result<Vec<Signal>> {
        let state = self.state.read().await;
        let mut pending: Vec<Signal> = state
            .signals
            .values()
            .filter(|s| s.cycle_id.is_none() && s.signal.timestamp >= since)
            .map(|s| s.signal.clone())
            .collect();
        pending.sort_by_key(|s| s.timestamp);
        Ok(pending)
    }

    async fn unresolved_signals(&self, before: DateTime<Utc>) -> Result<Vec<Signal>> {
        let state = self.state.read().await;
        let mut unresolved: Vec<Signal> = state
            .signals
            .values()
            .filter(|s| {
                !s.resolved && s.signal.reference_price.is_some() && s.signal.timestamp < before
            })
            .map(|s| s.signal.clone())
            .collect();
        unresolved.sort_by_key(|s| s.timestamp);
        Ok(unresolved)
    }

    async fn last_cycle_id(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state.cycles.iter().map(|c| c.cycle_id).max().unwrap_or(0))
    }

    async fn commit_cycle(
        &self,
        record: &CycleRecord,
        allocation: Option<&Allocation>,
        signals: &[SignalKey],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if state.cycles.iter().any(|c| c.cycle_id == record.cycle_id) {
            return Err(QuorumError::Validation(format!(
                "cycle {} already committed",
                record.cycle_id
            )));
        }

        state.cycles.push(record.clone());
        if let Some(allocation) = allocation {
            state.allocations.push(allocation.clone());
        }
        for key in signals {
            if let Some(stored) = state.signals.get_mut(key) {
                if stored.cycle_id.is_none() {
                    stored.cycle_id = Some(record.cycle_id);
                }
            }
        }
        Ok(())
    }

    async fn latest_allocation(&self) -> Result<Option<Allocation>> {
        Ok(self.state.read().await.allocations.last().cloned())
    }

    async fn record_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        if state.transaction_index.contains_key(&tx.transaction_id) {
            return Err(QuorumError::Validation(format!(
                "transaction {} already recorded",
                tx.transaction_id
            )));
        }
        let idx = state.transactions.len();
        state.transactions.push(tx.clone());
        state.transaction_index.insert(tx.transaction_id, idx);
        Ok(())
    }

    async fn settle_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut state = self.state.write().await;
        let idx = *state
            .transaction_index
            .get(&tx.transaction_id)
            .ok_or_else(|| {
                QuorumError::Validation(format!("unknown transaction {}", tx.transaction_id))
            })?;
        let stored = &mut state.transactions[idx];
        if !stored.status.can_transition_to(tx.status) {
            return Err(QuorumError::InvalidStateTransition {
                from: stored.status.to_string(),
                to: tx.status.to_string(),
            });
        }
        *stored = tx.clone();
        Ok(())
    }

    async fn has_transactions_for(&self, allocation_id: Uuid) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .any(|t| t.allocation_id == Some(allocation_id)))
    }

    async fn positions(&self) -> Result<BTreeMap<String, i64>> {
        let state = self.state.read().await;
        let mut positions: BTreeMap<String, i64> = BTreeMap::new();
        for tx in state
            .transactions
            .iter()
            .filter(|t| t.status == TransactionStatus::Filled)
        {
            let signed = match tx.side {
                Side::Buy => tx.quantity as i64,
                Side::Sell => -(tx.quantity as i64),
            };
            *positions.entry(tx.symbol.clone()).or_default() += signed;
        }
        positions.retain(|_, qty| *qty != 0);
        Ok(positions)
    }

    async fn cash_flow(&self) -> Result<Decimal> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.is_filled())
            .map(|t| match t.side {
                Side::Buy => -t.notional(),
                Side::Sell => t.notional(),
            })
            .sum())
    }

    async fn record_performance(&self, record: &PerformanceRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let key = SignalKey {
            producer_id: record.producer_id.clone(),
            sequence_id: record.signal_id,
        };
        if let Some(stored) = state.signals.get_mut(&key) {
            stored.resolved = true;
        }
        state.performance.push(record.clone());
        Ok(())
    }

    async fn recent_performance(
        &self,
        producer_id: &str,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>> {
        let state = self.state.read().await;
        Ok(state
            .performance
            .iter()
            .rev()
            .filter(|p| p.producer_id == producer_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_portfolio_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        self.state.write().await.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn portfolio_history(&self, limit: usize) -> Result<Vec<PortfolioSnapshot>> {
        let state = self.state.read().await;
        let skip = state.snapshots.len().saturating_sub(limit);
        Ok(state.snapshots[skip..].to_vec())
    }

    async fn load_weights(&self) -> Result<WeightSet> {
        Ok(self
            .state
            .read()
            .await
            .weights
            .last()
            .cloned()
            .unwrap_or_default())
    }

    async fn save_weights(&self, set: &WeightSet) -> Result<i64> {
        let mut state = self.state.write().await;
        let current = state.weights.last().map(|w| w.version).unwrap_or(0);
        if set.version != current {
            return Err(QuorumError::VersionConflict {
                entity: "analyst_weights".to_string(),
                expected: set.version,
                found: current,
            });
        }
        let mut stored = set.clone();
        stored.version = current + 1;
        state.weights.push(stored);
        Ok(current + 1)
    }

    async fn load_risk_state(&self) -> Result<RiskState> {
        Ok(self
            .state
            .read()
            .await
            .risk_states
            .last()
            .cloned()
            .unwrap_or_default())
    }

    async fn save_risk_state(&self, risk: &RiskState) -> Result<i64> {
        let mut state = self.state.write().await;
        let current = state.risk_states.last().map(|r| r.version).unwrap_or(0);
        if risk.version != current {
            return Err(QuorumError::VersionConflict {
                entity: "risk_state".to_string(),
                expected: risk.version,
                found: current,
            });
        }
        let mut stored = risk.clone();
        stored.version = current + 1;
        state.risk_states.push(stored);
        Ok(current + 1)
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.state.write().await.dead_letters.push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, Horizon, OrderRequest};
    use crate::ledger::CycleStatus;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn signal(producer: &str, seq: u64) -> Signal {
        Signal {
            producer_id: producer.into(),
            symbol: "AAPL".into(),
            action: Action::Buy,
            confidence: 0.6,
            horizon: Horizon::LongTerm,
            timestamp: Utc::now(),
            sequence_id: seq,
            reference_price: Some(dec!(100)),
            rationale: None,
        }
    }

    fn cycle(id: u64) -> CycleRecord {
        CycleRecord {
            cycle_id: id,
            status: CycleStatus::Published,
            producers_reported: 1,
            signal_count: 1,
            allocation_id: None,
            reason: None,
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_signal_is_idempotent() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.record_signal(&signal("value", 1)).await.unwrap());
        assert!(!ledger.record_signal(&signal("value", 1)).await.unwrap());
        assert_eq!(ledger.signal_count().await, 1);
    }

    #[tokio::test]
    async fn test_commit_cycle_assigns_pending_signals() {
        let ledger = InMemoryLedger::new();
        let since = Utc::now() - chrono::Duration::hours(1);
        ledger.record_signal(&signal("value", 1)).await.unwrap();
        ledger.record_signal(&signal("growth", 1)).await.unwrap();
        assert_eq!(ledger.pending_signals(since).await.unwrap().len(), 2);

        ledger
            .commit_cycle(&cycle(1), None, &[signal("value", 1).key()])
            .await
            .unwrap();

        let pending = ledger.pending_signals(since).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].producer_id, "growth");
        assert_eq!(ledger.last_cycle_id().await.unwrap(), 1);
        assert!(ledger.commit_cycle(&cycle(1), None, &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_settle_only_from_pending() {
        let ledger = InMemoryLedger::new();
        let order = OrderRequest::new(None, "AAPL", Side::Buy, 10, dec!(100));
        let mut tx = Transaction::pending(&order);
        ledger.record_transaction(&tx).await.unwrap();

        tx.fill(dec!(100)).unwrap();
        ledger.settle_transaction(&tx).await.unwrap();

        // A second settlement would be FILLED -> FILLED
        let err = ledger.settle_transaction(&tx).await.unwrap_err();
        assert!(matches!(err, QuorumError::InvalidStateTransition { .. }));

        let sell = OrderRequest::new(None, "AAPL", Side::Sell, 4, dec!(100));
        let mut sell_tx = Transaction::pending(&sell);
        ledger.record_transaction(&sell_tx).await.unwrap();
        sell_tx.fill(dec!(101)).unwrap();
        ledger.settle_transaction(&sell_tx).await.unwrap();

        let positions = ledger.positions().await.unwrap();
        assert_eq!(positions.get("AAPL"), Some(&6));

        let rejected = OrderRequest::new(None, "AAPL", Side::Buy, 50, dec!(100));
        let mut rejected_tx = Transaction::pending(&rejected);
        ledger.record_transaction(&rejected_tx).await.unwrap();
        rejected_tx.reject("no liquidity").unwrap();
        ledger.settle_transaction(&rejected_tx).await.unwrap();

        // -10 * 100 + 4 * 101; the rejected buy moves nothing
        assert_eq!(ledger.cash_flow().await.unwrap(), dec!(-596));
    }

    #[tokio::test]
    async fn test_weights_compare_and_swap() {
        let ledger = InMemoryLedger::new();
        let loaded = ledger.load_weights().await.unwrap();
        assert_eq!(loaded.version, 0);

        let mut map = BTreeMap::new();
        map.insert("value".to_string(), 1.0);
        let first = WeightSet::from_map(map.clone(), loaded.version, Utc::now());
        assert_eq!(ledger.save_weights(&first).await.unwrap(), 1);

        // A writer that read version 0 loses
        let err = ledger.save_weights(&first).await.unwrap_err();
        assert!(matches!(
            err,
            QuorumError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
        assert_eq!(ledger.load_weights().await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_performance_resolves_signal() {
        let ledger = InMemoryLedger::new();
        let s = signal("value", 1);
        ledger.record_signal(&s).await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(ledger.unresolved_signals(later).await.unwrap().len(), 1);

        let record = PerformanceRecord::resolve(&s, dec!(110), 0.02).unwrap();
        ledger.record_performance(&record).await.unwrap();

        assert!(ledger.unresolved_signals(later).await.unwrap().is_empty());
        let recent = ledger.recent_performance("value", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].outcome_correct);
    }

    #[tokio::test]
    async fn test_portfolio_history_keeps_latest_oldest_first() {
        let ledger = InMemoryLedger::new();
        for v in [100, 110, 90] {
            ledger
                .record_portfolio_snapshot(&PortfolioSnapshot {
                    value: v.into(),
                    cash: 0.into(),
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let history = ledger.portfolio_history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, dec!(110));
        assert_eq!(history[1].value, dec!(90));
    }
}
