use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{
    Action, Allocation, Horizon, InterventionAction, PerformanceRecord, PortfolioSnapshot,
    RiskState, Side, Signal, SignalKey, Transaction, TransactionStatus, WeightSet,
};
use crate::error::{QuorumError, Result};
use crate::ledger::{CycleRecord, DeadLetter, Ledger};

/// PostgreSQL ledger
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Create a new PostgreSQL ledger
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a ledger from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| QuorumError::Validation(format!("{what} {value} out of range")))
}

fn parse_enum<T>(value: String, parse: impl FnOnce(&str) -> std::result::Result<T, String>) -> Result<T> {
    parse(&value).map_err(QuorumError::Internal)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn signal_from_row(row: &PgRow) -> Result<Signal> {
    Ok(Signal {
        producer_id: row.get("producer_id"),
        symbol: row.get("symbol"),
        action: parse_enum(row.get("action"), |s| Action::try_from(s))?,
        confidence: row.get("confidence"),
        horizon: parse_enum(row.get("horizon"), |s| Horizon::try_from(s))?,
        timestamp: row.get("produced_at"),
        sequence_id: row.get::<i64, _>("sequence_id") as u64,
        reference_price: row.get("reference_price"),
        rationale: row.get("rationale"),
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    Ok(Transaction {
        transaction_id: row.get("transaction_id"),
        allocation_id: row.get("allocation_id"),
        symbol: row.get("symbol"),
        side: parse_enum(row.get("side"), |s| Side::try_from(s))?,
        quantity: row.get::<i64, _>("quantity") as u64,
        price: row.get("price"),
        executed_at: row.get("executed_at"),
        status: parse_enum(row.get("status"), |s| TransactionStatus::try_from(s))?,
        reason: row.get("reason"),
    })
}

fn performance_from_row(row: &PgRow) -> PerformanceRecord {
    PerformanceRecord {
        producer_id: row.get("producer_id"),
        signal_id: row.get::<i64, _>("signal_id") as u64,
        symbol: row.get("symbol"),
        outcome_correct: row.get("outcome_correct"),
        realized_return: row.get("realized_return"),
        recorded_at: row.get("recorded_at"),
    }
}

#[async_trait]
impl Ledger for PgLedger {
    // ==================== Recommendations ====================

    #[instrument(skip(self, signal), fields(producer_id = %signal.producer_id, sequence_id = signal.sequence_id))]
    async fn record_signal(&self, signal: &Signal) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO analyst_recommendations
                (producer_id, sequence_id, symbol, action, confidence, horizon,
                 reference_price, rationale, produced_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (producer_id, sequence_id) DO NOTHING
            "#,
        )
        .bind(&signal.producer_id)
        .bind(to_i64(signal.sequence_id, "sequence_id")?)
        .bind(&signal.symbol)
        .bind(signal.action.as_str())
        .bind(signal.confidence)
        .bind(signal.horizon.as_str())
        .bind(signal.reference_price)
        .bind(&signal.rationale)
        .bind(signal.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_signals(&self, since: DateTime<Utc>) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT producer_id, sequence_id, symbol, action, confidence, horizon,
                   reference_price, rationale, produced_at
            FROM analyst_recommendations
            WHERE cycle_id IS NULL AND produced_at >= $1
            ORDER BY produced_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(signal_from_row).collect()
    }

    async fn unresolved_signals(&self, before: DateTime<Utc>) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT producer_id, sequence_id, symbol, action, confidence, horizon,
                   reference_price, rationale, produced_at
            FROM analyst_recommendations
            WHERE resolved_at IS NULL AND reference_price IS NOT NULL AND produced_at < $1
            ORDER BY produced_at ASC
            "#,
        )
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(signal_from_row).collect()
    }

    // ==================== Cycles & allocations ====================

    async fn last_cycle_id(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(cycle_id), 0)::BIGINT AS last FROM aggregation_cycles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("last") as u64)
    }

    #[instrument(skip(self, record, allocation, signals), fields(cycle_id = record.cycle_id, status = %record.status))]
    async fn commit_cycle(
        &self,
        record: &CycleRecord,
        allocation: Option<&Allocation>,
        signals: &[SignalKey],
    ) -> Result<()> {
        let cycle_id = to_i64(record.cycle_id, "cycle_id")?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO aggregation_cycles
                (cycle_id, status, producers_reported, signal_count, allocation_id, reason, opened_at, closed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(cycle_id)
        .bind(record.status.as_str())
        .bind(record.producers_reported as i32)
        .bind(record.signal_count as i32)
        .bind(record.allocation_id)
        .bind(&record.reason)
        .bind(record.opened_at)
        .bind(record.closed_at)
        .execute(&mut *tx)
        .await?;

        if let Some(allocation) = allocation {
            sqlx::query(
                r#"
                INSERT INTO portfolio_allocations
                    (allocation_id, cycle_id, targets, rationale, gross_weight, generated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(allocation.allocation_id)
            .bind(cycle_id)
            .bind(serde_json::to_value(&allocation.targets)?)
            .bind(serde_json::to_value(&allocation.rationale)?)
            .bind(allocation.gross_weight())
            .bind(allocation.generated_at)
            .execute(&mut *tx)
            .await?;
        }

        for key in signals {
            sqlx::query(
                r#"
                UPDATE analyst_recommendations SET cycle_id = $1
                WHERE producer_id = $2 AND sequence_id = $3 AND cycle_id IS NULL
                "#,
            )
            .bind(cycle_id)
            .bind(&key.producer_id)
            .bind(to_i64(key.sequence_id, "sequence_id")?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Committed cycle with {} signals", signals.len());
        Ok(())
    }

    async fn latest_allocation(&self) -> Result<Option<Allocation>> {
        let row = sqlx::query(
            r#"
            SELECT allocation_id, cycle_id, targets, rationale, generated_at
            FROM portfolio_allocations
            ORDER BY generated_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(Allocation {
                allocation_id: r.get("allocation_id"),
                cycle_id: r.get::<i64, _>("cycle_id") as u64,
                targets: serde_json::from_value(r.get("targets"))?,
                rationale: serde_json::from_value(r.get("rationale"))?,
                generated_at: r.get("generated_at"),
            })
        })
        .transpose()
    }

    // ==================== Transactions ====================

    #[instrument(skip(self, tx), fields(transaction_id = %tx.transaction_id, symbol = %tx.symbol))]
    async fn record_transaction(&self, tx: &Transaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transactions
                (transaction_id, allocation_id, symbol, side, quantity, price, status, reason, executed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(tx.transaction_id)
        .bind(tx.allocation_id)
        .bind(&tx.symbol)
        .bind(tx.side.as_str())
        .bind(to_i64(tx.quantity, "quantity")?)
        .bind(tx.price)
        .bind(tx.status.as_str())
        .bind(&tx.reason)
        .bind(tx.executed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, tx), fields(transaction_id = %tx.transaction_id, status = %tx.status))]
    async fn settle_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM transactions WHERE transaction_id = $1 FOR UPDATE")
            .bind(tx.transaction_id)
            .fetch_optional(&mut *db_tx)
            .await?
            .ok_or_else(|| QuorumError::Validation(format!("unknown transaction {}", tx.transaction_id)))?;
        let stored = parse_enum(row.get("status"), |s| TransactionStatus::try_from(s))?;
        if !stored.can_transition_to(tx.status) {
            return Err(QuorumError::InvalidStateTransition {
                from: stored.to_string(),
                to: tx.status.to_string(),
            });
        }

        sqlx::query(
            r#"
            UPDATE transactions SET status = $2, price = $3, reason = $4, executed_at = $5
            WHERE transaction_id = $1
            "#,
        )
        .bind(tx.transaction_id)
        .bind(tx.status.as_str())
        .bind(tx.price)
        .bind(&tx.reason)
        .bind(tx.executed_at)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn has_transactions_for(&self, allocation_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM transactions WHERE allocation_id = $1) AS present",
        )
        .bind(allocation_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("present"))
    }

    async fn positions(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol,
                   SUM(CASE WHEN side = 'BUY' THEN quantity ELSE -quantity END)::BIGINT AS net
            FROM transactions
            WHERE status = 'FILLED'
            GROUP BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("symbol"), r.get::<i64, _>("net")))
            .filter(|(_, net)| *net != 0)
            .collect())
    }

    async fn cash_flow(&self) -> Result<Decimal> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(
                       SUM(CASE WHEN side = 'SELL' THEN price * quantity ELSE -(price * quantity) END),
                       0
                   ) AS flow
            FROM transactions
            WHERE status = 'FILLED'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<Decimal, _>("flow"))
    }

    // ==================== Performance ====================

    #[instrument(skip(self, record), fields(producer_id = %record.producer_id, signal_id = record.signal_id))]
    async fn record_performance(&self, record: &PerformanceRecord) -> Result<()> {
        let signal_id = to_i64(record.signal_id, "signal_id")?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO performance_metrics
                (producer_id, signal_id, symbol, outcome_correct, realized_return, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (producer_id, signal_id) DO NOTHING
            "#,
        )
        .bind(&record.producer_id)
        .bind(signal_id)
        .bind(&record.symbol)
        .bind(record.outcome_correct)
        .bind(record.realized_return)
        .bind(record.recorded_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE analyst_recommendations SET resolved_at = $3
            WHERE producer_id = $1 AND sequence_id = $2 AND resolved_at IS NULL
            "#,
        )
        .bind(&record.producer_id)
        .bind(signal_id)
        .bind(record.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn recent_performance(
        &self,
        producer_id: &str,
        limit: usize,
    ) -> Result<Vec<PerformanceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT producer_id, signal_id, symbol, outcome_correct, realized_return, recorded_at
            FROM performance_metrics
            WHERE producer_id = $1
            ORDER BY recorded_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(producer_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(performance_from_row).collect())
    }

    // ==================== Portfolio ====================

    async fn record_portfolio_snapshot(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        sqlx::query("INSERT INTO portfolio_snapshots (value, cash, recorded_at) VALUES ($1, $2, $3)")
            .bind(snapshot.value)
            .bind(snapshot.cash)
            .bind(snapshot.recorded_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn portfolio_history(&self, limit: usize) -> Result<Vec<PortfolioSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT value, cash, recorded_at FROM (
                SELECT id, value, cash, recorded_at FROM portfolio_snapshots
                ORDER BY id DESC
                LIMIT $1
            ) latest
            ORDER BY id ASC
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| PortfolioSnapshot {
                value: r.get::<Decimal, _>("value"),
                cash: r.get::<Decimal, _>("cash"),
                recorded_at: r.get("recorded_at"),
            })
            .collect())
    }

    // ==================== Versioned state ====================

    async fn load_weights(&self) -> Result<WeightSet> {
        let rows = sqlx::query(
            r#"
            SELECT version, producer_id, weight, updated_at
            FROM analyst_weights
            WHERE version = (SELECT MAX(version) FROM analyst_weight_versions)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut set = WeightSet::default();
        for row in rows {
            set.version = row.get("version");
            let producer_id: String = row.get("producer_id");
            set.weights.insert(
                producer_id.clone(),
                crate::domain::AnalystWeight {
                    producer_id,
                    weight: row.get("weight"),
                    updated_at: row.get("updated_at"),
                },
            );
        }
        Ok(set)
    }

    #[instrument(skip(self, set), fields(expected_version = set.version))]
    async fn save_weights(&self, set: &WeightSet) -> Result<i64> {
        let next = set.version + 1;
        let mut tx = self.pool.begin().await?;

        // Every version from 1 to the current one exists, so a stale writer always
        // collides on the primary key.
        if let Err(e) = sqlx::query("INSERT INTO analyst_weight_versions (version) VALUES ($1)")
            .bind(next)
            .execute(&mut *tx)
            .await
        {
            if is_unique_violation(&e) {
                drop(tx);
                let found = self.load_weights().await?.version;
                return Err(QuorumError::VersionConflict {
                    entity: "analyst_weights".to_string(),
                    expected: set.version,
                    found,
                });
            }
            return Err(e.into());
        }

        for weight in set.weights.values() {
            sqlx::query(
                r#"
                INSERT INTO analyst_weights (version, producer_id, weight, updated_at)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(next)
            .bind(&weight.producer_id)
            .bind(weight.weight)
            .bind(weight.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(next)
    }

    async fn load_risk_state(&self) -> Result<RiskState> {
        let row = sqlx::query(
            r#"
            SELECT version, current_drawdown, max_drawdown, sharpe_estimate, threshold_breached,
                   breach_action, recovery_streak, last_observation_at, last_evaluated_at
            FROM risk_state
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(RiskState::default());
        };
        let breach_action = match r.get::<Option<String>, _>("breach_action").as_deref() {
            Some("REDUCE_EXPOSURE") => Some(InterventionAction::ReduceExposure),
            Some("HALT") => Some(InterventionAction::Halt),
            Some(other) => {
                return Err(QuorumError::Internal(format!("Unknown breach action: {other}")))
            }
            None => None,
        };
        Ok(RiskState {
            current_drawdown: r.get("current_drawdown"),
            max_drawdown: r.get("max_drawdown"),
            sharpe_estimate: r.get("sharpe_estimate"),
            threshold_breached: r.get("threshold_breached"),
            breach_action,
            recovery_streak: r.get::<i32, _>("recovery_streak") as u32,
            last_observation_at: r.get("last_observation_at"),
            last_evaluated_at: r.get("last_evaluated_at"),
            version: r.get("version"),
        })
    }

    #[instrument(skip(self, state), fields(expected_version = state.version, breached = state.threshold_breached))]
    async fn save_risk_state(&self, state: &RiskState) -> Result<i64> {
        let next = state.version + 1;
        let result = sqlx::query(
            r#"
            INSERT INTO risk_state
                (version, current_drawdown, max_drawdown, sharpe_estimate, threshold_breached,
                 breach_action, recovery_streak, last_observation_at, last_evaluated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(next)
        .bind(state.current_drawdown)
        .bind(state.max_drawdown)
        .bind(state.sharpe_estimate)
        .bind(state.threshold_breached)
        .bind(state.breach_action.map(|a| a.as_str()))
        .bind(state.recovery_streak as i32)
        .bind(state.last_observation_at)
        .bind(state.last_evaluated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(next),
            Err(e) if is_unique_violation(&e) => {
                let found = self.load_risk_state().await?.version;
                Err(QuorumError::VersionConflict {
                    entity: "risk_state".to_string(),
                    expected: state.version,
                    found,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ==================== Dead letters ====================

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (consumer, topic, producer_id, sequence_id, bus_offset, payload, error, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&letter.consumer)
        .bind(&letter.topic)
        .bind(&letter.producer_id)
        .bind(to_i64(letter.sequence_id, "sequence_id")?)
        .bind(letter.bus_offset)
        .bind(&letter.payload)
        .bind(&letter.error)
        .bind(letter.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
