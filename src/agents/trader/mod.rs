//! Trader agent: turns allocations into orders
//!
//! `IDLE -> EVALUATING -> EXECUTING -> SETTLED -> IDLE`, with `HALTED` entered from any
//! state on an intervention and left only on recovery. Control messages are checked
//! before evaluation and between order submissions, so an intervention that arrives
//! while orders are going out cancels whatever has not been submitted yet.

pub mod machine;
pub mod portfolio;
pub mod rebalance;

pub use machine::StateMachine;
pub use portfolio::Portfolio;
pub use rebalance::{RebalancePolicy, Rebalancer};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::AgentContext;
use super::traits::{Agent, AgentRole};
use super::{collect_deliveries, only_fatal, INBOX_CAPACITY};
use crate::adapters::broker::{Broker, OrderOutcome};
use crate::adapters::market_data::MarketDataProvider;
use crate::bus::{BusMessage, Envelope, Inbox, Publisher, Subscription, Topic, TopicFilter};
use crate::config::TraderConfig;
use crate::domain::{
    Allocation, Horizon, Intervention, InterventionAction, OrderRequest, Recovery, Side,
    TraderState, Transaction,
};
use crate::error::{QuorumError, Result};

/// How a batch of orders ended
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    pub filled: usize,
    pub rejected: usize,
    /// Buys dropped because no cash was left
    pub skipped: usize,
    /// Not submitted because a control message was pending
    pub cancelled: usize,
}

pub struct TraderAgent {
    id: String,
    horizon: Horizon,
    config: TraderConfig,
    broker: Arc<dyn Broker>,
    market: Arc<dyn MarketDataProvider>,
    machine: StateMachine,
    portfolio: Portfolio,
    rebalancer: Rebalancer,
    seen_allocations: HashSet<Uuid>,
    halt: Option<InterventionAction>,
}

impl TraderAgent {
    pub fn new(
        horizon: Horizon,
        config: TraderConfig,
        broker: Arc<dyn Broker>,
        market: Arc<dyn MarketDataProvider>,
    ) -> Self {
        let rebalancer = Rebalancer::new(RebalancePolicy::for_horizon(horizon, &config));
        let portfolio = Portfolio::new(config.initial_cash);
        Self {
            id: "trader".to_string(),
            horizon,
            config,
            broker,
            market,
            machine: StateMachine::new(),
            portfolio,
            rebalancer,
            seen_allocations: HashSet::new(),
            halt: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Observe state changes; take this before `run` consumes the agent
    pub fn state_receiver(&self) -> watch::Receiver<TraderState> {
        self.machine.subscribe()
    }

    pub fn state(&self) -> TraderState {
        self.machine.state()
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn halt_action(&self) -> Option<InterventionAction> {
        self.halt
    }

    pub fn subscription_filter() -> TopicFilter {
        TopicFilter::any([
            TopicFilter::exact(Topic::Allocations),
            TopicFilter::exact(Topic::RiskIntervention),
            TopicFilter::exact(Topic::RiskRecovery),
        ])
    }

    /// Rebuild the portfolio and honour a breach persisted before start
    async fn restore(&mut self, ctx: &AgentContext) -> Result<()> {
        let ledger = &ctx.ledger;
        let positions = ctx.with_retry("positions", move || ledger.positions()).await?;
        // Snapshots can lag the last fill, so cash comes from the transactions too
        let flow = ctx.with_retry("cash_flow", move || ledger.cash_flow()).await?;
        self.portfolio = Portfolio::from_ledger(positions, self.config.initial_cash + flow);

        let risk = ctx
            .with_retry("load_risk_state", move || ledger.load_risk_state())
            .await?;
        if risk.is_halted() && !self.machine.state().is_halted() {
            let action = risk.breach_action.unwrap_or(InterventionAction::ReduceExposure);
            self.halt = Some(action);
            self.machine
                .transition(TraderState::Halted, "risk breach in force at start")?;
            warn!(
                agent = %self.id,
                action = %action,
                drawdown = risk.current_drawdown,
                "starting halted"
            );
        }

        info!(
            agent = %self.id,
            cash = %self.portfolio.cash(),
            positions = self.portfolio.positions().len(),
            state = %self.machine.state(),
            "portfolio restored"
        );
        Ok(())
    }

    async fn prices(&self, symbols: &BTreeSet<String>) -> BTreeMap<String, Decimal> {
        let mut prices = BTreeMap::new();
        for symbol in symbols {
            match self.market.latest_price(symbol).await {
                Ok(price) => {
                    prices.insert(symbol.clone(), price);
                }
                Err(e) => warn!(agent = %self.id, symbol = %symbol, error = %e, "no market price"),
            }
        }
        prices
    }

    fn held_symbols(&self) -> BTreeSet<String> {
        self.portfolio.positions().keys().cloned().collect()
    }

    /// Pull everything already delivered into the inbox; true when a control message waits
    fn control_pending(subscription: &mut Subscription, inbox: &mut Inbox) -> bool {
        inbox.fill_from(subscription);
        inbox.has_control()
    }

    async fn handle(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        subscription: &mut Subscription,
        inbox: &mut Inbox,
        message: BusMessage,
    ) -> Result<()> {
        match message {
            BusMessage::Allocation(allocation) => {
                self.on_allocation(ctx, publisher, subscription, inbox, allocation)
                    .await
            }
            BusMessage::Intervention(intervention) => {
                self.on_intervention(ctx, publisher, subscription, inbox, intervention)
                    .await
            }
            BusMessage::Recovery(recovery) => self.on_recovery(&recovery),
            other => {
                debug!(agent = %self.id, message = ?other, "ignored");
                Ok(())
            }
        }
    }

    async fn on_allocation(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        subscription: &mut Subscription,
        inbox: &mut Inbox,
        allocation: Allocation,
    ) -> Result<()> {
        let allocation_id = allocation.allocation_id;
        if let Some(action) = self.halt {
            info!(
                agent = %self.id,
                allocation_id = %allocation_id,
                cycle_id = allocation.cycle_id,
                action = %action,
                "halted, allocation discarded"
            );
            return Ok(());
        }
        if self.seen_allocations.contains(&allocation_id) {
            debug!(agent = %self.id, allocation_id = %allocation_id, "allocation already handled");
            return Ok(());
        }
        let ledger = &ctx.ledger;
        let executed = ctx
            .with_retry("has_transactions_for", move || {
                ledger.has_transactions_for(allocation_id)
            })
            .await?;
        self.seen_allocations.insert(allocation_id);
        if executed {
            debug!(agent = %self.id, allocation_id = %allocation_id, "allocation already executed");
            return Ok(());
        }

        self.machine
            .transition(TraderState::Evaluating, "allocation received")?;
        let mut symbols = self.held_symbols();
        symbols.extend(allocation.symbols().map(str::to_string));
        let prices = self.prices(&symbols).await;
        let now = Utc::now();
        let orders = self
            .rebalancer
            .plan(&allocation, &self.portfolio, &prices, now);

        if orders.is_empty() {
            debug!(agent = %self.id, allocation_id = %allocation_id, "nothing to trade");
            return self.machine.transition(TraderState::Idle, "nothing to trade");
        }
        if Self::control_pending(subscription, inbox) {
            info!(
                agent = %self.id,
                allocation_id = %allocation_id,
                planned = orders.len(),
                "control message pending, evaluation abandoned"
            );
            return Ok(());
        }

        self.machine
            .transition(TraderState::Executing, "orders planned")?;
        self.rebalancer.mark_rebalanced(now);
        let report = self
            .execute(ctx, publisher, subscription, inbox, orders)
            .await?;
        info!(
            agent = %self.id,
            allocation_id = %allocation_id,
            cycle_id = allocation.cycle_id,
            filled = report.filled,
            rejected = report.rejected,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "allocation executed"
        );
        if report.cancelled > 0 {
            // the pending control message settles the state
            return Ok(());
        }

        self.machine
            .transition(TraderState::Settled, "all orders resolved")?;
        only_fatal(&self.id, "record_snapshot", self.record_snapshot(ctx, &prices).await)?;
        self.machine.transition(TraderState::Idle, "settled")
    }

    async fn on_intervention(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        subscription: &mut Subscription,
        inbox: &mut Inbox,
        intervention: Intervention,
    ) -> Result<()> {
        if let Some(current) = self.halt {
            if intervention.action.severity() > current.severity() {
                warn!(
                    agent = %self.id,
                    from = %current,
                    to = %intervention.action,
                    drawdown = intervention.drawdown,
                    "intervention escalated"
                );
                self.halt = Some(intervention.action);
            } else {
                debug!(agent = %self.id, action = %intervention.action, "already halted");
            }
            return Ok(());
        }

        let previous = self.machine.state();
        self.halt = Some(intervention.action);
        self.machine.transition(
            TraderState::Halted,
            &format!("{}: {}", intervention.action, intervention.reason),
        )?;
        warn!(
            agent = %self.id,
            action = %intervention.action,
            drawdown = intervention.drawdown,
            previous = %previous,
            "intervention received, trading halted"
        );

        if intervention.action == InterventionAction::ReduceExposure {
            self.reduce_exposure(ctx, publisher, subscription, inbox)
                .await?;
        }
        Ok(())
    }

    /// Protective sells of `reduce_fraction` of every position
    async fn reduce_exposure(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        subscription: &mut Subscription,
        inbox: &mut Inbox,
    ) -> Result<()> {
        let fraction = Decimal::try_from(self.config.reduce_fraction).unwrap_or(Decimal::ZERO);
        let prices = self.prices(&self.held_symbols()).await;

        let orders: Vec<OrderRequest> = self
            .portfolio
            .positions()
            .iter()
            .filter_map(|(symbol, held)| {
                let quantity = (Decimal::from(*held) * fraction).floor().to_u64()?;
                let price = prices.get(symbol)?;
                (quantity > 0).then(|| OrderRequest::new(None, symbol.clone(), Side::Sell, quantity, *price))
            })
            .collect();
        if orders.is_empty() {
            return Ok(());
        }

        let report = self
            .execute(ctx, publisher, subscription, inbox, orders)
            .await?;
        info!(
            agent = %self.id,
            filled = report.filled,
            rejected = report.rejected,
            cancelled = report.cancelled,
            "exposure reduced"
        );
        only_fatal(&self.id, "record_snapshot", self.record_snapshot(ctx, &prices).await)
    }

    fn on_recovery(&mut self, recovery: &Recovery) -> Result<()> {
        match self.machine.state() {
            TraderState::Halted => {
                self.halt = None;
                self.machine.transition(TraderState::Idle, "risk recovery")?;
                info!(agent = %self.id, drawdown = recovery.drawdown, "recovered, trading resumed");
            }
            TraderState::Evaluating => {
                self.machine
                    .transition(TraderState::Idle, "evaluation abandoned")?;
            }
            TraderState::Executing => {
                self.machine
                    .transition(TraderState::Settled, "execution interrupted")?;
                self.machine.transition(TraderState::Idle, "settled")?;
            }
            state => debug!(agent = %self.id, state = %state, "recovery while active"),
        }
        Ok(())
    }

    /// Submit `orders` one by one, stopping at the first pending control message
    async fn execute(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        subscription: &mut Subscription,
        inbox: &mut Inbox,
        orders: Vec<OrderRequest>,
    ) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        let total = orders.len();

        for (index, mut order) in orders.into_iter().enumerate() {
            if Self::control_pending(subscription, inbox) {
                report.cancelled = total - index;
                warn!(
                    agent = %self.id,
                    cancelled = report.cancelled,
                    "control message pending, remaining orders cancelled"
                );
                break;
            }

            order.quantity = match order.side {
                Side::Buy => order
                    .quantity
                    .min(rebalance::affordable(self.portfolio.cash(), order.reference_price)),
                Side::Sell => order.quantity.min(self.portfolio.position(&order.symbol)),
            };
            if order.quantity == 0 {
                report.skipped += 1;
                continue;
            }

            let tx = self.submit(ctx, publisher, &order).await?;
            if tx.is_filled() {
                report.filled += 1;
            } else {
                report.rejected += 1;
            }
        }
        Ok(report)
    }

    /// Record PENDING, submit under the order timeout, settle, then publish
    async fn submit(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        order: &OrderRequest,
    ) -> Result<Transaction> {
        let ledger = &ctx.ledger;
        let mut tx = Transaction::pending(order);
        let pending = &tx;
        ctx.with_retry("record_transaction", move || ledger.record_transaction(pending))
            .await?;

        let order_timeout = self.config.order_timeout();
        match timeout(order_timeout, self.broker.submit(order)).await {
            Ok(Ok(OrderOutcome::Filled { price })) => tx.fill(price)?,
            Ok(Ok(OrderOutcome::Rejected { reason })) => {
                tx.reject(QuorumError::OrderRejected(reason).to_string())?
            }
            Ok(Err(e)) => tx.reject(QuorumError::OrderRejected(e.to_string()).to_string())?,
            Err(_) => tx.reject(
                QuorumError::OrderTimeout(format!(
                    "no outcome within {}ms",
                    order_timeout.as_millis()
                ))
                .to_string(),
            )?,
        }

        let settled = &tx;
        ctx.with_retry("settle_transaction", move || ledger.settle_transaction(settled))
            .await?;
        self.portfolio.apply(&tx)?;

        if tx.is_filled() {
            info!(
                agent = %self.id,
                allocation_id = ?tx.allocation_id,
                order_id = %tx.transaction_id,
                symbol = %tx.symbol,
                side = %tx.side,
                quantity = tx.quantity,
                price = %tx.price,
                "order filled"
            );
        } else {
            warn!(
                agent = %self.id,
                allocation_id = ?tx.allocation_id,
                order_id = %tx.transaction_id,
                symbol = %tx.symbol,
                side = %tx.side,
                quantity = tx.quantity,
                reason = tx.reason.as_deref().unwrap_or(""),
                "order rejected"
            );
        }

        let sequence_id = publisher.next_sequence();
        let published = &tx;
        let result = ctx
            .with_retry("publish_transaction", move || {
                publisher.publish_sequenced(Topic::Transactions, sequence_id, published)
            })
            .await
            .map(|_| ());
        only_fatal(&self.id, "publish_transaction", result)?;
        Ok(tx)
    }

    async fn record_snapshot(
        &self,
        ctx: &AgentContext,
        prices: &BTreeMap<String, Decimal>,
    ) -> Result<()> {
        let Some(snapshot) = self.portfolio.snapshot(prices) else {
            warn!(agent = %self.id, "snapshot skipped, a held symbol has no price");
            return Ok(());
        };
        let ledger = &ctx.ledger;
        let recorded = &snapshot;
        ctx.with_retry("record_portfolio_snapshot", move || {
            ledger.record_portfolio_snapshot(recorded)
        })
        .await?;
        debug!(
            agent = %self.id,
            value = %snapshot.value,
            cash = %snapshot.cash,
            "portfolio snapshot recorded"
        );
        Ok(())
    }

    async fn revalue(&self, ctx: &AgentContext) -> Result<()> {
        let prices = self.prices(&self.held_symbols()).await;
        self.record_snapshot(ctx, &prices).await
    }

    async fn process(
        &mut self,
        ctx: &AgentContext,
        publisher: &Publisher,
        subscription: &mut Subscription,
        inbox: &mut Inbox,
        envelope: Envelope,
    ) -> Result<()> {
        let message = match envelope.decode() {
            Ok(message) => message,
            Err(e) => return only_fatal(&self.id, "dead_letter", ctx.dead_letter(&envelope, &e).await),
        };

        match self
            .handle(ctx, publisher, subscription, inbox, message)
            .await
        {
            Ok(()) => only_fatal(&self.id, "ack", ctx.ack(&envelope).await),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    agent = %self.id,
                    topic = %envelope.topic,
                    producer_id = %envelope.producer_id,
                    sequence_id = envelope.sequence_id,
                    state = %self.machine.state(),
                    error = %e,
                    "message could not be handled"
                );
                only_fatal(&self.id, "dead_letter", ctx.dead_letter(&envelope, &e).await)
            }
        }
    }
}

#[async_trait]
impl Agent for TraderAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn role(&self) -> AgentRole {
        AgentRole::Trader
    }

    async fn run(mut self, mut ctx: AgentContext) -> Result<()> {
        info!(
            agent = %self.id,
            horizon = %self.horizon,
            policy = ?self.rebalancer.policy(),
            "trader agent starting"
        );

        self.restore(&ctx).await?;
        let publisher = ctx.publisher().await?;
        let mut subscription = ctx.subscribe(Self::subscription_filter()).await?;
        let mut inbox = Inbox::new(INBOX_CAPACITY);

        let mut valuation_tick = interval(self.config.valuation_interval());
        valuation_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                delivery = subscription.recv() => {
                    collect_deliveries(delivery, &mut subscription, &mut inbox)?;
                    while let Some(envelope) = inbox.pop() {
                        self.process(&ctx, &publisher, &mut subscription, &mut inbox, envelope)
                            .await?;
                    }
                }
                _ = valuation_tick.tick() => {
                    let result = self.revalue(&ctx).await;
                    only_fatal(&self.id, "revalue", result)?;
                }
                _ = ctx.shutdown_rx().recv() => {
                    info!(agent = %self.id, state = %self.machine.state(), "shutting down");
                    break;
                }
            }
        }

        debug!(agent = %self.id, inbox = %inbox.stats(), "trader agent stopped");
        Ok(())
    }
}
