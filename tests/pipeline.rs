use chrono::Utc;
use quorum::adapters::{FundamentalSnapshot, StaticMarketData};
use quorum::bus::{BusMessage, InMemoryBus, Publisher, Topic, TopicFilter};
use quorum::config::{AppConfig, PaperBrokerConfig, RiskConfig, TraderConfig};
use quorum::domain::{
    Allocation, Horizon, Intervention, InterventionAction, Rationale, SymbolTarget,
};
use quorum::ledger::{InMemoryLedger, Ledger, RetryPolicy};
use quorum::runtime::{self, Backend, Runtime};
use quorum::Result;
use rust_decimal_macros::dec;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

struct Pipeline {
    bus: Arc<InMemoryBus>,
    ledger: Arc<InMemoryLedger>,
    market: Arc<StaticMarketData>,
}

impl Pipeline {
    async fn new() -> Self {
        let market = Arc::new(StaticMarketData::new());
        market
            .insert(FundamentalSnapshot {
                symbol: "AAPL".into(),
                price: dec!(100),
                ..FundamentalSnapshot::default()
            })
            .await;
        Self {
            bus: Arc::new(InMemoryBus::new()),
            ledger: Arc::new(InMemoryLedger::new()),
            market,
        }
    }

    fn runtime(&self) -> Runtime {
        let backend = Backend {
            bus: self.bus.clone(),
            ledger: self.ledger.clone(),
        };
        Runtime::new(backend, RetryPolicy::default())
    }

    async fn publisher(&self, producer_id: &str) -> Publisher {
        Publisher::new(self.bus.clone(), producer_id).await.unwrap()
    }

    async fn position(&self, symbol: &str) -> i64 {
        self.ledger
            .positions()
            .await
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    async fn transactions_published(&self) -> usize {
        self.bus
            .messages(&TopicFilter::Exact(Topic::Transactions))
            .await
            .len()
    }
}

fn app_config() -> AppConfig {
    AppConfig {
        symbols: vec!["AAPL".into()],
        horizon: Horizon::ShortTerm,
        trader: TraderConfig {
            initial_cash: dec!(100000),
            valuation_interval_ms: 20,
            paper: PaperBrokerConfig {
                slippage_bps: 0,
                reject_probability: 0.0,
            },
            ..TraderConfig::default()
        },
        risk: RiskConfig {
            evaluation_interval_ms: 20,
            history_limit: 10_000,
            ..RiskConfig::default()
        },
        ..AppConfig::default()
    }
}

fn allocation(targets: &[(&str, f64)]) -> Allocation {
    Allocation {
        allocation_id: Uuid::new_v4(),
        cycle_id: 1,
        targets: targets
            .iter()
            .map(|(symbol, weight)| SymbolTarget {
                symbol: symbol.to_string(),
                target_weight: *weight,
                net_vote: *weight,
            })
            .collect(),
        rationale: Rationale::default(),
        generated_at: Utc::now(),
    }
}

fn start(runtime: Runtime) -> (broadcast::Sender<()>, JoinHandle<Result<()>>) {
    let shutdown = runtime.shutdown_handle();
    (shutdown, tokio::spawn(runtime.run_until_shutdown()))
}

async fn stop(shutdown: broadcast::Sender<()>, handle: JoinHandle<Result<()>>) {
    let _ = shutdown.send(());
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("agents did not stop")
        .unwrap()
        .unwrap();
}

/// Poll `check` until it holds or the wait expires
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn queued_intervention_preempts_earlier_allocation() {
    let p = Pipeline::new().await;
    let config = app_config();

    let manager = p.publisher("manager").await;
    let risk = p.publisher("risk").await;
    let alloc = allocation(&[("AAPL", 1.0)]);
    manager.publish(Topic::Allocations, &alloc).await.unwrap();
    risk.publish(
        Topic::RiskIntervention,
        &Intervention {
            action: InterventionAction::Halt,
            reason: "drawdown 16.00% at or above 15.00%".into(),
            drawdown: 16.0,
            issued_at: Utc::now(),
        },
    )
    .await
    .unwrap();

    let trader = runtime::trader(&config, &p.market);
    let mut state = trader.state_receiver();
    let mut rt = p.runtime();
    rt.spawn(trader);
    let (shutdown, handle) = start(rt);

    tokio::time::timeout(WAIT, state.wait_for(|s| s.is_halted()))
        .await
        .expect("trader never halted")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!p.ledger.has_transactions_for(alloc.allocation_id).await.unwrap());
    assert_eq!(p.transactions_published().await, 0);
    assert_eq!(p.position("AAPL").await, 0);
    assert!(state.borrow().is_halted());

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn twelve_percent_drawdown_reduces_exposure() {
    let p = Pipeline::new().await;
    let config = app_config();

    let trader = runtime::trader(&config, &p.market);
    let mut state = trader.state_receiver();
    let mut rt = p.runtime();
    rt.spawn(trader);
    rt.spawn(runtime::risk(&config));
    let (shutdown, handle) = start(rt);

    eventually("an opening valuation", || async {
        !p.ledger.portfolio_history(1).await.unwrap().is_empty()
    })
    .await;

    // 100k cash all in AAPL at 100: 995 shares after the cash buffer
    let manager = p.publisher("manager").await;
    manager
        .publish(Topic::Allocations, &allocation(&[("AAPL", 1.0)]))
        .await
        .unwrap();
    eventually("the allocation fill", || async { p.position("AAPL").await == 995 }).await;

    // 500 + 995 * 88 = 88_060, about 11.9% below the 100k peak
    p.market.set_price("AAPL", dec!(88)).await.unwrap();

    tokio::time::timeout(WAIT, state.wait_for(|s| s.is_halted()))
        .await
        .expect("trader never halted")
        .unwrap();
    eventually("the protective sell", || async { p.position("AAPL").await == 498 }).await;

    let risk_state = p.ledger.load_risk_state().await.unwrap();
    assert!(risk_state.threshold_breached);
    assert_eq!(risk_state.breach_action, Some(InterventionAction::ReduceExposure));
    assert!(risk_state.current_drawdown > 10.0 && risk_state.current_drawdown < 15.0);

    let interventions = p
        .bus
        .messages(&TopicFilter::Exact(Topic::RiskIntervention))
        .await;
    assert_eq!(interventions.len(), 1);
    match interventions[0].decode().unwrap() {
        BusMessage::Intervention(intervention) => {
            assert_eq!(intervention.action, InterventionAction::ReduceExposure);
        }
        other => panic!("unexpected message {:?}", other),
    }
    assert!(p
        .bus
        .messages(&TopicFilter::Exact(Topic::RiskRecovery))
        .await
        .is_empty());

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn duplicate_allocation_executes_once_across_restarts() {
    let p = Pipeline::new().await;
    let config = app_config();
    let manager = p.publisher("manager").await;
    // fully invested leaves 500 cash, so a second execution would top up AAPL
    let alloc = allocation(&[("AAPL", 1.0)]);

    let mut rt = p.runtime();
    rt.spawn(runtime::trader(&config, &p.market));
    let (shutdown, handle) = start(rt);

    manager.publish(Topic::Allocations, &alloc).await.unwrap();
    eventually("the first execution", || async { p.position("AAPL").await == 995 }).await;

    // redelivery under a new sequence id
    manager.publish(Topic::Allocations, &alloc).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(p.transactions_published().await, 1);
    stop(shutdown, handle).await;

    // a fresh trader only has the ledger to go on
    let mut rt = p.runtime();
    rt.spawn(runtime::trader(&config, &p.market));
    let (shutdown, handle) = start(rt);
    manager.publish(Topic::Allocations, &alloc).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(p.transactions_published().await, 1);
    assert_eq!(p.position("AAPL").await, 995);
    stop(shutdown, handle).await;
}

#[tokio::test]
async fn analysts_feed_manager_cycles() {
    let fixture = concat!(env!("CARGO_MANIFEST_DIR"), "/data/market_data.json");
    let market = Arc::new(StaticMarketData::from_file(fixture).unwrap());
    let bus = Arc::new(InMemoryBus::new());
    let ledger = Arc::new(InMemoryLedger::new());

    let mut config = AppConfig {
        horizon: Horizon::ShortTerm,
        ..AppConfig::default()
    };
    config.manager.aggregation_window_ms = 200;
    config.manager.min_quorum = 3;

    let mut rt = Runtime::new(
        Backend {
            bus: bus.clone(),
            ledger: ledger.clone(),
        },
        RetryPolicy::default(),
    );
    runtime::spawn_all(&mut rt, &config, &market);
    let (shutdown, handle) = start(rt);

    eventually("a closed cycle", || async {
        ledger.last_cycle_id().await.unwrap() >= 1
    })
    .await;

    let signals = bus.messages(&TopicFilter::AllSignals).await;
    assert!(!signals.is_empty());
    assert!(signals
        .iter()
        .all(|envelope| matches!(envelope.decode(), Ok(BusMessage::Signal(_)))));
    let analyst_ids: std::collections::BTreeSet<&str> =
        signals.iter().map(|e| e.producer_id.as_str()).collect();
    assert!(analyst_ids.iter().all(|id| id.ends_with("-analyst")));

    stop(shutdown, handle).await;
}
