//! Process wiring: logging, backends and agent tasks

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapters::{
    Broker, MarketDataProvider, PaperBroker, PgBus, PgLedger, SentimentProvider, StaticMarketData,
};
use crate::agents::{
    Agent, AgentContext, AnalystAgent, ManagerAgent, Profile, RiskAgent, TraderAgent,
};
use crate::bus::{InMemoryBus, SignalBus};
use crate::config::{AppConfig, BusBackend, BusConfig, LoggingConfig};
use crate::error::Result;
use crate::ledger::{InMemoryLedger, Ledger, RetryPolicy};

/// Grace period for agents to stop after shutdown is broadcast
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Initialize console logging plus a daily rolling file under `QUORUM_LOG_DIR`
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},quorum=debug,sqlx=warn", config.level))
    });

    let log_dir = std::env::var("QUORUM_LOG_DIR").ok();

    // rolling::daily panics when the first file cannot be created, so check the directory first
    let file_layer = log_dir.as_deref().and_then(|dir| {
        if let Err(e) = writable(dir) {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir, e
            );
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(dir, "quorum.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        Box::leak(Box::new(guard));
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (console_text, console_json) = if config.json {
        (
            None,
            Some(tracing_subscriber::fmt::layer().json().with_target(true)),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/quorum.log", dir);
    }
}

fn writable(dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let marker = Path::new(dir).join(".quorum_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)?;
    let _ = std::fs::remove_file(&marker);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Bus and ledger shared by every agent of the process
#[derive(Clone)]
pub struct Backend {
    pub bus: Arc<dyn SignalBus>,
    pub ledger: Arc<dyn Ledger>,
}

impl Backend {
    pub fn in_memory() -> Self {
        Self {
            bus: Arc::new(InMemoryBus::new()),
            ledger: Arc::new(InMemoryLedger::new()),
        }
    }

    /// In-memory backend whose bus log is bounded per `config.bus.memory_retention`
    pub fn in_memory_bounded(config: &BusConfig) -> Self {
        Self {
            bus: Arc::new(InMemoryBus::with_retention(config.memory_retention)),
            ledger: Arc::new(InMemoryLedger::new()),
        }
    }

    /// Connect per `config.bus.backend`; postgres runs pending migrations first
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        match config.bus.backend {
            BusBackend::Memory => {
                info!(
                    retention = config.bus.memory_retention,
                    "using in-memory bus and ledger"
                );
                Ok(Self::in_memory_bounded(&config.bus))
            }
            BusBackend::Postgres => {
                let store =
                    PgLedger::new(&config.database.url, config.database.max_connections).await?;
                store.migrate().await?;
                let bus = PgBus::new(store.pool().clone(), &config.bus);
                info!("using postgres bus and ledger");
                Ok(Self {
                    bus: Arc::new(bus),
                    ledger: Arc::new(store),
                })
            }
        }
    }
}

/// Market data for analysts, the manager and the paper broker
pub fn load_market_data(config: &AppConfig) -> Result<Arc<StaticMarketData>> {
    match &config.analyst.market_data_path {
        Some(path) => {
            let market = StaticMarketData::from_file(path)?;
            info!(path = %path, "market data loaded");
            Ok(Arc::new(market))
        }
        None => {
            warn!("no analyst.market_data_path configured, analysts will find no data");
            Ok(Arc::new(StaticMarketData::new()))
        }
    }
}

/// Agent tasks sharing one backend and one shutdown broadcast
pub struct Runtime {
    backend: Backend,
    retry: RetryPolicy,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(String, JoinHandle<Result<()>>)>,
}

impl Runtime {
    pub fn new(backend: Backend, retry: RetryPolicy) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            backend,
            retry,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Handle for triggering shutdown from elsewhere
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn spawn<A: Agent>(&mut self, agent: A) {
        let id = agent.id().to_string();
        let role = agent.role();
        let ctx = AgentContext::new(
            id.clone(),
            self.backend.bus.clone(),
            self.backend.ledger.clone(),
            self.retry.clone(),
            self.shutdown_tx.subscribe(),
        );
        let agent_id = id.clone();
        let jh = tokio::spawn(async move {
            let result = agent.run(ctx).await;
            if let Err(e) = &result {
                error!(agent = %agent_id, error = %e, "agent exited with error");
            }
            result
        });
        info!(agent = %id, role = %role, "agent spawned");
        self.handles.push((id, jh));
    }

    pub fn agent_count(&self) -> usize {
        self.handles.len()
    }

    /// Run until a shutdown signal arrives or every agent has stopped, then broadcast
    /// shutdown and wait out the grace period.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let Runtime {
            shutdown_tx,
            handles,
            ..
        } = self;

        let (ids, mut tasks): (Vec<String>, Vec<JoinHandle<Result<()>>>) =
            handles.into_iter().unzip();

        let stx = shutdown_tx.clone();
        let signal_task = tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            let _ = stx.send(());
        });

        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut first_failure = None;
        let mut finished = vec![false; tasks.len()];

        while finished.iter().any(|done| !done) {
            let pending = tasks
                .iter_mut()
                .enumerate()
                .filter(|(i, _)| !finished[*i])
                .map(|(i, jh)| async move { (i, jh.await) });
            tokio::select! {
                (i, outcome) = first_completed(pending) => {
                    finished[i] = true;
                    match outcome {
                        Ok(Ok(())) => info!(agent = %ids[i], "agent stopped"),
                        Ok(Err(e)) => {
                            // one fatal agent brings the process down
                            if first_failure.is_none() {
                                first_failure = Some(e);
                            }
                            let _ = shutdown_tx.send(());
                        }
                        Err(e) => {
                            error!(agent = %ids[i], error = %e, "agent task panicked");
                            let _ = shutdown_tx.send(());
                        }
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!("waiting for agents to finish...");
        for (i, jh) in tasks.into_iter().enumerate() {
            if finished[i] {
                continue;
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, jh).await {
                Ok(Ok(Err(e))) if first_failure.is_none() => first_failure = Some(e),
                Ok(_) => {}
                Err(_) => warn!(agent = %ids[i], "agent did not stop within the grace period"),
            }
        }
        signal_task.abort();

        info!("shutdown complete");
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn first_completed<F, T>(futures: impl Iterator<Item = F>) -> T
where
    F: std::future::Future<Output = T>,
{
    let (output, _, _) = futures::future::select_all(futures.map(Box::pin)).await;
    output
}

pub fn analyst(
    profile: Profile,
    config: &AppConfig,
    market: &Arc<StaticMarketData>,
) -> AnalystAgent<Box<dyn crate::agents::analyst::Strategy>> {
    let provider: Arc<dyn MarketDataProvider> = market.clone();
    let sentiment: Arc<dyn SentimentProvider> = market.clone();
    AnalystAgent::new(
        profile.producer_id(),
        profile.strategy(),
        config.symbols.clone(),
        config.horizon,
        config.analyst.interval(config.horizon),
        provider,
    )
    .with_sentiment(sentiment)
}

pub fn manager(config: &AppConfig, market: &Arc<StaticMarketData>) -> ManagerAgent {
    ManagerAgent::new(config.manager.clone(), market.clone())
}

pub fn trader(config: &AppConfig, market: &Arc<StaticMarketData>) -> TraderAgent {
    let broker: Arc<dyn Broker> = Arc::new(PaperBroker::new(
        market.clone(),
        config.trader.paper.clone(),
    ));
    TraderAgent::new(config.horizon, config.trader.clone(), broker, market.clone())
}

pub fn risk(config: &AppConfig) -> RiskAgent {
    RiskAgent::new(config.risk.clone())
}

/// Every role in one process
pub fn spawn_all(runtime: &mut Runtime, config: &AppConfig, market: &Arc<StaticMarketData>) {
    for profile in Profile::ALL {
        runtime.spawn(analyst(profile, config, market));
    }
    runtime.spawn(manager(config, market));
    runtime.spawn(trader(config, market));
    runtime.spawn(risk(config));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runtime_stops_on_shutdown_broadcast() {
        let config = AppConfig::default();
        let market = Arc::new(StaticMarketData::new());
        let mut runtime = Runtime::new(Backend::in_memory(), RetryPolicy::default());
        spawn_all(&mut runtime, &config, &market);
        assert_eq!(runtime.agent_count(), 8);

        let shutdown = runtime.shutdown_handle();
        let run = tokio::spawn(runtime.run_until_shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("runtime did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
