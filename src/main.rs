use anyhow::{bail, Context};
use clap::Parser;
use quorum::adapters::PgLedger;
use quorum::cli::{Cli, Commands};
use quorum::config::{AppConfig, BusBackend};
use quorum::ledger::RetryPolicy;
use quorum::runtime::{self, Backend, Runtime};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config_dir)
        .with_context(|| format!("loading configuration from {}", cli.config_dir.display()))?;
    if let Err(errors) = config.validate() {
        bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }

    runtime::init_logging(&config.logging);

    if matches!(cli.command, Commands::Migrate) {
        let store = PgLedger::new(&config.database.url, config.database.max_connections).await?;
        store.migrate().await?;
        info!("migrations applied");
        return Ok(());
    }
    if cli.command.is_single_role() && config.bus.backend == BusBackend::Memory {
        warn!("in-memory bus selected: this process will not see other agents' messages");
    }

    let backend = Backend::connect(&config).await?;
    let market = runtime::load_market_data(&config)?;
    let mut rt = Runtime::new(backend, RetryPolicy::from_config(&config.retry));

    match cli.command {
        Commands::Migrate => return Ok(()),
        Commands::Analyst { profile } => rt.spawn(runtime::analyst(profile, &config, &market)),
        Commands::Manager => rt.spawn(runtime::manager(&config, &market)),
        Commands::Trader => rt.spawn(runtime::trader(&config, &market)),
        Commands::Risk => rt.spawn(runtime::risk(&config)),
        Commands::RunAll => runtime::spawn_all(&mut rt, &config, &market),
    }

    info!(
        agents = rt.agent_count(),
        horizon = %config.horizon,
        symbols = config.symbols.len(),
        "quorum started"
    );
    rt.run_until_shutdown().await?;
    Ok(())
}
