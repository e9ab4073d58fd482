use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use surgebot::api::BithumbClient;
use surgebot::backtest::DEFAULT_INITIAL_CASH;
use surgebot::config::{BotConfig, Credentials};
use surgebot::exchange::{Ledger, LiveExecution, SimulatedExchange};
use surgebot::execution::PositionManager;
use surgebot::persistence::{JsonFileStore, MemoryStore, RedisSnapshotStore, SnapshotStore};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "surgebot.toml";
/// Cycles between periodic stats lines
const STATS_EVERY: u64 = 10;

#[derive(Parser)]
#[command(name = "surgebot")]
#[command(about = "Volume-surge / golden-cross spot trading bot for Bithumb KRW markets", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file; missing is fine
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Trade live with the account in BITHUMB_ACCESS_KEY / BITHUMB_SECRET_KEY
    Run,

    /// Trade a simulated ledger against live prices
    Paper {
        /// Starting KRW balance
        #[arg(long, default_value_t = DEFAULT_INITIAL_CASH)]
        cash: f64,
    },

    /// Rebuild saved positions from the exchange once, then print stats
    Reconcile,

    /// Print the saved snapshot
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = BotConfig::load(Some(cli.config.as_path()))
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_live(config).await,
        Command::Paper { cash } => run_paper(config, cash).await,
        Command::Reconcile => reconcile_once(config).await,
        Command::Stats => print_saved_stats(config).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("surgebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Redis when `storage.redis_url` is set, the JSON file otherwise
async fn open_store(config: &BotConfig) -> anyhow::Result<Arc<dyn SnapshotStore>> {
    if let Some(url) = &config.storage.redis_url {
        let store = RedisSnapshotStore::new(url).await.map_err(|e| anyhow!(e))?;
        return Ok(Arc::new(store));
    }

    tracing::info!("💾 Saving state to {}", config.storage.data_file);
    Ok(Arc::new(JsonFileStore::new(
        &config.storage.data_file,
        config.storage.max_backups,
    )))
}

fn live_client(config: &BotConfig) -> anyhow::Result<Arc<BithumbClient>> {
    let credentials = Credentials::from_env()?;
    Ok(Arc::new(BithumbClient::new(&config.api, Some(credentials))?))
}

fn log_config(config: &BotConfig) {
    tracing::info!("📊 Configuration:");
    tracing::info!("  Buy Amount: {:.0} KRW", config.buy_amount);
    tracing::info!(
        "  Exit: {:?} (profit {:.1}%, loss {:.1}%, trailing {:.1}%)",
        config.exit_policy,
        config.profit_ratio * 100.0,
        config.loss_ratio * 100.0,
        config.trailing_ratio * 100.0
    );
    tracing::info!(
        "  Signal: value {}/{} ({}x / {}x), MA {}/{} on {}m candles",
        config.volume.short,
        config.volume.long,
        config.volume.short_threshold,
        config.volume.long_threshold,
        config.moving_average.short,
        config.moving_average.long,
        config.candle_unit
    );
    tracing::info!(
        "  Scan: top {} markets every {}s",
        config.scan_limit,
        config.cycle_interval_secs
    );
}

// ============================================================================
// Commands
// ============================================================================

async fn run_live(config: BotConfig) -> anyhow::Result<()> {
    tracing::info!("🚀 surgebot starting (live)");
    log_config(&config);

    let client = live_client(&config)?;
    let execution = Arc::new(LiveExecution::new(client.clone())?);
    let store = open_store(&config).await?;

    let mut manager = PositionManager::restore(config, client, execution, store).await;
    startup_reconcile(&mut manager).await;

    trading_loop(&mut manager, None).await;
    Ok(())
}

async fn run_paper(config: BotConfig, cash: f64) -> anyhow::Result<()> {
    tracing::info!("🚀 surgebot starting (paper, {:.0} KRW)", cash);
    log_config(&config);

    // prices only; no account access
    let client = Arc::new(BithumbClient::new(&config.api, None)?);
    let exchange = Arc::new(SimulatedExchange::new(
        "paper",
        client.clone(),
        Ledger::new(cash, config.fees()),
    ));

    let mut manager = PositionManager::new(
        config,
        client,
        exchange.clone(),
        Arc::new(MemoryStore::new()),
    );

    trading_loop(&mut manager, Some(exchange.clone())).await;
    tracing::info!("💼 Paper equity: {:.0} KRW", exchange.equity().await);
    Ok(())
}

async fn reconcile_once(config: BotConfig) -> anyhow::Result<()> {
    let client = live_client(&config)?;
    let execution = Arc::new(LiveExecution::new(client.clone())?);
    let store = open_store(&config).await?;

    let mut manager = PositionManager::restore(config, client, execution, store).await;
    let summary = manager.reconcile().await?;
    tracing::info!(
        "Examined {} markets, {} positions changed, {} skipped",
        summary.examined,
        summary.changed(),
        summary.skipped
    );

    println!("{}", serde_json::to_string_pretty(&manager.stats())?);
    Ok(())
}

async fn print_saved_stats(config: BotConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let Some(snapshot) = store.load().await.map_err(|e| anyhow!(e))? else {
        println!("No saved state");
        return Ok(());
    };

    println!("Saved at:     {}", snapshot.saved_at);
    println!("Running since {}", snapshot.stats.started_at);
    println!(
        "Trades:       {} (W {} / L {}, {:.1}%)",
        snapshot.stats.trades,
        snapshot.stats.wins,
        snapshot.stats.losses,
        snapshot.stats.win_rate()
    );
    println!("Profit:       {:+.0} KRW", snapshot.stats.total_profit);
    println!("Positions:    {}", snapshot.positions.len());
    for (market, pos) in &snapshot.positions {
        println!(
            "  {:<12} {:?} {:.8} @ {:.2}{}",
            market,
            pos.state,
            pos.quantity,
            pos.entry_price,
            if pos.recovered { " (recovered)" } else { "" }
        );
    }
    Ok(())
}

// ============================================================================
// Trading Loop
// ============================================================================

async fn startup_reconcile(manager: &mut PositionManager) {
    tracing::info!("🔄 Reconciling saved positions with the exchange...");
    match manager.reconcile().await {
        Ok(summary) if summary.skipped > 0 => tracing::warn!(
            "{} positions adjusted at startup, {} markets left for the next pass",
            summary.changed(),
            summary.skipped
        ),
        Ok(summary) if summary.changed() > 0 => {
            tracing::info!("✅ {} positions adjusted at startup", summary.changed())
        }
        Ok(_) => tracing::info!("✅ Saved positions match the exchange"),
        Err(e) => tracing::error!("Startup reconciliation failed, continuing with saved state: {}", e),
    }
}

fn log_stats(manager: &PositionManager) {
    let stats = manager.stats();
    tracing::info!(
        "📊 {} open | trades {} (W {} / L {}, {:.1}%) | profit {:+.0} KRW | up {}m | {}",
        stats.positions.len(),
        stats.trades,
        stats.wins,
        stats.losses,
        stats.win_rate,
        stats.total_profit,
        stats.runtime_minutes,
        stats.last_activity
    );
}

/// Run cycles every `cycle_interval_secs` until Ctrl+C.
///
/// With a paper exchange, resting asks are matched against live prices
/// before each cycle.
async fn trading_loop(manager: &mut PositionManager, paper: Option<Arc<SimulatedExchange>>) {
    let mut ticker = interval_at(Instant::now(), manager.config().cycle_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!("Press Ctrl+C to stop...");
    let mut cycles = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("⚠️  Received Ctrl+C, shutting down...");
                break;
            }
            _ = ticker.tick() => {}
        }

        if let Some(exchange) = &paper {
            let filled = exchange.match_resting_orders().await;
            if filled > 0 {
                tracing::info!("📬 {} paper orders filled", filled);
            }
        }

        cycles += 1;
        if !manager.run_cycle().await {
            tracing::warn!("Cycle {} did not complete", cycles);
        }
        if cycles % STATS_EVERY == 0 {
            log_stats(manager);
        }
    }

    log_stats(manager);
    tracing::info!("👋 surgebot stopped");
}
