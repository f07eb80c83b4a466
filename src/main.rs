use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use swingbot::api::KrakenClient;
use swingbot::backtest::SimulationRunner;
use swingbot::config::AppConfig;
use swingbot::db::{has_min_weekly_history, SettingsStore, SqliteStore, TradeLedger};
use swingbot::execution::evaluate_pairs;
use swingbot::fetch::run_fetch_loop;
use swingbot::models::{now_secs, PairSettings, TradeFilter, TradeStatus, CANDLE_INTERVAL_SECS};
use swingbot::retention::run_retention;
use swingbot::strategy::SwingStrategy;

#[derive(Parser)]
#[command(name = "swingbot")]
#[command(about = "4h SMA crossover swing trading bot for Kraken spot pairs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll Kraken for new 4h candles until interrupted
    Fetch,

    /// Replay stored candles through the strategy without touching the ledger
    Simulate {
        /// Pair to simulate (default: every configured pair)
        pair: Option<String>,
    },

    /// Run one real decision per configured pair against the trade ledger
    Evaluate,

    /// Downsample old candles according to the retention tiers
    Purge,

    /// List recorded trades, newest first
    Trades {
        #[arg(long)]
        pair: Option<String>,

        /// OPEN or CLOSED
        #[arg(long)]
        status: Option<TradeStatus>,

        #[arg(long, default_value = "100")]
        limit: i64,

        #[arg(long, default_value = "0")]
        offset: i64,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List configured pairs and whether they have a week of history
    Pairs,

    /// Create or update a pair's settings
    SetPair {
        /// BASE/QUOTE, e.g. XBT/EUR
        pair: String,

        #[arg(long)]
        max_invest: f64,

        #[arg(long)]
        max_per_tx: f64,

        /// Fraction, e.g. 0.06 for 6% (0 disables)
        #[arg(long, default_value = "0")]
        take_profit: f64,

        /// Fraction, e.g. 0.03 for 3% (0 disables)
        #[arg(long, default_value = "0")]
        stop_loss: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // .env may carry RUST_LOG / LOG_JSON
    let dotenv = dotenvy::dotenv();
    setup_logging();

    tracing::info!("🚀 swingbot starting");
    if let Ok(path) = &dotenv {
        tracing::debug!("Loaded {}", path.display());
    }
    let config = AppConfig::load().context("Failed to load configuration")?;
    config.log_summary();

    let store = SqliteStore::new(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;

    let result = match cli.command {
        Command::Fetch => cmd_fetch(&config, &store).await,
        Command::Simulate { pair } => cmd_simulate(&config, &store, pair.as_deref()).await,
        Command::Evaluate => cmd_evaluate(&config, &store).await,
        Command::Purge => cmd_purge(&config, &store).await,
        Command::Trades {
            pair,
            status,
            limit,
            offset,
            json,
        } => {
            let filter = TradeFilter {
                pair,
                status,
                limit,
                offset,
            };
            cmd_trades(&store, &filter, json).await
        }
        Command::Pairs => cmd_pairs(&store).await,
        Command::SetPair {
            pair,
            max_invest,
            max_per_tx,
            take_profit,
            stop_loss,
        } => {
            let settings = PairSettings {
                pair,
                max_invest_fiat: max_invest,
                max_per_tx_fiat: max_per_tx,
                take_profit_pct: take_profit,
                stop_loss_pct: stop_loss,
            };
            cmd_set_pair(&store, &settings).await
        }
    };

    store.close().await;

    if let Err(ref e) = result {
        tracing::error!("❌ {:#}", e);
    }
    result
}

// ============================================================================
// Initialization
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("swingbot=info"));

    let json = std::env::var("LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves with the name of the first termination signal received
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_fetch(config: &AppConfig, store: &SqliteStore) -> Result<()> {
    let client = KrakenClient::new(config.kraken.base_url.as_str())
        .context("Failed to build Kraken client")?;

    let now = now_secs();
    tracing::debug!(
        "{}s until the next 4h boundary",
        CANDLE_INTERVAL_SECS - now.rem_euclid(CANDLE_INTERVAL_SECS)
    );

    let (tx, rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        let signal = shutdown_signal().await;
        tracing::info!("⚠️  Received {}, finishing the current pass...", signal);
        let _ = tx.send(true);
    });

    run_fetch_loop(store, &client, &config.fetch, rx).await;
    signals.abort();

    tracing::info!("👋 Fetch stopped");
    Ok(())
}

async fn cmd_simulate(config: &AppConfig, store: &SqliteStore, pair: Option<&str>) -> Result<()> {
    let runner = SimulationRunner::new(
        SwingStrategy::new(config.strategy),
        config.simulation.candles,
    );

    let reports = runner.run_all(store, pair).await?;
    let total: f64 = reports.iter().map(|r| r.metrics.total_pnl).sum();

    tracing::info!(
        "Simulation complete: {} pairs, total PnL {:.2}",
        reports.len(),
        total
    );
    Ok(())
}

async fn cmd_evaluate(config: &AppConfig, store: &SqliteStore) -> Result<()> {
    let strategy = SwingStrategy::new(config.strategy);
    let report = evaluate_pairs(store, &strategy).await?;

    for (pair, error) in &report.failures {
        tracing::warn!("  {} failed: {}", pair, error);
    }
    Ok(())
}

async fn cmd_purge(config: &AppConfig, store: &SqliteStore) -> Result<()> {
    let reports = run_retention(store, &config.retention, now_secs())
        .await
        .context("Retention pass failed")?;

    let removed: u64 = reports.iter().map(|r| r.removed).sum();
    tracing::info!("🧹 Purge complete: {} pairs, {} candles removed", reports.len(), removed);
    Ok(())
}

async fn cmd_trades(store: &SqliteStore, filter: &TradeFilter, json: bool) -> Result<()> {
    let trades = store.list_trades(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&trades)?);
        return Ok(());
    }

    println!(
        "{:>5}  {:<10} {:<4} {:<6} {:>14} {:>14} {:>12} {:>10}  {}",
        "ID", "PAIR", "SIDE", "STATUS", "ENTRY", "EXIT", "AMOUNT", "PNL", "OPENED"
    );
    for t in &trades {
        println!(
            "{:>5}  {:<10} {:<4} {:<6} {:>14.6} {:>14} {:>12.6} {:>10}  {}",
            t.id,
            t.pair,
            t.side.as_str(),
            t.status.as_str(),
            t.entry_price,
            t.exit_price.map(|p| format!("{:.6}", p)).unwrap_or_else(|| "-".into()),
            t.amount,
            t.pnl.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".into()),
            t.opened_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn cmd_pairs(store: &SqliteStore) -> Result<()> {
    let now = now_secs();
    for pair in store.pair_list().await? {
        let settings = store.pair_settings(&pair).await?;
        let ready = has_min_weekly_history(store, &pair, now).await?;
        match settings {
            Some(s) => println!(
                "{:<10} max_invest={:.2} max_per_tx={:.2} tp={} sl={} weekly_history={}",
                s.pair, s.max_invest_fiat, s.max_per_tx_fiat, s.take_profit_pct, s.stop_loss_pct, ready
            ),
            None => println!("{:<10} (no settings) weekly_history={}", pair, ready),
        }
    }
    Ok(())
}

async fn cmd_set_pair(store: &SqliteStore, settings: &PairSettings) -> Result<()> {
    store.upsert_pair_settings(settings).await?;
    tracing::info!("✅ Saved settings for {}", settings.pair);
    Ok(())
}
