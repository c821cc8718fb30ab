//! Spot Trading Bot
//!
//! Buys on external signals and manages every position with fee-aware
//! take-profit / stop-loss, trailing exits and session-wide risk limits.

mod db;
mod engine;
mod error;
mod exchange;
mod models;
mod signals;
mod trading;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::db::Database;
use crate::engine::{ControlCommand, ControlHandle, TradeCycleCoordinator};
use crate::error::ErrorCategory;
use crate::exchange::{BinanceMarketClient, MarketData, PaperGateway, RetryPolicy};
use crate::signals::{SignalDirectory, SignalQueue};
use crate::trading::{Credentials, PositionLedger, TradingConfig};

const SIGNAL_QUEUE_CAPACITY: usize = 256;

/// Spot-market trading bot CLI.
#[derive(Parser)]
#[command(name = "spottrader")]
#[command(about = "Signal-driven spot trading with trailing exits and session limits", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./spottrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Cycle interval in seconds
        #[arg(short, long, env = "CYCLE_INTERVAL", default_value = "10")]
        interval: u64,

        /// Directory watched for signal files
        #[arg(short, long, env = "SIGNALS_DIR", default_value = "signals")]
        signals_dir: PathBuf,

        /// Signal directory poll interval in seconds
        #[arg(long, env = "SIGNALS_POLL", default_value = "5")]
        signals_poll: u64,

        /// Simulated quote balance for paper fills (unlimited if unset)
        #[arg(long, env = "PAPER_BALANCE")]
        paper_balance: Option<Decimal>,

        /// Give up on a failing exchange call after this many seconds
        #[arg(long, env = "RETRY_SECS", default_value = "30")]
        retry_secs: u64,

        /// Ignore operator commands on stdin
        #[arg(long)]
        no_stdin: bool,
    },

    /// Show open positions with their last marks
    Status,

    /// Show recently closed positions
    History {
        /// Number of positions to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the process environment still applies.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            interval,
            signals_dir,
            signals_poll,
            paper_balance,
            retry_secs,
            no_stdin,
        } => {
            let config = load_config()?;
            let credentials = Credentials::from_env()
                .map_err(|e| anyhow::anyhow!("[{}] {}", ErrorCategory::Credential, e))?;

            let db = Database::new(&cli.database).await?;
            let ledger = PositionLedger::new(db, config.fee_schedule());

            let market: Arc<dyn MarketData> = Arc::new(
                BinanceMarketClient::new(credentials.api_key.clone())?
                    .with_retry_policy(RetryPolicy::with_max_elapsed(Duration::from_secs(retry_secs))),
            );
            let mut gateway = PaperGateway::new(market.clone(), config.fee_schedule());
            if let Some(balance) = paper_balance {
                gateway = gateway.with_balance(balance);
            }
            let gateway = Arc::new(gateway);

            let (signal_tx, signal_queue) = SignalQueue::new(SIGNAL_QUEUE_CAPACITY);

            println!("\n=== Spot Trading Bot ===");
            println!("Pair:             {}", config.pair_with);
            println!("Trade size:       {} {}", config.trade_total, config.pair_with);
            println!("Slots:            {}", config.trade_slots);
            println!("Cycle interval:   {}s", interval);
            println!("Signals dir:      {}", signals_dir.display());
            println!("Mode:             PAPER (fills at market price)");
            println!("\nCommands: pause | resume | sell-all | sell SYMBOL | tp [SYMBOL] PCT | sl [SYMBOL] PCT | stop");
            println!("Press Ctrl+C to stop.\n");

            let mut coordinator = TradeCycleCoordinator::new(
                config.clone(),
                ledger,
                market,
                gateway.clone(),
                signal_queue,
                Duration::from_secs(interval),
            );
            let shutdown = coordinator.shutdown_signal();

            let directory = SignalDirectory::new(signals_dir, &config.pair_with);
            info!(dir = %directory.path().display(), "Watching signal directory");
            let importer = directory.spawn(
                signal_tx,
                Duration::from_secs(signals_poll.max(1)),
                shutdown.clone(),
            );
            if !no_stdin {
                spawn_operator_channel(coordinator.control_handle());
            }

            let outcome = coordinator.run().await;

            shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
            importer.abort();

            if let Some(balance) = gateway.balance().await {
                info!(balance = %balance, pair = %config.pair_with, "Final paper balance");
            }

            if let Err(e) = outcome {
                error!(error = %e, "Engine stopped");
                return Err(e);
            }
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let positions = db.fetch_all_open().await?;

            if positions.is_empty() {
                println!("No open positions.");
                return Ok(());
            }

            println!(
                "\n{:<14} {:>14} {:>14} {:>14} {:>9} {:>12} {:>8}",
                "SYMBOL", "VOLUME", "ENTRY", "MARK", "CHANGE", "P&L", "TRAIL"
            );
            println!("{}", "-".repeat(91));

            let mut total = Decimal::ZERO;
            for pos in &positions {
                total += pos.profit_dollars;
                println!(
                    "{:<14} {:>14} {:>14} {:>14} {:>8}% {:>12} {:>8}",
                    truncate(&pos.symbol, 14),
                    pos.volume.round_dp(6),
                    pos.entry_price.round_dp(8),
                    pos.current_price.round_dp(8),
                    pos.change_pct.round_dp(2),
                    pos.profit_dollars.round_dp(4),
                    if pos.trailing_active { "armed" } else { "-" }
                );
            }
            println!("\nOpen positions:   {}", positions.len());
            println!("Unrealized P&L:   {}", total.round_dp(4));
        }

        Commands::History { limit } => {
            let db = Database::new(&cli.database).await?;
            let closed = db.fetch_closed(limit).await?;

            if closed.is_empty() {
                println!("No closed positions yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<14} {:<22} {:>9} {:>12} {:>10}",
                "CLOSED", "SYMBOL", "REASON", "CHANGE", "P&L", "HELD"
            );
            println!("{}", "-".repeat(92));

            for pos in &closed {
                let closed_at = pos
                    .close_time
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let reason = pos.close_reason.map(|r| r.as_str()).unwrap_or("-");
                println!(
                    "{:<20} {:<14} {:<22} {:>8}% {:>12} {:>9}m",
                    closed_at,
                    truncate(&pos.symbol, 14),
                    reason,
                    pos.change_pct.round_dp(2),
                    pos.profit_dollars.round_dp(4),
                    pos.holding_duration().num_minutes()
                );
            }
        }

        Commands::Config => {
            let config = load_config()?;

            println!("\n=== Trading Configuration ===\n");
            println!("Entries:");
            println!("  Pair With:            {}", config.pair_with);
            println!("  Trade Total:          {}", config.trade_total);
            println!("  Trade Slots:          {}", config.trade_slots);
            println!("  Session Capital:      {}", config.session_capital());
            match config.max_portfolio_exposure {
                Some(cap) => println!("  Max Exposure:         {}", cap),
                None => println!("  Max Exposure:         none"),
            }

            println!("\nExits:");
            println!("  Take Profit:          {}%", config.take_profit_pct);
            println!("  Stop Loss:            {}%", config.stop_loss_pct);
            println!("  Trailing:             {}", if config.trailing_enabled() { "on" } else { "off" });
            println!("  Trailing Stop Loss:   {}%", config.trailing_stop_loss_pct);
            println!("  Trailing Take Profit: {}%", config.trailing_take_profit_pct);
            println!("  Trailing Threshold:   {}%", config.trailing_threshold_pct);
            println!("  Trading Fee:          {}%", config.trading_fee_pct);

            println!("\nSession Limits:");
            println!("  Enabled:              {}", config.session_tpsl_override);
            println!("  Take Profit:          {}%", config.session_take_profit_pct);
            println!("  Stop Loss:            {}%", config.session_stop_loss_pct);
            println!("  Entry Margin SL/TP:   {} / {}", config.session_entry_margin_sl, config.session_entry_margin_tp);

            println!("\nCooloff:");
            println!("  Base:                 {}m", config.cooloff_minutes);
            println!("  After Loss:           x{}", config.cooloff_multiplier_loss);
            println!("  After Small Profit:   x{}", config.cooloff_multiplier_small_profit);

            if !config.delisted_symbols.is_empty() {
                println!("\nDelisted:             {}", config.delisted_symbols.join(", "));
            }
        }
    }

    Ok(())
}

/// Load and validate the trading configuration from the environment.
fn load_config() -> Result<TradingConfig> {
    let config = TradingConfig::from_env()
        .map_err(|e| anyhow::anyhow!("[{}] {}", ErrorCategory::Configuration, e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("[{}] {}", ErrorCategory::Configuration, e))?;
    Ok(config)
}

/// Read operator commands from stdin, one per line.
fn spawn_operator_channel(control: ControlHandle) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<ControlCommand>() {
                    Ok(command) => {
                        let stop = command == ControlCommand::Stop;
                        if !control.send(command).await || stop {
                            break;
                        }
                    }
                    Err(e) => warn!(input = %line.trim(), "Ignoring operator input: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Operator channel closed");
                    break;
                }
            }
        }
        info!("Operator channel finished");
    });
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
