//! Perp Copy-Trading Bot
//!
//! Follows profitable perpetual-futures traders from the leaderboard, filters
//! their fills through a gate pipeline and mirrors the survivors with
//! trailing-stop and profit-tier risk management.

mod api;
mod bot;
mod db;
mod models;
mod trading;

#[cfg(test)]
mod testing;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::{DataFeed, NansenClient, RateLimiter, RetryingClient, LEADERBOARD_PATH};
use crate::bot::{Bot, BotConfig};
use crate::db::Database;
use crate::trading::{ExecutionMode, TraderScorer, TradingConfig};

/// Perp copy-trading bot CLI.
#[derive(Parser)]
#[command(name = "perpcopier")]
#[command(about = "Copy perp trades from smart-money traders", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "PERPCOPIER_DATABASE", default_value = "sqlite:./perpcopier.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, env = "PERPCOPIER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// JSON file with trading parameters
    #[arg(short, long, env = "PERPCOPIER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Upstream endpoints and credentials.
#[derive(Args, Clone)]
struct ApiArgs {
    #[arg(long, env = "NANSEN_API_KEY", default_value = "", hide_env_values = true)]
    nansen_api_key: String,

    #[arg(long, env = "NANSEN_BASE_URL", default_value = api::NANSEN_API_BASE)]
    nansen_base_url: String,

    #[arg(long, env = "HYPERLIQUID_BASE_URL", default_value = api::HYPERLIQUID_MAINNET)]
    exchange_base_url: String,

    /// Directory for persisted rate-limiter state
    #[arg(long, env = "PERPCOPIER_STATE_DIR", default_value = ".perpcopier")]
    state_dir: PathBuf,
}

/// Trading parameters that can be overridden from the command line.
#[derive(Args, Clone, Default)]
struct TradingArgs {
    /// Equity used for sizing, in USD
    #[arg(long, env = "PERPCOPIER_ACCOUNT_VALUE")]
    account_value: Option<Decimal>,

    /// Sizing method (mirror, score, fixed)
    #[arg(long, env = "PERPCOPIER_SIZING")]
    sizing: Option<String>,

    #[arg(long, env = "PERPCOPIER_MAX_POSITIONS")]
    max_positions: Option<usize>,

    #[arg(long, env = "PERPCOPIER_MAX_EXPOSURE")]
    max_exposure: Option<Decimal>,

    #[arg(long, env = "PERPCOPIER_MAX_LEVERAGE")]
    max_leverage: Option<u32>,

    /// Seconds to wait before copying a fresh event
    #[arg(long, env = "PERPCOPIER_COPY_DELAY")]
    copy_delay: Option<i64>,

    #[arg(long, env = "PERPCOPIER_TRAILING_STOP")]
    trailing_stop: Option<Decimal>,

    #[arg(long, env = "PERPCOPIER_TOP_TRADERS")]
    top_traders: Option<usize>,

    /// Only wait for consensus among this many traders
    #[arg(long, env = "PERPCOPIER_CONSENSUS")]
    consensus: Option<usize>,
}

impl TradingArgs {
    fn apply(&self, config: &mut TradingConfig) {
        if let Some(v) = self.account_value {
            config.account_value_usd = v;
        }
        if let Some(v) = &self.sizing {
            config.sizing_method = v.clone();
        }
        if let Some(v) = self.max_positions {
            config.max_open_positions = v;
        }
        if let Some(v) = self.max_exposure {
            config.max_total_exposure_usd = v;
        }
        if let Some(v) = self.max_leverage {
            config.max_leverage = v;
        }
        if let Some(v) = self.copy_delay {
            config.copy_delay_secs = v;
        }
        if let Some(v) = self.trailing_stop {
            config.trailing_stop_pct = v;
        }
        if let Some(v) = self.top_traders {
            config.top_traders = v;
        }
        if let Some(v) = self.consensus {
            config.require_consensus = true;
            config.min_consensus_traders = v;
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the copy-trading bot
    Run {
        #[command(flatten)]
        api: ApiArgs,

        #[command(flatten)]
        trading: TradingArgs,

        /// Place real orders (paper trading otherwise)
        #[arg(long, env = "PERPCOPIER_LIVE")]
        live: bool,

        /// Agent wallet private key for live trading
        #[arg(long, env = "HYPERLIQUID_PRIVATE_KEY", hide_env_values = true)]
        private_key: Option<String>,

        /// Master account address when trading through an agent wallet
        #[arg(long, env = "HYPERLIQUID_ACCOUNT")]
        account: Option<String>,

        /// Trade polling interval in seconds
        #[arg(long, env = "PERPCOPIER_POLL_INTERVAL", default_value = "60")]
        poll_interval: u64,

        /// Position monitor interval in seconds
        #[arg(long, env = "PERPCOPIER_MONITOR_INTERVAL", default_value = "30")]
        monitor_interval: u64,

        /// Leaderboard refresh interval in seconds
        #[arg(long, env = "PERPCOPIER_LEADERBOARD_INTERVAL", default_value = "21600")]
        leaderboard_interval: u64,
    },

    /// List open positions
    Positions,

    /// Show recent signals with their decisions
    Signals {
        /// Maximum number of signals to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Fetch and score the leaderboard without changing the tracked set
    Leaderboard {
        #[command(flatten)]
        api: ApiArgs,

        #[command(flatten)]
        trading: TradingArgs,
    },

    /// Show the effective trading configuration
    Config {
        #[command(flatten)]
        trading: TradingArgs,
    },
}

/// Load the trading config from `path` if given, then apply flag overrides.
fn load_trading_config(path: Option<&PathBuf>, overrides: &TradingArgs) -> Result<TradingConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => TradingConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            api,
            trading,
            live,
            private_key,
            account,
            poll_interval,
            monitor_interval,
            leaderboard_interval,
        } => {
            let trading = load_trading_config(cli.config.as_ref(), &trading)?;
            let mode = if live { ExecutionMode::Live } else { ExecutionMode::Paper };
            info!(mode = %mode, poll_secs = poll_interval, "Starting perp copier");

            let config = BotConfig {
                trading,
                mode,
                database_url: cli.database,
                state_dir: api.state_dir,
                nansen_base_url: api.nansen_base_url,
                nansen_api_key: api.nansen_api_key,
                exchange_base_url: api.exchange_base_url,
                private_key,
                account_address: account,
                poll_interval_secs: poll_interval,
                monitor_interval_secs: monitor_interval,
                leaderboard_interval_secs: leaderboard_interval,
                ..Default::default()
            };

            let bot = Bot::new(config).await?;
            bot.run().await?;
        }

        Commands::Positions => {
            let db = Database::new(&cli.database).await?;
            let positions = db.list_open_positions().await?;

            if positions.is_empty() {
                println!("No open positions.");
                return Ok(());
            }

            println!(
                "\n{:<8} {:<6} {:>12} {:>12} {:>10} {:>12} {:>5}  {:<14}",
                "TOKEN", "SIDE", "ENTRY", "SIZE", "USD", "STOP", "TIER", "SOURCE"
            );
            println!("{}", "-".repeat(90));

            for pos in &positions {
                println!(
                    "{:<8} {:<6} {:>12} {:>12} {:>10.2} {:>12} {:>5}  {:<14}{}",
                    pos.token,
                    pos.side,
                    pos.entry_price,
                    pos.size,
                    pos.notional_usd,
                    pos.trailing_stop_price,
                    pos.last_tier_fired,
                    truncate(&pos.source_trader, 14),
                    if pos.entry_resting { "  (resting)" } else { "" }
                );
            }

            let exposure: Decimal = positions.iter().map(|p| p.notional_usd).sum();
            println!("\nTotal exposure: ${:.2}", exposure);
            db.close().await;
        }

        Commands::Signals { limit } => {
            let db = Database::new(&cli.database).await?;
            let signals = db.recent_signals(limit).await?;

            if signals.is_empty() {
                println!("No signals recorded yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<14} {:<8} {:<6} {:<6} {:>12}  {:<22} {}",
                "TIME", "TRADER", "TOKEN", "SIDE", "ACTION", "VALUE", "DECISION", "REASON"
            );
            println!("{}", "-".repeat(110));

            for s in &signals {
                println!(
                    "{:<20} {:<14} {:<8} {:<6} {:<6} {:>12.2}  {:<22} {}",
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                    truncate(&s.trader_address, 14),
                    s.token,
                    s.side,
                    s.action,
                    s.value_usd,
                    s.decision,
                    truncate(&s.reason, 40)
                );
            }

            println!("\n--- Decisions ---");
            for (decision, count) in db.decision_counts().await? {
                println!("  {:<22} {}", decision, count);
            }
            db.close().await;
        }

        Commands::Leaderboard { api, trading } => {
            let trading = load_trading_config(cli.config.as_ref(), &trading)?;
            let db = Database::new(&cli.database).await?;

            let limiter = Arc::new(RateLimiter::new("nansen-leaderboard", BotConfig::default().leaderboard_limits));
            let http = RetryingClient::new(api.nansen_base_url, limiter.clone())?
                .with_header("apikey", &api.nansen_api_key)?
                .bind_limiter(LEADERBOARD_PATH, limiter);
            let client = NansenClient::new(http);

            let now = Utc::now();
            let entries = client.get_leaderboard(trading.leaderboard_days).await?;
            let blacklisted: HashSet<String> = db
                .active_blacklist(now)
                .await?
                .into_iter()
                .map(|(address, _)| address)
                .collect();
            let scorer = TraderScorer::new(trading);
            let (tracked, rejected) = scorer.select(&entries, &blacklisted, now);

            println!("\n{:<44} {:<20} {:>14} {:>10}", "ADDRESS", "LABEL", "ACCOUNT", "SCORE");
            println!("{}", "-".repeat(91));
            for trader in &tracked {
                println!(
                    "{:<44} {:<20} {:>14.0} {:>10.1}",
                    trader.address,
                    truncate(&trader.label, 18),
                    trader.account_value,
                    trader.score
                );
            }

            println!("\n{} of {} candidates accepted", tracked.len(), entries.len());
            for (address, reason) in rejected.iter().take(20) {
                println!("  rejected {:<44} {:?}", address, reason);
            }
            db.close().await;
        }

        Commands::Config { trading } => {
            let trading = load_trading_config(cli.config.as_ref(), &trading)?;
            let bot = BotConfig::default();

            println!("\n=== Trading Configuration ===");
            println!("{}", serde_json::to_string_pretty(&trading)?);

            println!("\n=== Runtime ===");
            println!("Poll Interval:        {}s", bot.poll_interval_secs);
            println!("Monitor Interval:     {}s", bot.monitor_interval_secs);
            println!("Leaderboard Interval: {}s", bot.leaderboard_interval_secs);
            println!(
                "Leaderboard Limits:   {}/s {}/min",
                bot.leaderboard_limits.per_second, bot.leaderboard_limits.per_minute
            );
            println!(
                "Profiler Limits:      {}/s {}/min",
                bot.profiler_limits.per_second, bot.profiler_limits.per_minute
            );
        }
    }

    Ok(())
}

/// Truncate a string to max length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
