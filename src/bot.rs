//! Bot runner: wires the clients, the copy pipeline and the position monitor
//! together and runs them as supervised loops.
//!
//! Loops:
//! - Trade poller: tracked traders' fills into the evaluator
//! - Deferred re-check: events whose copy delay has elapsed
//! - Position monitor: stops, profit tiers, source-trader exits
//! - Leaderboard refresh: re-scores and replaces the tracked set
//!
//! Each loop body runs in its own task; an error or panic is logged and the
//! loop restarts after a short delay. Ctrl-C or SIGTERM cancels everything;
//! order work already under way is allowed to finish before the loops are
//! aborted.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{
    DataFeed, Exchange, HyperliquidClient, NansenClient, RateLimitConfig, RateLimiter,
    RetryingClient, HYPERLIQUID_MAINNET, LEADERBOARD_PATH, NANSEN_API_BASE,
};
use crate::db::Database;
use crate::trading::{
    CopyPipeline, DeferredQueue, ExecutionMode, Executor, PositionMonitor, SignalEvaluator,
    TraderBook, TraderScorer, TradingConfig,
};

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Gate, sizing and exit parameters
    pub trading: TradingConfig,

    pub mode: ExecutionMode,

    /// Database URL
    pub database_url: String,

    /// Where rate-limiter state is kept between runs
    pub state_dir: PathBuf,

    pub nansen_base_url: String,
    pub nansen_api_key: String,

    pub exchange_base_url: String,

    /// Agent wallet key for live trading
    pub private_key: Option<String>,

    /// Master account when the key is an agent wallet
    pub account_address: Option<String>,

    pub poll_interval_secs: u64,
    pub monitor_interval_secs: u64,
    pub leaderboard_interval_secs: u64,

    /// Pause before restarting a failed loop
    pub restart_delay_secs: u64,

    /// How long loops get to finish after shutdown is requested
    pub shutdown_grace_secs: u64,

    pub leaderboard_limits: RateLimitConfig,
    pub profiler_limits: RateLimitConfig,
    pub exchange_limits: RateLimitConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            mode: ExecutionMode::Paper,
            database_url: "sqlite:perpcopier.db?mode=rwc".to_string(),
            state_dir: PathBuf::from(".perpcopier"),
            nansen_base_url: NANSEN_API_BASE.to_string(),
            nansen_api_key: String::new(),
            exchange_base_url: HYPERLIQUID_MAINNET.to_string(),
            private_key: None,
            account_address: None,
            poll_interval_secs: 60,
            monitor_interval_secs: 30,
            leaderboard_interval_secs: 6 * 3600,
            restart_delay_secs: 5,
            shutdown_grace_secs: 10,
            leaderboard_limits: RateLimitConfig::new(1, 20, 1000),
            profiler_limits: RateLimitConfig::new(5, 100, 100),
            exchange_limits: RateLimitConfig::new(10, 600, 50),
        }
    }
}

/// Scores the leaderboard and replaces the tracked trader set.
pub struct TraderRefresher {
    feed: Arc<dyn DataFeed>,
    db: Arc<Database>,
    traders: TraderBook,
    scorer: TraderScorer,
    window_days: u32,
}

impl TraderRefresher {
    pub fn new(feed: Arc<dyn DataFeed>, db: Arc<Database>, traders: TraderBook, config: TradingConfig) -> Self {
        let window_days = config.leaderboard_days;
        Self {
            feed,
            db,
            traders,
            scorer: TraderScorer::new(config),
            window_days,
        }
    }

    /// Fetch, filter and score. Blacklisted addresses are never tracked.
    /// Returns the number of traders now tracked.
    pub async fn refresh(&self) -> Result<usize> {
        let now = Utc::now();
        let entries = self
            .feed
            .get_leaderboard(self.window_days)
            .await
            .context("Failed to fetch leaderboard")?;
        let blacklisted: HashSet<String> = self
            .db
            .active_blacklist(now)
            .await?
            .into_iter()
            .map(|(address, _)| address)
            .collect();

        let (tracked, rejected) = self.scorer.select(&entries, &blacklisted, now);
        for (address, reason) in &rejected {
            tracing::debug!(trader = %address, reason = ?reason, "Trader not tracked");
        }

        if tracked.is_empty() && self.traders.len().await > 0 {
            warn!(candidates = entries.len(), "No trader passed the filter, keeping current set");
            return Ok(self.traders.len().await);
        }

        self.db.replace_tracked_traders(&tracked).await?;
        let count = tracked.len();
        self.traders.replace(tracked).await;
        info!(
            candidates = entries.len(),
            rejected = rejected.len(),
            tracked = count,
            "Tracked traders refreshed"
        );
        Ok(count)
    }

    /// Restore the last tracked set from storage, minus anyone blacklisted
    /// since.
    pub async fn restore(&self) -> Result<usize> {
        let now = Utc::now();
        let mut traders = self.db.list_tracked_traders().await?;
        let blacklisted: HashSet<String> = self
            .db
            .active_blacklist(now)
            .await?
            .into_iter()
            .map(|(address, _)| address)
            .collect();
        traders.retain(|t| !blacklisted.contains(&t.address));
        let count = traders.len();
        self.traders.replace(traders).await;
        Ok(count)
    }

    pub async fn run(&self, interval: Duration, cancel: CancellationToken) -> Result<()> {
        info!(interval_secs = interval.as_secs(), "Leaderboard refresh started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.refresh().await {
                warn!(error = %e, "Leaderboard refresh failed");
            }
        }
        info!("Leaderboard refresh stopped");
        Ok(())
    }
}

/// Aborts the wrapped task when dropped, so aborting a supervisor also
/// stops the loop it is running.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `make()` in its own task until `cancel` fires, restarting it after
/// `restart_delay` whenever it fails, panics or returns early.
pub async fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, restart_delay: Duration, make: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let handle = tokio::spawn(make());
        let _guard = AbortOnDrop(handle.abort_handle());
        match handle.await {
            Ok(Ok(())) if cancel.is_cancelled() => break,
            Ok(Ok(())) => warn!(task = name, "Loop exited, restarting"),
            Ok(Err(e)) => error!(task = name, error = %e, "Loop failed, restarting"),
            Err(e) if e.is_panic() => error!(task = name, "Loop panicked, restarting"),
            Err(_) => break,
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
    info!(task = name, "Supervisor stopped");
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    db: Arc<Database>,
    queue: Arc<DeferredQueue>,
    executor: Arc<Executor>,
    pipeline: Arc<CopyPipeline>,
    monitor: Arc<PositionMonitor>,
    refresher: Arc<TraderRefresher>,
    cancel: CancellationToken,
}

impl Bot {
    /// Create a bot talking to the real data feed and exchange.
    pub async fn new(mut config: BotConfig) -> Result<Self> {
        config.trading.validate()?;
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("Failed to create state dir {}", config.state_dir.display()))?;
        let db = Arc::new(Database::new(&config.database_url).await?);

        if config.nansen_api_key.is_empty() {
            warn!("No Nansen API key configured, data requests will be refused");
        }
        let profiler = Arc::new(RateLimiter::load("nansen-profiler", config.profiler_limits, &config.state_dir));
        let leaderboard = Arc::new(RateLimiter::load(
            "nansen-leaderboard",
            config.leaderboard_limits,
            &config.state_dir,
        ));
        let nansen_http = RetryingClient::new(config.nansen_base_url.clone(), profiler)?
            .with_header("apikey", &config.nansen_api_key)?
            .bind_limiter(LEADERBOARD_PATH, leaderboard);
        let feed: Arc<dyn DataFeed> = Arc::new(NansenClient::new(nansen_http));

        let exchange_limiter = Arc::new(RateLimiter::load("hyperliquid", config.exchange_limits, &config.state_dir));
        let exchange_http = RetryingClient::new(config.exchange_base_url.clone(), exchange_limiter)?;
        let exchange: Arc<dyn Exchange> = match (config.mode, config.private_key.as_deref()) {
            (ExecutionMode::Live, Some(key)) => {
                let client = HyperliquidClient::with_signer(exchange_http, key, config.account_address.clone())?;
                info!(account = ?client.account(), "Exchange client initialized");
                Arc::new(client)
            }
            (ExecutionMode::Live, None) => {
                warn!("No private key configured, running in paper mode");
                config.mode = ExecutionMode::Paper;
                Arc::new(HyperliquidClient::read_only(exchange_http))
            }
            (ExecutionMode::Paper, _) => Arc::new(HyperliquidClient::read_only(exchange_http)),
        };

        Ok(Self::from_parts(config, db, feed, exchange))
    }

    /// Assemble a bot from ready-made collaborators.
    pub fn from_parts(config: BotConfig, db: Arc<Database>, feed: Arc<dyn DataFeed>, exchange: Arc<dyn Exchange>) -> Self {
        let trading = config.trading.clone();
        let traders = TraderBook::new();
        let queue = Arc::new(DeferredQueue::new());

        let executor = Arc::new(Executor::new(exchange.clone(), db.clone(), trading.clone(), config.mode));
        let evaluator = SignalEvaluator::new(trading.clone(), traders.clone(), feed.clone(), exchange.clone(), db.clone());
        let pipeline = Arc::new(CopyPipeline::new(
            trading.clone(),
            feed.clone(),
            evaluator,
            executor.clone(),
            db.clone(),
            traders.clone(),
            queue.clone(),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            trading.clone(),
            executor.clone(),
            exchange,
            feed.clone(),
            db.clone(),
            traders.clone(),
        ));
        let refresher = Arc::new(TraderRefresher::new(feed, db.clone(), traders, trading));

        Self {
            config,
            db,
            queue,
            executor,
            pipeline,
            monitor,
            refresher,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the bot when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn database(&self) -> Arc<Database> {
        self.db.clone()
    }

    /// Restore state and fetch a fresh tracked set before the loops start.
    async fn initialize(&self) -> Result<()> {
        let seen = self.pipeline.warm_up().await?;
        let restored = self.refresher.restore().await?;
        info!(seen_events = seen, traders = restored, "Restored state");

        if let Err(e) = self.refresher.refresh().await {
            warn!(error = %e, "Initial leaderboard refresh failed");
        }

        let open = self.db.list_open_positions().await?;
        info!(open_positions = open.len(), mode = %self.config.mode, "Bot initialized");
        Ok(())
    }

    fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let restart = Duration::from_secs(self.config.restart_delay_secs);
        let mut handles = Vec::new();

        let pipeline = self.pipeline.clone();
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        handles.push(tokio::spawn(supervise("trade-poller", self.cancel.clone(), restart, move || {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            async move { pipeline.run_poll_loop(interval, cancel).await }
        })));

        let pipeline = self.pipeline.clone();
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(supervise("deferred-recheck", self.cancel.clone(), restart, move || {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            async move { pipeline.run_deferred_loop(cancel).await }
        })));

        let monitor = self.monitor.clone();
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.monitor_interval_secs);
        handles.push(tokio::spawn(supervise("position-monitor", self.cancel.clone(), restart, move || {
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            async move { monitor.run(interval, cancel).await }
        })));

        let refresher = self.refresher.clone();
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.leaderboard_interval_secs);
        handles.push(tokio::spawn(supervise("leaderboard-refresh", self.cancel.clone(), restart, move || {
            let refresher = refresher.clone();
            let cancel = cancel.clone();
            async move { refresher.run(interval, cancel).await }
        })));

        handles
    }

    /// Run until Ctrl-C, SIGTERM or the cancel token fires, then shut down.
    pub async fn run(self) -> Result<()> {
        self.initialize().await?;
        let mut handles = self.spawn_loops();
        info!(
            poll_secs = self.config.poll_interval_secs,
            monitor_secs = self.config.monitor_interval_secs,
            "Bot running"
        );

        tokio::select! {
            _ = shutdown_signal() => info!("Shutdown signal received"),
            _ = self.cancel.cancelled() => info!("Shutdown requested"),
        }
        self.cancel.cancel();
        self.executor.stop_accepting();

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let joined = tokio::time::timeout(grace, futures::future::join_all(handles.iter_mut())).await;
        let in_flight = self.executor.orders_in_flight();
        if in_flight > 0 {
            info!(orders = in_flight, "Waiting for orders in flight");
        }
        self.executor.wait_in_flight().await;
        if joined.is_err() {
            warn!(grace_secs = grace.as_secs(), "Loops still running after grace period, aborting");
            for handle in &handles {
                handle.abort();
            }
        }

        let pending = self.queue.drain().await;
        if !pending.is_empty() {
            info!(count = pending.len(), "Deferred events left undecided, they will be re-polled");
        }

        let stats = BotStats::collect(&self.db, self.config.mode).await;
        self.db.close().await;
        match stats {
            Ok(stats) => info!("{}", stats),
            Err(e) => warn!(error = %e, "Failed to collect final stats"),
        }
        info!("Bot shutdown complete");
        Ok(())
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub mode: ExecutionMode,
    pub tracked_traders: usize,
    pub open_positions: usize,
    pub total_exposure: Decimal,
    pub signals: i64,
    pub executed: i64,
    pub blacklisted: usize,
}

impl BotStats {
    pub async fn collect(db: &Database, mode: ExecutionMode) -> Result<Self> {
        let positions = db.list_open_positions().await?;
        let counts = db.decision_counts().await?;
        Ok(Self {
            mode,
            tracked_traders: db.list_tracked_traders().await?.len(),
            open_positions: positions.len(),
            total_exposure: positions.iter().map(|p| p.notional_usd).sum(),
            signals: counts.iter().map(|(_, n)| n).sum(),
            executed: counts
                .iter()
                .filter(|(d, _)| d == "EXECUTE")
                .map(|(_, n)| n)
                .sum(),
            blacklisted: db.active_blacklist(Utc::now()).await?.len(),
        })
    }
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Mode:            {}", self.mode)?;
        writeln!(f, "Tracked Traders: {}", self.tracked_traders)?;
        writeln!(f, "Open Positions:  {}", self.open_positions)?;
        writeln!(f, "Total Exposure:  ${:.2}", self.total_exposure)?;
        writeln!(f, "Signals:         {} (Executed: {})", self.signals, self.executed)?;
        write!(f, "Blacklisted:     {}", self.blacklisted)
    }
}
