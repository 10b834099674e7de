//! The copy pipeline: polls tracked traders' fills, runs them through the
//! evaluator, records every decision and hands approved signals to the
//! executor. Fresh events wait in the deferred queue for their re-check.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeferredQueue, Evaluation, Executor, SignalEvaluator, TraderBook, TradingConfig};
use crate::api::{ApiError, DataFeed};
use crate::db::Database;
use crate::models::{DeferredSignal, Side, Signal, TradeAction};

/// How long to wait before retrying a re-check that failed on a transient
/// upstream error.
const RECHECK_RETRY_SECS: i64 = 60;

/// Seen ids preloaded from storage on startup.
const SEEN_WARMUP: i64 = 5000;

/// Counters for one polling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub traders: usize,
    pub events: usize,
    pub decided: usize,
    pub deferred: usize,
    pub executed: usize,
    pub errors: usize,
}

pub struct CopyPipeline {
    config: TradingConfig,
    feed: Arc<dyn DataFeed>,
    evaluator: SignalEvaluator,
    executor: Arc<Executor>,
    db: Arc<Database>,
    traders: TraderBook,
    queue: Arc<DeferredQueue>,
    /// Events with a persisted decision, with when they were marked.
    /// Pruned once the feed window can no longer return them.
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Events waiting in the deferred queue
    pending: Mutex<HashSet<String>>,
}

impl CopyPipeline {
    pub fn new(
        config: TradingConfig,
        feed: Arc<dyn DataFeed>,
        evaluator: SignalEvaluator,
        executor: Arc<Executor>,
        db: Arc<Database>,
        traders: TraderBook,
        queue: Arc<DeferredQueue>,
    ) -> Self {
        Self {
            config,
            feed,
            evaluator,
            executor,
            db,
            traders,
            queue,
            seen: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Preload recently seen event ids so the first poll after a restart
    /// does not hit storage for each of them.
    pub async fn warm_up(&self) -> Result<usize> {
        let ids = self.db.recent_seen_events(SEEN_WARMUP).await?;
        let now = Utc::now();
        let mut seen = self.seen.lock().await;
        seen.extend(ids.into_iter().map(|id| (id, now)));
        Ok(seen.len())
    }

    /// History window fetched per trader: enough to judge every non-stale
    /// event and to find the Open behind any Add still eligible.
    fn history_window(&self) -> Duration {
        Duration::seconds(self.config.max_signal_age_secs + self.config.max_add_age_secs)
    }

    async fn is_known(&self, event_id: &str) -> Result<bool> {
        if self.pending.lock().await.contains(event_id) || self.seen.lock().await.contains_key(event_id) {
            return Ok(true);
        }
        if self.db.has_seen(event_id).await? {
            self.seen.lock().await.insert(event_id.to_string(), Utc::now());
            return Ok(true);
        }
        Ok(false)
    }

    /// Poll every tracked trader once. Per-trader failures are logged and
    /// the pass continues.
    pub async fn poll_all(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> PollReport {
        self.prune_seen(now).await;
        let mut report = PollReport::default();
        for trader in self.traders.all().await {
            if cancel.is_cancelled() {
                break;
            }
            report.traders += 1;
            if let Err(e) = self.poll_trader(&trader.address, now, &mut report).await {
                report.errors += 1;
                match e.downcast_ref::<ApiError>() {
                    Some(api) if api.is_rate_limited() => {
                        warn!(trader = %trader.address, "Rate limited, will retry next poll")
                    }
                    _ => warn!(trader = %trader.address, error = %e, "Trader poll failed"),
                }
            }
        }
        report
    }

    /// Fetch one trader's recent fills and evaluate the new ones in feed order.
    pub async fn poll_trader(&self, address: &str, now: DateTime<Utc>, report: &mut PollReport) -> Result<()> {
        let events = self
            .feed
            .get_address_trades(address, self.history_window())
            .await
            .with_context(|| format!("Failed to fetch trades for {}", address))?;

        let max_age = Duration::seconds(self.config.max_signal_age_secs);
        let mut opened: HashMap<(String, Side), DateTime<Utc>> = HashMap::new();

        for mut event in events {
            match event.action {
                TradeAction::Open => {
                    opened.insert((event.token.clone(), event.side), event.timestamp);
                }
                TradeAction::Add if event.position_opened_at.is_none() => {
                    event.position_opened_at = opened.get(&(event.token.clone(), event.side)).copied();
                }
                _ => {}
            }

            if event.age(now) > max_age || self.is_known(&event.id).await? {
                continue;
            }
            report.events += 1;

            match self.evaluator.evaluate(&event, now).await {
                Ok(Evaluation::Decided(signal)) => {
                    report.decided += 1;
                    if self.record(&signal).await? {
                        report.executed += 1;
                    }
                }
                Ok(Evaluation::Deferred(deferred)) => {
                    report.deferred += 1;
                    self.defer(deferred).await;
                }
                Err(e) => {
                    // left unseen: the next poll retries it
                    report.errors += 1;
                    warn!(event = %event.id, trader = %address, error = %e, "Evaluation failed");
                }
            }
        }
        Ok(())
    }

    /// Forget ids marked longer ago than the history window; storage still
    /// answers for them if the feed ever returns one.
    async fn prune_seen(&self, now: DateTime<Utc>) {
        let window = self.history_window();
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, marked| now - *marked <= window);
        if seen.len() < before {
            debug!(dropped = before - seen.len(), kept = seen.len(), "Pruned seen events");
        }
    }

    async fn defer(&self, deferred: DeferredSignal) {
        debug!(event = %deferred.event.id, check_at = %deferred.check_at, "Queued for re-check");
        self.pending.lock().await.insert(deferred.event.id.clone());
        self.queue.push(deferred).await;
    }

    /// Persist a decision and, for `EXECUTE`, open the position. The signal
    /// is stored before any order goes out. Returns whether an entry
    /// succeeded. Once shutdown has begun an `EXECUTE` is left unrecorded so
    /// the next run evaluates it again.
    async fn record(&self, signal: &Signal) -> Result<bool> {
        // held until the position is recorded, so shutdown waits for it
        let _order = if signal.is_execute() {
            match self.executor.order_guard() {
                Some(guard) => Some(guard),
                None => {
                    info!(event = %signal.event_id, token = %signal.token, "Shutting down, leaving event for the next run");
                    return Ok(false);
                }
            }
        } else {
            None
        };

        let inserted = self.db.record_signal(signal).await?;
        self.seen.lock().await.insert(signal.event_id.clone(), Utc::now());
        if !inserted {
            debug!(event = %signal.event_id, "Decision already recorded");
            return Ok(false);
        }

        if !signal.is_execute() {
            debug!(
                event = %signal.event_id,
                trader = %signal.trader_address,
                token = %signal.token,
                decision = %signal.decision,
                reason = %signal.reason,
                "Signal skipped"
            );
            return Ok(false);
        }

        info!(
            event = %signal.event_id,
            trader = %signal.trader_address,
            token = %signal.token,
            side = %signal.side,
            size_usd = %signal.copy_size_usd,
            leverage = signal.leverage,
            "Copying trade"
        );
        let result = self.executor.execute(signal).await?;
        Ok(result.success)
    }

    /// Re-evaluate a deferred event whose deadline passed. Transient failures
    /// put it back in the queue until it would be stale anyway.
    pub async fn process_deferred(&self, deferred: DeferredSignal, now: DateTime<Utc>) -> Result<()> {
        match self.evaluator.reevaluate(&deferred, now).await {
            Ok(signal) => {
                let recorded = self.record(&signal).await;
                self.pending.lock().await.remove(&deferred.event.id);
                recorded.map(|_| ())
            }
            Err(e) => {
                let retry_at = now + Duration::seconds(RECHECK_RETRY_SECS);
                if retry_at - deferred.event.timestamp > Duration::seconds(self.config.max_signal_age_secs) {
                    warn!(event = %deferred.event.id, error = %e, "Re-check failed, giving up");
                    self.pending.lock().await.remove(&deferred.event.id);
                } else {
                    warn!(event = %deferred.event.id, error = %e, "Re-check failed, retrying");
                    self.queue
                        .push(DeferredSignal {
                            check_at: retry_at,
                            ..deferred
                        })
                        .await;
                }
                Ok(())
            }
        }
    }

    /// Poll all traders every `interval` until cancelled.
    pub async fn run_poll_loop(&self, interval: std::time::Duration, cancel: CancellationToken) -> Result<()> {
        info!(interval_secs = interval.as_secs(), "Trade poller started");
        loop {
            let report = self.poll_all(Utc::now(), &cancel).await;
            if report.events > 0 || report.errors > 0 {
                info!(
                    traders = report.traders,
                    events = report.events,
                    deferred = report.deferred,
                    executed = report.executed,
                    errors = report.errors,
                    "Poll complete"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Trade poller stopped");
        Ok(())
    }

    /// Re-check deferred events as their deadlines come due, until cancelled.
    pub async fn run_deferred_loop(&self, cancel: CancellationToken) -> Result<()> {
        info!("Deferred re-check loop started");
        while let Some(deferred) = self.queue.next_due(&cancel).await {
            if let Err(e) = self.process_deferred(deferred, Utc::now()).await {
                warn!(error = %e, "Deferred re-check failed");
            }
        }
        let left = self.queue.len().await;
        info!(pending = left, "Deferred re-check loop stopped");
        Ok(())
    }
}
