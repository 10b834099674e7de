//! Position monitor: the stop and liquidation state machine run over every
//! open position on a fixed interval.
//!
//! Per position, in priority order, stopping at the first action that closes
//! or shrinks it:
//! 1. ratchet the trailing stop on a new favourable extreme
//! 2. close if price crossed the trailing stop
//! 3. close if held longer than the time stop
//! 4. take profit, highest tier first, each tier at most once
//! 5. close if the source trader no longer holds the position, blacklisting
//!    them when no matching Close explains it
//!
//! Resting entries are followed up and missing live stops re-placed before
//! the checks run.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Executor, TraderBook, TradingConfig};
use crate::api::{DataFeed, Exchange, OrderState};
use crate::db::Database;
use crate::models::{CloseReason, OurPosition, SourcePosition, TradeAction, TradeEvent};

/// What happened to one position in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    Held,
    /// Entry order still resting
    Pending,
    /// A close was attempted and failed; retried next cycle
    CloseFailed(CloseReason),
    Closed(CloseReason),
    /// Profit tier (1-based) taken
    Reduced(u8),
}

/// Tally of one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub closed: usize,
    pub reduced: usize,
    pub errors: usize,
}

/// Source-trader lookups shared by every position in one cycle.
#[derive(Default)]
struct SourceCache {
    positions: HashMap<String, Vec<SourcePosition>>,
    trades: HashMap<String, Vec<TradeEvent>>,
}

pub struct PositionMonitor {
    config: TradingConfig,
    executor: Arc<Executor>,
    exchange: Arc<dyn Exchange>,
    feed: Arc<dyn DataFeed>,
    db: Arc<Database>,
    traders: TraderBook,
}

impl PositionMonitor {
    pub fn new(
        config: TradingConfig,
        executor: Arc<Executor>,
        exchange: Arc<dyn Exchange>,
        feed: Arc<dyn DataFeed>,
        db: Arc<Database>,
        traders: TraderBook,
    ) -> Self {
        Self {
            config,
            executor,
            exchange,
            feed,
            db,
            traders,
        }
    }

    /// Run cycles until cancelled.
    pub async fn run(&self, interval: std::time::Duration, cancel: CancellationToken) -> Result<()> {
        info!(interval_secs = interval.as_secs(), "Position monitor started");
        loop {
            let report = self.run_cycle(Utc::now(), &cancel).await?;
            if report.checked > 0 {
                debug!(
                    checked = report.checked,
                    closed = report.closed,
                    reduced = report.reduced,
                    errors = report.errors,
                    "Monitor cycle complete"
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Position monitor stopped");
        Ok(())
    }

    /// One pass over all open positions, sequentially. A failure on one
    /// position is logged and the pass moves on.
    pub async fn run_cycle(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<CycleReport> {
        let positions = self
            .db
            .list_open_positions()
            .await
            .context("Failed to load open positions")?;

        let mut report = CycleReport::default();
        let mut cache = SourceCache::default();
        for mut pos in positions {
            if cancel.is_cancelled() {
                break;
            }
            // orders and their bookkeeping for this position finish before shutdown
            let Some(_order) = self.executor.order_guard() else {
                break;
            };
            report.checked += 1;
            match self.check_position(&mut pos, now, &mut cache).await {
                Ok(MonitorAction::Closed(_)) => report.closed += 1,
                Ok(MonitorAction::Reduced(_)) => report.reduced += 1,
                Ok(MonitorAction::CloseFailed(_)) => report.errors += 1,
                Ok(MonitorAction::Held | MonitorAction::Pending) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(position = %pos.id, token = %pos.token, error = %e, "Position check failed");
                }
            }
        }
        Ok(report)
    }

    async fn check_position(
        &self,
        pos: &mut OurPosition,
        now: DateTime<Utc>,
        cache: &mut SourceCache,
    ) -> Result<MonitorAction> {
        if pos.entry_resting {
            if let Some(action) = self.follow_up_entry(pos, now).await? {
                return Ok(action);
            }
        }

        if self.executor.mode().is_live() && pos.stop_order_id.is_none() {
            match self.executor.ensure_stop(pos).await {
                Ok(true) => {
                    info!(position = %pos.id, token = %pos.token, "Re-placed missing stop");
                    self.db.update_position(pos).await?;
                }
                Ok(false) => {}
                Err(e) => warn!(position = %pos.id, token = %pos.token, error = %e, "Stop re-placement failed"),
            }
        }

        let Some(price) = self.exchange.get_mark_price(&pos.token).await? else {
            warn!(position = %pos.id, token = %pos.token, "No mark price, skipping checks");
            return Ok(MonitorAction::Held);
        };

        // 1. trailing stop ratchet
        let previous_stop = pos.trailing_stop_price;
        let previous_mark = pos.water_mark();
        let stop = pos.update_trailing_stop(price, self.config.trailing_stop_pct);
        let dirty = pos.water_mark() != previous_mark || stop != previous_stop;
        if stop != previous_stop {
            debug!(position = %pos.id, token = %pos.token, from = %previous_stop, to = %stop, "Trailing stop raised");
        }

        // 2. trailing stop trigger
        if pos.trailing_stop_triggered(price) {
            info!(position = %pos.id, token = %pos.token, price = %price, stop = %stop, "Trailing stop hit");
            return self.close(pos, CloseReason::TrailingStop, dirty, now).await;
        }

        // 3. time stop
        if pos.holding_duration(now) > Duration::hours(self.config.max_position_hours) {
            info!(position = %pos.id, token = %pos.token, "Time stop hit");
            return self.close(pos, CloseReason::TimeStop, dirty, now).await;
        }

        // 4. profit tiers
        if let Some(action) = self.take_profit(pos, price, now).await? {
            return Ok(action);
        }

        if dirty {
            self.db.update_position(pos).await?;
        }

        // 5. source trader still in?
        self.check_source(pos, now, cache).await
    }

    /// Resolve a resting entry. `Some` ends the cycle for this position.
    async fn follow_up_entry(&self, pos: &mut OurPosition, now: DateTime<Utc>) -> Result<Option<MonitorAction>> {
        let Some(oid) = pos.entry_order_id else {
            pos.entry_resting = false;
            self.db.update_position(pos).await?;
            return Ok(None);
        };

        match self.exchange.get_order_status(oid).await? {
            OrderState::Filled { price, size } => {
                if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
                    pos.entry_price = price;
                }
                if let Some(size) = size.filter(|s| *s > Decimal::ZERO) {
                    pos.size = size;
                }
                pos.notional_usd = pos.entry_price * pos.size;
                pos.entry_resting = false;
                self.db.update_position(pos).await?;
                info!(position = %pos.id, token = %pos.token, price = %pos.entry_price, "Resting entry filled");
                Ok(None)
            }
            state if state.is_terminal_unfilled() => {
                info!(position = %pos.id, token = %pos.token, state = ?state, "Resting entry cancelled");
                self.executor.discard_position(pos, CloseReason::EntryCancelled, now).await?;
                Ok(Some(MonitorAction::Closed(CloseReason::EntryCancelled)))
            }
            _ => Ok(Some(MonitorAction::Pending)),
        }
    }

    async fn close(
        &self,
        pos: &mut OurPosition,
        reason: CloseReason,
        dirty: bool,
        now: DateTime<Utc>,
    ) -> Result<MonitorAction> {
        let result = self.executor.close_position(pos, reason, now).await?;
        if result.success {
            return Ok(MonitorAction::Closed(reason));
        }
        if dirty {
            self.db.update_position(pos).await?;
        }
        Ok(MonitorAction::CloseFailed(reason))
    }

    /// Highest qualifying tier not yet taken. Only one tier fires per cycle.
    async fn take_profit(
        &self,
        pos: &mut OurPosition,
        price: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<MonitorAction>> {
        let gain = pos.unrealized_pct(price);
        let fired = pos.last_tier_fired as usize;

        let Some((index, tier)) = self
            .config
            .profit_tiers
            .iter()
            .enumerate()
            .rev()
            .take_while(|(i, _)| i + 1 > fired)
            .find(|(_, t)| gain >= t.threshold)
        else {
            return Ok(None);
        };
        let tier_no = (index + 1) as u8;

        info!(
            position = %pos.id,
            token = %pos.token,
            tier = tier_no,
            gain_pct = %(gain * Decimal::ONE_HUNDRED).round_dp(2),
            "Profit tier reached"
        );

        if tier.fraction >= Decimal::ONE {
            pos.last_tier_fired = tier_no;
            return self.close(pos, CloseReason::TakeProfit, true, now).await.map(Some);
        }

        let previous = pos.last_tier_fired;
        pos.last_tier_fired = tier_no;
        let result = self.executor.reduce_position(pos, tier.fraction).await?;
        if result.success {
            Ok(Some(MonitorAction::Reduced(tier_no)))
        } else {
            pos.last_tier_fired = previous;
            Ok(None)
        }
    }

    async fn check_source(
        &self,
        pos: &mut OurPosition,
        now: DateTime<Utc>,
        cache: &mut SourceCache,
    ) -> Result<MonitorAction> {
        let trader = pos.source_trader.clone();
        if !cache.positions.contains_key(&trader) {
            let positions = self
                .feed
                .get_address_positions(&trader)
                .await
                .with_context(|| format!("Failed to fetch positions for {}", trader))?;
            cache.positions.insert(trader.clone(), positions);
        }
        let still_held = cache
            .positions
            .get(&trader)
            .is_some_and(|ps| ps.iter().any(|p| p.matches(&pos.token, pos.side)));
        if still_held {
            return Ok(MonitorAction::Held);
        }

        if !cache.trades.contains_key(&trader) {
            let trades = self
                .feed
                .get_address_trades(&trader, Duration::seconds(self.config.exit_lookback_secs))
                .await
                .with_context(|| format!("Failed to fetch trades for {}", trader))?;
            cache.trades.insert(trader.clone(), trades);
        }
        let exited = cache.trades.get(&trader).is_some_and(|ts| {
            ts.iter()
                .any(|t| t.action == TradeAction::Close && t.token == pos.token && t.side == pos.side)
        });

        if exited {
            if !self.config.follow_trader_exits {
                info!(position = %pos.id, trader = %trader, token = %pos.token, "Source trader exited, holding");
                return Ok(MonitorAction::Held);
            }
            info!(position = %pos.id, trader = %trader, token = %pos.token, "Source trader exited, following");
            return self.close(pos, CloseReason::TraderExited, false, now).await;
        }

        let until = now + Duration::hours(self.config.blacklist_hours);
        warn!(
            position = %pos.id,
            trader = %trader,
            token = %pos.token,
            until = %until,
            "Source position vanished without a close, treating as liquidation"
        );
        self.db
            .blacklist(&trader, until, "probable liquidation")
            .await?;
        self.traders.remove(&trader).await;
        self.close(pos, CloseReason::TraderLiquidated, false, now).await
    }
}
