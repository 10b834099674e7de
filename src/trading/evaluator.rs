//! Signal evaluation: the ordered gate pipeline that turns a trade event into
//! an audit record, or defers it until the copy delay has elapsed.
//!
//! Gates, in order. The first failure ends evaluation.
//! 0. source trader blacklisted or not tracked
//! 1. action type (Open, or an Add close enough to the position's open)
//! 2. minimum trade value for the token
//! 3. trade value relative to the trader's account value
//! 4. copy delay, then re-confirm the source position still exists
//! 5. slippage between the event price and the current mark
//! 6. timing and confidence: stale, low score, market vs limit
//! 7. multi-trader consensus (optional)
//! 8. portfolio caps
//! 9. copy size

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::debug;

use super::{PositionSizer, TraderBook, TradingConfig};
use crate::api::{DataFeed, Exchange};
use crate::db::Database;
use crate::models::{
    Decision, DeferredSignal, OrderStyle, Side, Signal, TradeAction, TradeEvent, TrackedTrader,
};

/// Result of running the gates over one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Final decision, to be persisted
    Decided(Signal),
    /// Too fresh: re-check at `check_at`
    Deferred(DeferredSignal),
}

/// Distinct tracked traders entering the same token and side recently.
pub struct ConsensusTracker {
    window: Duration,
    entries: Mutex<HashMap<(String, Side), HashMap<String, DateTime<Utc>>>>,
}

impl ConsensusTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Note that `event`'s trader entered its token and side.
    pub async fn record(&self, event: &TradeEvent) {
        let mut entries = self.entries.lock().await;
        let traders = entries
            .entry((event.token.clone(), event.side))
            .or_default();
        let seen = traders
            .entry(event.trader_address.clone())
            .or_insert(event.timestamp);
        if event.timestamp > *seen {
            *seen = event.timestamp;
        }
    }

    /// Traders that entered `token`/`side` within the window ending at `now`.
    pub async fn count(&self, token: &str, side: Side, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let cutoff = now - self.window;
        match entries.get_mut(&(token.to_string(), side)) {
            Some(traders) => {
                traders.retain(|_, at| *at >= cutoff);
                traders.len()
            }
            None => 0,
        }
    }
}

/// Our open book, as gate 8 sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortfolioSnapshot {
    pub open_positions: usize,
    pub total_exposure: Decimal,
    pub token_exposure: HashMap<String, Decimal>,
}

impl PortfolioSnapshot {
    pub async fn load(db: &Database) -> Result<Self> {
        let mut snapshot = Self::default();
        for pos in db.list_open_positions().await? {
            snapshot.open_positions += 1;
            snapshot.total_exposure += pos.notional_usd;
            *snapshot.token_exposure.entry(pos.token.clone()).or_default() += pos.notional_usd;
        }
        Ok(snapshot)
    }

    pub fn token(&self, token: &str) -> Decimal {
        self.token_exposure.get(token).copied().unwrap_or_default()
    }
}

/// Runs the gate pipeline.
pub struct SignalEvaluator {
    config: TradingConfig,
    traders: TraderBook,
    feed: Arc<dyn DataFeed>,
    exchange: Arc<dyn Exchange>,
    db: Arc<Database>,
    sizer: PositionSizer,
    consensus: ConsensusTracker,
}

impl SignalEvaluator {
    pub fn new(
        config: TradingConfig,
        traders: TraderBook,
        feed: Arc<dyn DataFeed>,
        exchange: Arc<dyn Exchange>,
        db: Arc<Database>,
    ) -> Self {
        let sizer = PositionSizer::new(config.clone());
        let consensus = ConsensusTracker::new(Duration::seconds(config.consensus_window_secs));
        Self {
            config,
            traders,
            feed,
            exchange,
            db,
            sizer,
            consensus,
        }
    }

    /// First evaluation of a freshly polled event.
    pub async fn evaluate(&self, event: &TradeEvent, now: DateTime<Utc>) -> Result<Evaluation> {
        self.run(event, now, false).await
    }

    /// Re-evaluation of a deferred event once its deadline has passed. The
    /// event-only gates are re-run (blacklist and tracking may have changed)
    /// and the copy delay is treated as satisfied.
    pub async fn reevaluate(&self, deferred: &DeferredSignal, now: DateTime<Utc>) -> Result<Signal> {
        match self.run(&deferred.event, now, true).await? {
            Evaluation::Decided(signal) => Ok(signal),
            Evaluation::Deferred(_) => anyhow::bail!("deferred event {} deferred again", deferred.event.id),
        }
    }

    async fn run(&self, event: &TradeEvent, now: DateTime<Utc>, delay_elapsed: bool) -> Result<Evaluation> {
        let mut draft = Draft::new(event, now);

        // Gate 0
        if self.db.is_blacklisted(&event.trader_address, now).await? {
            return Ok(draft.finish(Decision::SkipBlacklisted, "source trader is blacklisted"));
        }
        let Some(trader) = self.traders.get(&event.trader_address).await else {
            return Ok(draft.finish(Decision::SkipUntracked, "source trader is not tracked"));
        };
        draft.signal.priority_score = trader.score;

        // Gate 1
        if let Some(reason) = self.action_rejection(event) {
            return Ok(draft.finish(Decision::SkipAction, reason));
        }

        // Gate 2
        let min_size = self.config.min_trade_size_for(&event.token);
        if event.value_usd < min_size {
            return Ok(draft.finish(
                Decision::SkipTradeSize,
                format!("trade value ${} below ${} minimum", event.value_usd.round_dp(2), min_size),
            ));
        }

        // Gate 3
        if trader.account_value <= Decimal::ZERO {
            return Ok(draft.finish(Decision::SkipPositionWeight, "trader account value unknown"));
        }
        let weight = event.value_usd / trader.account_value;
        draft.signal.position_weight = Some(weight.round_dp(6));
        if weight < self.config.min_position_weight || weight > self.config.max_position_weight {
            return Ok(draft.finish(
                Decision::SkipPositionWeight,
                format!("position weight {} outside bounds", weight.round_dp(4)),
            ));
        }
        self.consensus.record(event).await;

        // Gate 4
        let delay = Duration::seconds(self.config.copy_delay_secs);
        if !delay_elapsed && event.age(now) < delay {
            let check_at = event.timestamp + delay;
            debug!(event = %event.id, check_at = %check_at, "Deferring fresh signal");
            return Ok(Evaluation::Deferred(DeferredSignal {
                event: event.clone(),
                check_at,
            }));
        }
        let positions = self
            .feed
            .get_address_positions(&event.trader_address)
            .await
            .context("Failed to re-confirm source position")?;
        let Some(source) = positions.iter().find(|p| p.matches(&event.token, event.side)) else {
            return Ok(draft.finish(
                Decision::SkipPositionGone,
                "source position closed or reversed before copy",
            ));
        };
        draft.signal.leverage = self
            .config
            .cap_leverage(source.leverage.unwrap_or(self.config.default_leverage));

        // Gate 5
        let mark = self
            .exchange
            .get_mark_price(&event.token)
            .await
            .context("Failed to fetch mark price")?;
        let Some(mark) = mark.filter(|p| *p > Decimal::ZERO) else {
            return Ok(draft.finish(Decision::SkipNoPrice, "no mark price for token"));
        };
        let slippage = (mark - event.price).abs() / event.price;
        draft.signal.current_price = Some(mark);
        draft.signal.slippage_pct = Some(slippage.round_dp(6));
        let slippage_ok = slippage <= self.config.max_slippage_pct;
        draft.signal.slippage_ok = Some(slippage_ok);
        if !slippage_ok {
            return Ok(draft.finish(
                Decision::SkipSlippage,
                format!("price moved {}% since source trade", (slippage * Decimal::ONE_HUNDRED).round_dp(2)),
            ));
        }

        // Gate 6
        match self.classify_timing(event.age(now), &trader) {
            Ok((style, budget)) => {
                draft.signal.order_style = Some(style);
                draft.signal.max_slippage_pct = Some(budget);
            }
            Err((decision, reason)) => return Ok(draft.finish(decision, reason)),
        }

        // Gate 7
        if self.config.require_consensus {
            let count = self.consensus.count(&event.token, event.side, now).await;
            if count < self.config.min_consensus_traders {
                return Ok(draft.finish(
                    Decision::SkipConsensus,
                    format!(
                        "{} of {} traders agree",
                        count, self.config.min_consensus_traders
                    ),
                ));
            }
        }

        // Gate 8
        let portfolio = PortfolioSnapshot::load(&self.db).await?;
        let size = self
            .sizer
            .calculate_size(Some(weight), trader.score, portfolio.total_exposure);
        if portfolio.open_positions >= self.config.max_open_positions {
            return Ok(draft.finish(
                Decision::SkipMaxPositions,
                format!("{} positions already open", portfolio.open_positions),
            ));
        }
        if portfolio.total_exposure >= self.config.max_total_exposure_usd
            || portfolio.total_exposure + size > self.config.max_total_exposure_usd
        {
            return Ok(draft.finish(Decision::SkipMaxExposure, "total exposure cap reached"));
        }
        if portfolio.token(&event.token) + size > self.config.max_token_exposure_usd {
            return Ok(draft.finish(
                Decision::SkipTokenExposure,
                format!("{} exposure cap reached", event.token),
            ));
        }

        // Gate 9
        if size <= Decimal::ZERO {
            return Ok(draft.finish(Decision::SkipSize, "computed copy size is zero"));
        }
        draft.signal.copy_size_usd = size;

        Ok(draft.finish(Decision::Execute, "all gates passed"))
    }

    fn action_rejection(&self, event: &TradeEvent) -> Option<String> {
        match event.action {
            TradeAction::Open => None,
            TradeAction::Add => match event.position_opened_at {
                None => Some("add to a position with unknown open time".to_string()),
                Some(opened) if event.timestamp - opened > Duration::seconds(self.config.max_add_age_secs) => {
                    Some(format!(
                        "add {} minutes after open",
                        (event.timestamp - opened).num_minutes()
                    ))
                }
                Some(_) => None,
            },
            TradeAction::Reduce | TradeAction::Close => Some(format!("{} is not copied", event.action)),
        }
    }

    /// Order style and slippage budget from signal age and trader quality.
    fn classify_timing(
        &self,
        age: Duration,
        trader: &TrackedTrader,
    ) -> std::result::Result<(OrderStyle, Decimal), (Decision, String)> {
        if age > Duration::seconds(self.config.max_signal_age_secs) {
            return Err((
                Decision::SkipStale,
                format!("signal is {} minutes old", age.num_minutes()),
            ));
        }
        if trader.score < self.config.min_confidence_score {
            return Err((
                Decision::SkipLowConfidence,
                format!("trader score {:.1} below threshold", trader.score),
            ));
        }
        if age <= Duration::seconds(self.config.fresh_signal_secs)
            && trader.score >= self.config.high_confidence_score
        {
            Ok((OrderStyle::Market, self.config.market_slippage_pct))
        } else {
            Ok((OrderStyle::Limit, self.config.limit_slippage_pct))
        }
    }
}

/// A signal under construction, filled in gate by gate.
struct Draft {
    signal: Signal,
}

impl Draft {
    fn new(event: &TradeEvent, now: DateTime<Utc>) -> Self {
        Self {
            signal: Signal {
                id: uuid::Uuid::new_v4().to_string(),
                event_id: event.id.clone(),
                trader_address: event.trader_address.clone(),
                token: event.token.clone(),
                side: event.side,
                action: event.action,
                value_usd: event.value_usd,
                position_weight: None,
                age_secs: event.age(now).num_seconds(),
                event_price: event.price,
                current_price: None,
                slippage_pct: None,
                slippage_ok: None,
                priority_score: 0.0,
                copy_size_usd: Decimal::ZERO,
                leverage: 0,
                order_style: None,
                max_slippage_pct: None,
                decision: Decision::SkipAction,
                reason: String::new(),
                created_at: now,
            },
        }
    }

    fn finish(mut self, decision: Decision, reason: impl Into<String>) -> Evaluation {
        self.signal.decision = decision;
        self.signal.reason = reason.into();
        Evaluation::Decided(self.signal)
    }
}
