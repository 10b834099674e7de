//! Order execution: turns an approved signal into an entry order, a
//! protective stop and a recorded position, and provides the close/reduce
//! primitives the position monitor drives.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::TradingConfig;
use crate::api::{ApiError, Exchange, OrderKind, OrderOutcome, OrderRequest, TimeInForce};
use crate::db::Database;
use crate::models::{CloseReason, ExecutionResult, OrderStyle, OurPosition, Side, Signal};

/// Decimal places kept on order sizes before venue rounding.
const SIZE_DECIMALS: u32 = 6;

/// Retry budget for recording a position whose entry already went out.
const RECORD_RETRY_INITIAL: Duration = Duration::from_millis(100);
const RECORD_RETRY_BUDGET: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("No usable mark price for {0}")]
    NoMarkPrice(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Unexpected order response: {0}")]
    UnexpectedResponse(Value),

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Simulated fills at the mark price
    Paper,
    /// Real orders on the exchange
    Live,
}

impl ExecutionMode {
    pub fn is_live(&self) -> bool {
        matches!(self, ExecutionMode::Live)
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Paper => f.write_str("paper"),
            ExecutionMode::Live => f.write_str("live"),
        }
    }
}

/// How an order ended up, as far as bookkeeping cares.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Fill {
    Filled {
        oid: Option<u64>,
        price: Decimal,
        size: Decimal,
    },
    Resting {
        oid: u64,
    },
}

/// Limit price `slippage` beyond `mark` in the direction that helps the order fill.
fn slippage_price(mark: Decimal, is_buy: bool, slippage: Decimal) -> Decimal {
    if is_buy {
        mark * (Decimal::ONE + slippage)
    } else {
        mark * (Decimal::ONE - slippage)
    }
}

pub struct Executor {
    exchange: Arc<dyn Exchange>,
    db: Arc<Database>,
    config: TradingConfig,
    mode: ExecutionMode,
    /// Order actions in progress, together with their bookkeeping
    in_flight: TaskTracker,
}

impl Executor {
    pub fn new(exchange: Arc<dyn Exchange>, db: Arc<Database>, config: TradingConfig, mode: ExecutionMode) -> Self {
        Self {
            exchange,
            db,
            config,
            mode,
            in_flight: TaskTracker::new(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Hold this for an order action and until its result is persisted.
    /// `None` once shutdown has begun: no new order work may start.
    pub fn order_guard(&self) -> Option<TaskTrackerToken> {
        if self.in_flight.is_closed() {
            None
        } else {
            Some(self.in_flight.token())
        }
    }

    /// Stop handing out order guards.
    pub fn stop_accepting(&self) {
        self.in_flight.close();
    }

    pub fn orders_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Resolves once shutdown has begun and every guard has been dropped.
    pub async fn wait_in_flight(&self) {
        self.in_flight.wait().await;
    }

    async fn mark_price(&self, token: &str) -> Result<Decimal, ExecutionError> {
        match self.exchange.get_mark_price(token).await? {
            Some(price) if price > Decimal::ZERO => Ok(price),
            _ => Err(ExecutionError::NoMarkPrice(token.to_string())),
        }
    }

    async fn submit(&self, order: &OrderRequest) -> Result<Fill, ExecutionError> {
        let raw = self.exchange.place_order(order).await?;
        match OrderOutcome::from_response(&raw) {
            OrderOutcome::Filled { oid, avg_px, total_sz } => Ok(Fill::Filled {
                oid,
                price: avg_px,
                size: total_sz,
            }),
            OrderOutcome::Resting { oid } => Ok(Fill::Resting { oid }),
            OrderOutcome::Error(msg) => Err(ExecutionError::Rejected(msg)),
            OrderOutcome::Unexpected(raw) => Err(ExecutionError::UnexpectedResponse(raw)),
        }
    }

    /// Open a copy position for an `EXECUTE` signal.
    ///
    /// Order failures come back as an unsuccessful [`ExecutionResult`]; only
    /// persistence failures are errors. A stop that cannot be placed does not
    /// undo the entry; the monitor re-places it. A position that still cannot
    /// be recorded after retrying is unwound on the exchange.
    pub async fn execute(&self, signal: &Signal) -> Result<ExecutionResult> {
        match self.open_position(signal).await {
            Ok(mut pos) => {
                if let Err(e) = self.record_new(&pos).await {
                    error!(
                        position = %pos.id,
                        token = %pos.token,
                        entry_oid = ?pos.entry_order_id,
                        stop_oid = ?pos.stop_order_id,
                        error = %e,
                        "Position could not be recorded, unwinding"
                    );
                    self.unwind(&mut pos).await;
                    return Err(e.context(format!("Failed to record position for signal {}", signal.id)));
                }
                info!(
                    position = %pos.id,
                    token = %pos.token,
                    side = %pos.side,
                    price = %pos.entry_price,
                    size = %pos.size,
                    leverage = pos.leverage,
                    mode = %self.mode,
                    "Opened copy position"
                );
                Ok(match pos.entry_order_id {
                    Some(oid) if pos.entry_resting => ExecutionResult::resting(oid),
                    oid => ExecutionResult::filled(oid, pos.entry_price, pos.size),
                })
            }
            Err(e) => {
                warn!(signal = %signal.id, token = %signal.token, error = %e, "Entry failed");
                Ok(ExecutionResult::failed(e.to_string()))
            }
        }
    }

    async fn record_new(&self, pos: &OurPosition) -> Result<()> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(RECORD_RETRY_INITIAL)
            .with_max_elapsed_time(Some(RECORD_RETRY_BUDGET))
            .build();
        backoff::future::retry(policy, || async move {
            self.db.insert_position(pos).await.map_err(|e| {
                warn!(position = %pos.id, error = %e, "Recording position failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
    }

    /// Take an unrecorded live position back off the exchange: cancel its
    /// stop, then cancel a resting entry or flatten a filled one.
    async fn unwind(&self, pos: &mut OurPosition) {
        if !self.mode.is_live() {
            return;
        }
        if let Err(e) = self.cancel_stop_orders(pos).await {
            error!(position = %pos.id, token = %pos.token, error = %e, "Failed to cancel stop of unrecorded position");
        }

        if pos.entry_resting {
            if let Some(oid) = pos.entry_order_id {
                match self.exchange.cancel_order(&pos.token, oid).await {
                    Ok(_) => warn!(token = %pos.token, oid, "Cancelled resting entry of unrecorded position"),
                    Err(e) => error!(token = %pos.token, oid, error = %e, "Failed to cancel resting entry, manual action needed"),
                }
            }
            return;
        }

        match self.exit_order(pos, pos.size).await {
            Ok((filled, price)) => {
                warn!(token = %pos.token, size = %filled, price = %price, "Flattened unrecorded position")
            }
            Err(e) => error!(
                token = %pos.token,
                side = %pos.side,
                size = %pos.size,
                entry_oid = ?pos.entry_order_id,
                error = %e,
                "Failed to flatten unrecorded position, manual action needed"
            ),
        }
    }

    async fn open_position(&self, signal: &Signal) -> Result<OurPosition, ExecutionError> {
        let mark = self.mark_price(&signal.token).await?;
        let leverage = self.config.cap_leverage(signal.leverage);
        let size = (signal.copy_size_usd / mark).round_dp(SIZE_DECIMALS);
        if size <= Decimal::ZERO {
            return Err(ExecutionError::Rejected(format!("copy size {} rounds to zero", signal.copy_size_usd)));
        }

        let new_position = |price: Decimal, size: Decimal| {
            OurPosition::open(
                signal.token.clone(),
                signal.side,
                price,
                size,
                leverage,
                self.config.stop_loss_pct,
                self.config.trailing_stop_pct,
                signal.trader_address.clone(),
                signal.id.clone(),
            )
        };

        if !self.mode.is_live() {
            return Ok(new_position(mark, size));
        }

        self.exchange.update_leverage(&signal.token, leverage).await?;

        let is_buy = signal.side.is_buy();
        let (tif, slippage) = match signal.order_style.unwrap_or(OrderStyle::Limit) {
            OrderStyle::Market => (
                TimeInForce::Ioc,
                signal.max_slippage_pct.unwrap_or(self.config.market_slippage_pct),
            ),
            OrderStyle::Limit => (
                TimeInForce::Gtc,
                signal.max_slippage_pct.unwrap_or(self.config.limit_slippage_pct),
            ),
        };
        let limit_price = slippage_price(mark, is_buy, slippage);
        let order = OrderRequest {
            token: signal.token.clone(),
            is_buy,
            size,
            limit_price,
            kind: OrderKind::Limit { tif },
            reduce_only: false,
        };

        let mut pos = match self.submit(&order).await? {
            Fill::Filled { oid, price, size } => {
                let mut pos = new_position(price, size);
                pos.entry_order_id = oid;
                pos
            }
            Fill::Resting { oid } => {
                info!(token = %signal.token, oid, "Entry order resting");
                let mut pos = new_position(limit_price, size);
                pos.entry_order_id = Some(oid);
                pos.entry_resting = true;
                pos
            }
        };

        if let Err(e) = self.place_stop(&mut pos).await {
            warn!(token = %pos.token, error = %e, "Stop order failed, monitor will retry");
        }
        Ok(pos)
    }

    /// Reduce-only stop on the opposite side at the position's stop price.
    async fn place_stop(&self, pos: &mut OurPosition) -> Result<(), ExecutionError> {
        let order = OrderRequest {
            token: pos.token.clone(),
            is_buy: !pos.side.is_buy(),
            size: pos.size,
            limit_price: pos.stop_price,
            kind: OrderKind::StopMarket {
                trigger_price: pos.stop_price,
            },
            reduce_only: true,
        };
        let oid = match self.submit(&order).await? {
            Fill::Resting { oid } => Some(oid),
            Fill::Filled { oid, .. } => oid,
        };
        pos.stop_order_id = oid;
        info!(token = %pos.token, stop = %pos.stop_price, oid = ?oid, "Placed stop order");
        Ok(())
    }

    /// Place a stop for a live position that has none. Returns whether one
    /// was placed; the caller persists the position.
    pub async fn ensure_stop(&self, pos: &mut OurPosition) -> Result<bool, ExecutionError> {
        if !self.mode.is_live() || pos.stop_order_id.is_some() || !pos.is_open() {
            return Ok(false);
        }
        self.place_stop(pos).await?;
        Ok(true)
    }

    /// Cancel the known stop and any other reduce-only trigger orders left on
    /// the position's token. Returns how many cancels were sent.
    pub async fn cancel_stop_orders(&self, pos: &mut OurPosition) -> Result<usize, ExecutionError> {
        if !self.mode.is_live() {
            pos.stop_order_id = None;
            return Ok(0);
        }

        let mut cancelled = 0;
        if let Some(oid) = pos.stop_order_id {
            self.exchange.cancel_order(&pos.token, oid).await?;
            cancelled += 1;
        }
        for order in self.exchange.get_open_orders().await? {
            if order.coin == pos.token
                && order.is_trigger
                && order.reduce_only
                && Some(order.oid) != pos.stop_order_id
            {
                self.exchange.cancel_order(&pos.token, order.oid).await?;
                cancelled += 1;
            }
        }
        pos.stop_order_id = None;
        Ok(cancelled)
    }

    /// Reduce-only IOC for `size` against the mark. Returns the filled size
    /// and average price.
    async fn exit_order(&self, pos: &OurPosition, size: Decimal) -> Result<(Decimal, Decimal), ExecutionError> {
        let mark = self.mark_price(&pos.token).await?;
        if !self.mode.is_live() {
            return Ok((size, mark));
        }

        let is_buy = pos.side == Side::Short;
        let order = OrderRequest {
            token: pos.token.clone(),
            is_buy,
            size,
            limit_price: slippage_price(mark, is_buy, self.config.market_slippage_pct),
            kind: OrderKind::Limit { tif: TimeInForce::Ioc },
            reduce_only: true,
        };
        match self.submit(&order).await? {
            Fill::Filled { price, size, .. } => Ok((size, price)),
            Fill::Resting { oid } => {
                // IOC should never rest; pull it so it cannot fill later
                self.exchange.cancel_order(&pos.token, oid).await?;
                Err(ExecutionError::Rejected(format!("exit order {} rested", oid)))
            }
        }
    }

    /// Cancel the stop and place a new one for the current size.
    async fn resize_stop(&self, pos: &mut OurPosition) -> Result<(), ExecutionError> {
        if !self.mode.is_live() || pos.size <= Decimal::ZERO {
            return Ok(());
        }
        self.cancel_stop_orders(pos).await?;
        self.place_stop(pos).await
    }

    /// Fully close `pos` and record it. On failure the position stays open
    /// and untouched in storage, so the next cycle retries. A partly filled
    /// exit shrinks the position, re-places its stop and leaves it open.
    pub async fn close_position(
        &self,
        pos: &mut OurPosition,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Result<ExecutionResult> {
        let (filled, price) = match self.exit_order(pos, pos.size).await {
            Ok(fill) => fill,
            Err(e) => {
                warn!(position = %pos.id, token = %pos.token, reason = %reason, error = %e, "Close failed");
                return Ok(ExecutionResult::failed(e.to_string()));
            }
        };

        if filled < pos.size {
            let detail = format!("close filled {} of {}", filled, pos.size);
            let filled = pos.reduce(filled);
            warn!(
                position = %pos.id,
                token = %pos.token,
                reason = %reason,
                filled = %filled,
                remaining = %pos.size,
                "Close only partly filled, remainder stays open"
            );
            if filled > Decimal::ZERO {
                if let Err(e) = self.resize_stop(pos).await {
                    warn!(position = %pos.id, error = %e, "Failed to resize stop, monitor will retry");
                }
            }
            self.db.update_position(pos).await?;
            return Ok(ExecutionResult::partial(price, filled, detail));
        }

        if let Err(e) = self.cancel_stop_orders(pos).await {
            warn!(position = %pos.id, error = %e, "Failed to cancel stop orders after close");
        }

        pos.close(reason, Some(price), now);
        self.db.close_position(pos).await?;
        info!(
            position = %pos.id,
            token = %pos.token,
            reason = %reason,
            exit = %price,
            pnl = %pos.unrealized_pnl(price).round_dp(2),
            "Closed position"
        );
        Ok(ExecutionResult::filled(None, price, filled))
    }

    /// Close the record of a position that never got filled.
    pub async fn discard_position(&self, pos: &mut OurPosition, reason: CloseReason, now: DateTime<Utc>) -> Result<()> {
        if let Err(e) = self.cancel_stop_orders(pos).await {
            warn!(position = %pos.id, error = %e, "Failed to cancel stop orders");
        }
        pos.close(reason, None, now);
        self.db.close_position(pos).await?;
        info!(position = %pos.id, token = %pos.token, reason = %reason, "Discarded position");
        Ok(())
    }

    /// Close `fraction` of the remaining size and persist the smaller
    /// position. The stop is re-placed for the new size.
    pub async fn reduce_position(&self, pos: &mut OurPosition, fraction: Decimal) -> Result<ExecutionResult> {
        let size = (pos.size * fraction).round_dp(SIZE_DECIMALS).min(pos.size);
        if size <= Decimal::ZERO {
            return Ok(ExecutionResult::failed("reduction rounds to zero"));
        }

        let (filled, price) = match self.exit_order(pos, size).await {
            Ok(fill) => fill,
            Err(e) => {
                warn!(position = %pos.id, token = %pos.token, error = %e, "Reduce failed");
                return Ok(ExecutionResult::failed(e.to_string()));
            }
        };
        pos.reduce(filled);

        if let Err(e) = self.resize_stop(pos).await {
            warn!(position = %pos.id, error = %e, "Failed to resize stop, monitor will retry");
        }

        self.db.update_position(pos).await?;
        info!(
            position = %pos.id,
            token = %pos.token,
            reduced = %filled,
            remaining = %pos.size,
            price = %price,
            "Reduced position"
        );
        Ok(ExecutionResult::filled(None, price, filled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Decision, TradeAction};
    use crate::testing::FakeExchange;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn signal(side: Side, style: OrderStyle) -> Signal {
        Signal {
            id: "sig-1".to_string(),
            event_id: "evt-1".to_string(),
            trader_address: "0xtrader".to_string(),
            token: "ETH".to_string(),
            side,
            action: TradeAction::Open,
            value_usd: dec!(20000),
            position_weight: Some(dec!(0.2)),
            age_secs: 1000,
            event_price: dec!(2000),
            current_price: Some(dec!(2000)),
            slippage_pct: Some(Decimal::ZERO),
            slippage_ok: Some(true),
            priority_score: 80.0,
            copy_size_usd: dec!(200),
            leverage: 20,
            order_style: Some(style),
            max_slippage_pct: Some(dec!(0.005)),
            decision: Decision::Execute,
            reason: String::new(),
            created_at: Utc::now(),
        }
    }

    async fn setup(mode: ExecutionMode) -> (Executor, Arc<FakeExchange>, Arc<Database>) {
        let exchange = Arc::new(FakeExchange::new());
        exchange.set_mark("ETH", dec!(2000)).await;
        let db = Arc::new(Database::in_memory().await.unwrap());
        let executor = Executor::new(exchange.clone(), db.clone(), TradingConfig::default(), mode);
        (executor, exchange, db)
    }

    #[tokio::test]
    async fn test_paper_fill_at_mark_persists_one_position() {
        let (executor, exchange, db) = setup(ExecutionMode::Paper).await;
        let result = executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();

        assert!(result.success);
        assert_eq!(result.fill_price, Some(dec!(2000)));
        assert_eq!(result.fill_size, Some(dec!(0.1)));
        assert!(exchange.placed().await.is_empty());

        let open = db.list_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entry_price, dec!(2000));
        assert_eq!(open[0].stop_price, dec!(1900));
        assert_eq!(open[0].trailing_stop_price, dec!(1840));
        assert_eq!(open[0].leverage, 5);
        assert_eq!(open[0].source_signal_id, "sig-1");
    }

    #[tokio::test]
    async fn test_missing_mark_aborts_before_orders() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        exchange.clear_mark("ETH").await;

        let result = executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        assert!(!result.success);
        assert!(exchange.placed().await.is_empty());
        assert!(db.list_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_market_entry_places_ioc_and_stop() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        let result = executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        assert!(result.success);

        let placed = exchange.placed().await;
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].kind, OrderKind::Limit { tif: TimeInForce::Ioc });
        assert!(placed[0].is_buy);
        assert_eq!(placed[0].limit_price, dec!(2010));
        assert!(!placed[0].reduce_only);

        assert!(!placed[1].is_buy);
        assert!(placed[1].reduce_only);
        assert_eq!(placed[1].kind, OrderKind::StopMarket { trigger_price: dec!(1909.5) });

        assert_eq!(exchange.leverage_updates().await, vec![("ETH".to_string(), 5)]);
        let open = db.list_open_positions().await.unwrap();
        assert_eq!(open[0].entry_price, dec!(2010));
        assert!(open[0].stop_order_id.is_some());
    }

    #[tokio::test]
    async fn test_short_limit_entry_uses_gtc_below_mark() {
        let (executor, exchange, _db) = setup(ExecutionMode::Live).await;
        executor.execute(&signal(Side::Short, OrderStyle::Limit)).await.unwrap();

        let placed = exchange.placed().await;
        assert_eq!(placed[0].kind, OrderKind::Limit { tif: TimeInForce::Gtc });
        assert!(!placed[0].is_buy);
        assert_eq!(placed[0].limit_price, dec!(1990));
        // stop above the fill for shorts
        assert!(placed[1].is_buy);
        assert_eq!(placed[1].limit_price, dec!(2089.5));
    }

    #[tokio::test]
    async fn test_rejected_entry_records_nothing() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        exchange
            .script(Ok(json!({
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [{"error": "Insufficient margin"}]}}
            })))
            .await;

        let result = executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Insufficient margin"));
        assert_eq!(exchange.placed().await.len(), 1);
        assert!(db.list_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_response_is_a_failure() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        exchange.script(Ok(json!({"weird": true}))).await;

        let result = executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("weird"));
        assert!(db.list_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_failure_keeps_entry() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        exchange
            .script(Ok(json!({
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [
                    {"filled": {"oid": 7, "avgPx": "2001", "totalSz": "0.1"}}
                ]}}
            })))
            .await;
        exchange
            .script(Err(ApiError::Server {
                status: 502,
                body: "bad gateway".to_string(),
            }))
            .await;

        let result = executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.order_id, Some(7));

        let open = db.list_open_positions().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].entry_price, dec!(2001));
        assert_eq!(open[0].stop_order_id, None);

        let mut pos = open[0].clone();
        assert!(executor.ensure_stop(&mut pos).await.unwrap());
        assert!(pos.stop_order_id.is_some());
    }

    #[tokio::test]
    async fn test_resting_entry_uses_limit_as_provisional_price() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        exchange
            .script(Ok(json!({
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [{"resting": {"oid": 55}}]}}
            })))
            .await;

        let result = executor.execute(&signal(Side::Long, OrderStyle::Limit)).await.unwrap();
        assert!(result.success);
        assert!(result.is_resting());

        let pos = &db.list_open_positions().await.unwrap()[0];
        assert!(pos.entry_resting);
        assert_eq!(pos.entry_order_id, Some(55));
        assert_eq!(pos.entry_price, dec!(2010));
    }

    #[tokio::test]
    async fn test_close_cancels_stops_and_records_exit() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        let mut pos = db.list_open_positions().await.unwrap().remove(0);
        let stop_oid = pos.stop_order_id.unwrap();

        exchange.set_mark("ETH", dec!(2100)).await;
        let result = executor
            .close_position(&mut pos, CloseReason::TimeStop, Utc::now())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.fill_price, Some(dec!(2089.5)));
        assert!(exchange.cancelled().await.contains(&stop_oid));
        assert!(exchange.open_orders().await.is_empty());

        let stored = db.get_position(&pos.id).await.unwrap().unwrap();
        assert!(!stored.is_open());
        assert_eq!(stored.close_reason, Some(CloseReason::TimeStop));
        assert_eq!(stored.exit_price, Some(dec!(2089.5)));
    }

    #[tokio::test]
    async fn test_failed_close_leaves_position_open() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        let mut pos = db.list_open_positions().await.unwrap().remove(0);

        exchange
            .script(Err(ApiError::Network("connection reset".to_string())))
            .await;
        let result = executor
            .close_position(&mut pos, CloseReason::TrailingStop, Utc::now())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(pos.is_open());
        assert_eq!(db.list_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_close_keeps_remainder_open_with_stop() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        let mut pos = db.list_open_positions().await.unwrap().remove(0);
        let old_stop = pos.stop_order_id.unwrap();

        exchange
            .script(Ok(json!({
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [
                    {"filled": {"oid": 9, "avgPx": "2090", "totalSz": "0.04"}}
                ]}}
            })))
            .await;
        let result = executor
            .close_position(&mut pos, CloseReason::TrailingStop, Utc::now())
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.fill_size, Some(dec!(0.04)));
        assert!(pos.is_open());

        let stored = db.get_position(&pos.id).await.unwrap().unwrap();
        assert!(stored.is_open());
        assert_eq!(stored.size, dec!(0.06));
        assert_eq!(stored.close_reason, None);

        // the remainder is still protected
        assert!(exchange.cancelled().await.contains(&old_stop));
        let open = exchange.open_orders().await;
        assert_eq!(open.len(), 1);
        assert_eq!(stored.stop_order_id, Some(open[0].oid));
        let last = exchange.placed().await.pop().unwrap();
        assert!(last.reduce_only);
        assert_eq!(last.size, dec!(0.06));
    }

    #[tokio::test]
    async fn test_unrecordable_entry_is_flattened() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        db.close().await;

        let result = executor.execute(&signal(Side::Long, OrderStyle::Market)).await;
        assert!(result.is_err());

        let placed = exchange.placed().await;
        assert_eq!(placed.len(), 3);
        // entry, its stop, then a reduce-only IOC the other way
        assert!(matches!(placed[1].kind, OrderKind::StopMarket { .. }));
        assert_eq!(placed[2].kind, OrderKind::Limit { tif: TimeInForce::Ioc });
        assert!(placed[2].reduce_only);
        assert!(!placed[2].is_buy);
        assert_eq!(placed[2].size, placed[0].size);
        assert!(exchange.open_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_order_guard_refused_after_shutdown_starts() {
        let (executor, _exchange, _db) = setup(ExecutionMode::Live).await;
        let guard = executor.order_guard();
        assert!(guard.is_some());

        executor.stop_accepting();
        assert!(executor.order_guard().is_none());

        let mut waiter = tokio_test::task::spawn(executor.wait_in_flight());
        tokio_test::assert_pending!(waiter.poll());
        drop(guard);
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_paper_reduce_shrinks_and_persists() {
        let (executor, exchange, db) = setup(ExecutionMode::Paper).await;
        executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        let mut pos = db.list_open_positions().await.unwrap().remove(0);

        exchange.set_mark("ETH", dec!(2200)).await;
        let result = executor.reduce_position(&mut pos, dec!(0.25)).await.unwrap();
        assert_eq!(result.fill_size, Some(dec!(0.025)));
        assert_eq!(result.fill_price, Some(dec!(2200)));

        let stored = db.get_position(&pos.id).await.unwrap().unwrap();
        assert_eq!(stored.size, dec!(0.075));
        assert_eq!(stored.notional_usd, dec!(150));
    }

    #[tokio::test]
    async fn test_live_reduce_resizes_stop() {
        let (executor, exchange, db) = setup(ExecutionMode::Live).await;
        executor.execute(&signal(Side::Long, OrderStyle::Market)).await.unwrap();
        let mut pos = db.list_open_positions().await.unwrap().remove(0);
        let old_stop = pos.stop_order_id.unwrap();

        executor.reduce_position(&mut pos, dec!(0.5)).await.unwrap();
        assert!(exchange.cancelled().await.contains(&old_stop));
        let open = exchange.open_orders().await;
        assert_eq!(open.len(), 1);
        assert_ne!(Some(open[0].oid), Some(old_stop));
        assert_eq!(exchange.placed().await.last().unwrap().size, dec!(0.05));
    }
}
