//! In-memory collaborators for exercising the trading core without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::api::{ApiError, DataFeed, Exchange, OpenOrder, OrderKind, OrderRequest, OrderState};
use crate::models::{LeaderboardEntry, SourcePosition, TradeEvent};

/// Exchange fake. Unless a response is scripted, limit orders fill in full at
/// their limit price and stop orders rest with a fresh order id.
#[derive(Default)]
pub struct FakeExchange {
    marks: Mutex<HashMap<String, Decimal>>,
    scripted: Mutex<VecDeque<Result<Value, ApiError>>>,
    placed: Mutex<Vec<OrderRequest>>,
    cancelled: Mutex<Vec<u64>>,
    statuses: Mutex<HashMap<u64, OrderState>>,
    open_orders: Mutex<Vec<OpenOrder>>,
    leverage: Mutex<Vec<(String, u32)>>,
    next_oid: AtomicU64,
}

impl FakeExchange {
    pub fn new() -> Self {
        Self {
            next_oid: AtomicU64::new(1000),
            ..Default::default()
        }
    }

    pub async fn set_mark(&self, token: &str, price: Decimal) {
        self.marks.lock().await.insert(token.to_string(), price);
    }

    pub async fn clear_mark(&self, token: &str) {
        self.marks.lock().await.remove(token);
    }

    /// Queue the raw response for the next `place_order`.
    pub async fn script(&self, response: Result<Value, ApiError>) {
        self.scripted.lock().await.push_back(response);
    }

    pub async fn set_status(&self, oid: u64, state: OrderState) {
        self.statuses.lock().await.insert(oid, state);
    }

    pub async fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().await.clone()
    }

    pub async fn cancelled(&self) -> Vec<u64> {
        self.cancelled.lock().await.clone()
    }

    pub async fn open_orders(&self) -> Vec<OpenOrder> {
        self.open_orders.lock().await.clone()
    }

    pub async fn leverage_updates(&self) -> Vec<(String, u32)> {
        self.leverage.lock().await.clone()
    }

    fn oid(&self) -> u64 {
        self.next_oid.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn place_order(&self, order: &OrderRequest) -> Result<Value, ApiError> {
        self.placed.lock().await.push(order.clone());
        if let Some(response) = self.scripted.lock().await.pop_front() {
            return response;
        }

        let oid = self.oid();
        match order.kind {
            OrderKind::Limit { .. } => Ok(json!({
                "status": "ok",
                "response": {"type": "order", "data": {"statuses": [
                    {"filled": {"oid": oid, "avgPx": order.limit_price.to_string(), "totalSz": order.size.to_string()}}
                ]}}
            })),
            OrderKind::StopMarket { .. } => {
                self.open_orders.lock().await.push(OpenOrder {
                    coin: order.token.clone(),
                    oid,
                    is_trigger: true,
                    reduce_only: order.reduce_only,
                });
                Ok(json!({
                    "status": "ok",
                    "response": {"type": "order", "data": {"statuses": [{"resting": {"oid": oid}}]}}
                }))
            }
        }
    }

    async fn cancel_order(&self, _token: &str, order_id: u64) -> Result<bool, ApiError> {
        self.cancelled.lock().await.push(order_id);
        let mut open = self.open_orders.lock().await;
        let before = open.len();
        open.retain(|o| o.oid != order_id);
        Ok(open.len() < before)
    }

    async fn get_order_status(&self, order_id: u64) -> Result<OrderState, ApiError> {
        Ok(self
            .statuses
            .lock()
            .await
            .get(&order_id)
            .cloned()
            .unwrap_or(OrderState::Unknown))
    }

    async fn get_mark_price(&self, token: &str) -> Result<Option<Decimal>, ApiError> {
        Ok(self.marks.lock().await.get(token).copied())
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, ApiError> {
        Ok(self.open_orders.lock().await.clone())
    }

    async fn update_leverage(&self, token: &str, leverage: u32) -> Result<(), ApiError> {
        self.leverage.lock().await.push((token.to_string(), leverage));
        Ok(())
    }
}

/// Data feed fake backed by per-address tables.
#[derive(Default)]
pub struct FakeFeed {
    leaderboard: Mutex<Vec<LeaderboardEntry>>,
    positions: Mutex<HashMap<String, Vec<SourcePosition>>>,
    trades: Mutex<HashMap<String, Vec<TradeEvent>>>,
    failing: Mutex<Option<ApiError>>,
    position_calls: AtomicUsize,
}

impl FakeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_leaderboard(&self, entries: Vec<LeaderboardEntry>) {
        *self.leaderboard.lock().await = entries;
    }

    pub async fn set_positions(&self, address: &str, positions: Vec<SourcePosition>) {
        self.positions.lock().await.insert(address.to_string(), positions);
    }

    pub async fn set_trades(&self, address: &str, trades: Vec<TradeEvent>) {
        self.trades.lock().await.insert(address.to_string(), trades);
    }

    /// Make every call fail with `error` until cleared with `None`.
    pub async fn fail_with(&self, error: Option<ApiError>) {
        *self.failing.lock().await = error;
    }

    pub fn position_calls(&self) -> usize {
        self.position_calls.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<(), ApiError> {
        match self.failing.lock().await.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataFeed for FakeFeed {
    async fn get_leaderboard(&self, _window_days: u32) -> Result<Vec<LeaderboardEntry>, ApiError> {
        self.check().await?;
        Ok(self.leaderboard.lock().await.clone())
    }

    async fn get_address_positions(&self, address: &str) -> Result<Vec<SourcePosition>, ApiError> {
        self.position_calls.fetch_add(1, Ordering::SeqCst);
        self.check().await?;
        Ok(self
            .positions
            .lock()
            .await
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_address_trades(&self, address: &str, window: Duration) -> Result<Vec<TradeEvent>, ApiError> {
        self.check().await?;
        let cutoff = Utc::now() - window;
        let mut trades: Vec<TradeEvent> = self
            .trades
            .lock()
            .await
            .get(address)
            .map(|t| t.iter().filter(|e| e.timestamp >= cutoff).cloned().collect())
            .unwrap_or_default();
        trades.sort_by_key(|e| e.timestamp);
        Ok(trades)
    }
}
