//! Perp trade-data feed: leaderboard, address positions and address trades.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, warn};

use super::error::{ApiError, DataError};
use super::http::RetryingClient;
use super::types::{LeaderboardRow, PositionRow, PositionsResponse, TradeRow};
use crate::models::{LeaderboardEntry, SourcePosition, TradeEvent};

pub const NANSEN_API_BASE: &str = "https://api.nansen.ai";

pub const LEADERBOARD_PATH: &str = "/api/v1/perp-leaderboard";
pub const POSITIONS_PATH: &str = "/api/v1/profiler/perp-positions";
pub const TRADES_PATH: &str = "/api/v1/profiler/perp-trades";

/// Upstream source of trader rankings, positions and fills.
#[async_trait]
pub trait DataFeed: Send + Sync {
    /// Ranked traders over the trailing `window_days`.
    async fn get_leaderboard(&self, window_days: u32) -> Result<Vec<LeaderboardEntry>, ApiError>;

    /// Positions currently open for `address`.
    async fn get_address_positions(&self, address: &str) -> Result<Vec<SourcePosition>, ApiError>;

    /// Fills for `address` within the trailing `window`, oldest first.
    async fn get_address_trades(&self, address: &str, window: Duration) -> Result<Vec<TradeEvent>, ApiError>;
}

/// Client for the Nansen perp endpoints.
pub struct NansenClient {
    http: RetryingClient,
    page_size: u32,
}

impl NansenClient {
    pub fn new(http: RetryingClient) -> Self {
        Self { http, page_size: 100 }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// Convert wire rows, logging and dropping the malformed ones.
fn convert_rows<R, T>(rows: Vec<R>, what: &'static str, convert: impl Fn(R) -> Result<T, DataError>) -> Vec<T> {
    let total = rows.len();
    let items: Vec<T> = rows
        .into_iter()
        .filter_map(|row| match convert(row) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(kind = what, error = %e, "Skipping malformed record");
                None
            }
        })
        .collect();
    if items.len() < total {
        debug!(kind = what, kept = items.len(), total, "Dropped malformed records");
    }
    items
}

#[async_trait]
impl DataFeed for NansenClient {
    async fn get_leaderboard(&self, window_days: u32) -> Result<Vec<LeaderboardEntry>, ApiError> {
        let to = Utc::now().date_naive();
        let from = to - Duration::days(window_days.max(1) as i64);
        let body = json!({
            "date": {"from": from.to_string(), "to": to.to_string()},
            "order_by": [{"field": "total_pnl", "direction": "DESC"}],
        });

        let rows: Vec<LeaderboardRow> = self
            .http
            .post_paginated(LEADERBOARD_PATH, body, self.page_size)
            .await?;
        Ok(convert_rows(rows, "leaderboard", LeaderboardEntry::try_from))
    }

    async fn get_address_positions(&self, address: &str) -> Result<Vec<SourcePosition>, ApiError> {
        let body = json!({ "address": address });
        let response: PositionsResponse = self.http.post(POSITIONS_PATH, &body).await?;
        Ok(convert_rows::<PositionRow, _>(
            response.data,
            "position",
            SourcePosition::try_from,
        ))
    }

    async fn get_address_trades(&self, address: &str, window: Duration) -> Result<Vec<TradeEvent>, ApiError> {
        let to = Utc::now();
        let from = to - window;
        let body = json!({
            "address": address,
            "date": {"from": from.to_rfc3339(), "to": to.to_rfc3339()},
            "order_by": [{"field": "timestamp", "direction": "ASC"}],
        });

        let rows: Vec<TradeRow> = self
            .http
            .post_paginated(TRADES_PATH, body, self.page_size)
            .await?;
        let mut events = convert_rows(rows, "trade", |row: TradeRow| row.into_event(address));
        // feed order is by fill time
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rate_limiter::{RateLimitConfig, RateLimiter};
    use crate::models::{Side, TradeAction};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> NansenClient {
        let limiter = Arc::new(RateLimiter::new("nansen", RateLimitConfig::new(0, 0, 0)));
        let http = RetryingClient::new(server.uri(), limiter)
            .unwrap()
            .with_header("apikey", "test-key")
            .unwrap();
        NansenClient::new(http).with_page_size(2)
    }

    #[tokio::test]
    async fn test_trades_are_converted_sorted_and_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TRADES_PATH))
            .and(header("apikey", "test-key"))
            .and(body_partial_json(json!({"address": "0xabc"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"timestamp": "2025-03-01T12:05:00Z", "token_symbol": "ETH", "side": "Long",
                     "action": "Add", "price_usd": 3010, "value_usd": 6020, "transaction_hash": "0x2"},
                    {"timestamp": "2025-03-01T12:00:00Z", "token_symbol": "ETH", "side": "Long",
                     "action": "Open", "price_usd": 3000, "value_usd": 9000, "transaction_hash": "0x1"},
                    {"timestamp": "2025-03-01T12:06:00Z", "token_symbol": "ETH",
                     "action": "Open", "price_usd": 3000}
                ],
                "pagination": {"page": 1, "per_page": 2, "is_last_page": true}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let events = client(&server)
            .get_address_trades("0xabc", Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, TradeAction::Open);
        assert_eq!(events[1].action, TradeAction::Add);
        assert!(events.iter().all(|e| e.trader_address == "0xabc"));
    }

    #[tokio::test]
    async fn test_positions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(POSITIONS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"token_symbol": "BTC", "size": "0.5", "entry_price_usd": "90000", "leverage_value": 20},
                    {"token_symbol": "SOL", "size": "-3", "entry_price_usd": "150"}
                ]
            })))
            .mount(&server)
            .await;

        let positions = client(&server).get_address_positions("0xabc").await.unwrap();
        assert_eq!(positions.len(), 2);
        assert!(positions[0].matches("BTC", Side::Long));
        assert!(positions[1].matches("SOL", Side::Short));
    }

    #[tokio::test]
    async fn test_leaderboard_walks_pages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(LEADERBOARD_PATH))
            .and(body_partial_json(json!({"pagination": {"page": 1}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"trader_address": "0x1", "total_pnl": 10, "roi": 5, "account_value": 100},
                    {"trader_address": "0x2", "total_pnl": 9, "roi": 4, "account_value": 100}
                ],
                "pagination": {"page": 1, "per_page": 2, "is_last_page": false}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(LEADERBOARD_PATH))
            .and(body_partial_json(json!({"pagination": {"page": 2}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"trader_address": "0x3", "total_pnl": 8, "roi": 3, "account_value": 100}],
                "pagination": {"page": 2, "per_page": 2, "is_last_page": true}
            })))
            .mount(&server)
            .await;

        let rows = client(&server).get_leaderboard(30).await.unwrap();
        let addresses: Vec<_> = rows.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["0x1", "0x2", "0x3"]);
    }
}
