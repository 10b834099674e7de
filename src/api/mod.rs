//! Upstream clients: rate limiting, retrying HTTP, the perp data feed and
//! the exchange.

mod error;
mod http;
mod hyperliquid;
mod nansen;
mod rate_limiter;
mod types;

pub use error::{ApiError, DataError};
pub use http::{RetryPolicy, RetryingClient};
pub use hyperliquid::{
    Exchange, HyperliquidClient, OpenOrder, OrderKind, OrderOutcome, OrderRequest, OrderState,
    TimeInForce, EXCHANGE_PATH, HYPERLIQUID_MAINNET, HYPERLIQUID_TESTNET, INFO_PATH,
};
pub use nansen::{
    DataFeed, NansenClient, LEADERBOARD_PATH, NANSEN_API_BASE, POSITIONS_PATH, TRADES_PATH,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterState};
