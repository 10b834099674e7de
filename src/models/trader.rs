//! Source trader models: leaderboard rows, tracked traders and their positions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;

/// One row from the upstream perp leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub address: String,

    /// Provider label (e.g. "Smart HL Perps Trader")
    #[serde(default)]
    pub label: String,

    pub total_pnl: Decimal,

    /// Return on investment as a fraction
    pub roi: Decimal,

    pub account_value: Decimal,

    #[serde(default)]
    pub win_rate: Option<f64>,

    #[serde(default)]
    pub trade_count: Option<u32>,
}

impl LeaderboardEntry {
    /// Whether the provider labels this address as smart money.
    pub fn is_smart_money(&self) -> bool {
        let label = self.label.to_lowercase();
        label.contains("smart") || label.contains("fund")
    }
}

/// A trader we are copying, with the priority score assigned at refresh time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedTrader {
    pub address: String,

    #[serde(default)]
    pub label: String,

    /// Account value used for position-weight checks
    pub account_value: Decimal,

    /// Priority score (0-100)
    pub score: f64,

    pub updated_at: DateTime<Utc>,
}

impl TrackedTrader {
    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            let end = self.address.len().min(10);
            format!("{}...", &self.address[..end])
        } else {
            self.label.clone()
        }
    }
}

/// A position currently held by a source trader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub token: String,
    pub side: Side,

    /// Absolute size in token units
    pub size: Decimal,

    pub entry_price: Decimal,
    pub value_usd: Decimal,

    #[serde(default)]
    pub leverage: Option<u32>,

    #[serde(default)]
    pub liquidation_price: Option<Decimal>,
}

impl SourcePosition {
    /// Whether this position backs a copy on `token`/`side`.
    pub fn matches(&self, token: &str, side: Side) -> bool {
        self.token.eq_ignore_ascii_case(token) && self.side == side && !self.size.is_zero()
    }
}
