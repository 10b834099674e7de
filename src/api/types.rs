//! Wire records for the upstream data feed and their validated conversion
//! into domain types.

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::error::DataError;
use crate::models::{LeaderboardEntry, Side, SourcePosition, TradeAction, TradeEvent};

/// Row from `/api/v1/perp-leaderboard`.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardRow {
    pub trader_address: Option<String>,
    #[serde(default)]
    pub trader_address_label: Option<String>,
    pub total_pnl: Option<Decimal>,
    /// Percent, e.g. `42.5`
    pub roi: Option<Decimal>,
    pub account_value: Option<Decimal>,
    #[serde(default)]
    pub win_rate: Option<f64>,
    #[serde(default)]
    pub trades_count: Option<u32>,
}

impl TryFrom<LeaderboardRow> for LeaderboardEntry {
    type Error = DataError;

    fn try_from(row: LeaderboardRow) -> Result<Self, Self::Error> {
        let address = non_empty(row.trader_address, "trader_address")?;
        Ok(LeaderboardEntry {
            address,
            label: row.trader_address_label.unwrap_or_default(),
            total_pnl: row.total_pnl.ok_or(DataError::MissingField("total_pnl"))?,
            roi: row.roi.ok_or(DataError::MissingField("roi"))? / Decimal::ONE_HUNDRED,
            account_value: row.account_value.unwrap_or_default(),
            win_rate: row.win_rate,
            trade_count: row.trades_count,
        })
    }
}

/// Row from `/api/v1/profiler/perp-positions`. `size` is signed when no
/// explicit side is given.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionRow {
    pub token_symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    pub size: Option<Decimal>,
    pub entry_price_usd: Option<Decimal>,
    #[serde(default)]
    pub position_value_usd: Option<Decimal>,
    #[serde(default)]
    pub leverage_value: Option<u32>,
    #[serde(default)]
    pub liquidation_price_usd: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionsResponse {
    #[serde(default)]
    pub data: Vec<PositionRow>,
}

impl TryFrom<PositionRow> for SourcePosition {
    type Error = DataError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        let token = non_empty(row.token_symbol, "token_symbol")?;
        let size = row.size.ok_or(DataError::MissingField("size"))?;
        let side = match row.side.as_deref() {
            Some(raw) => raw.parse::<Side>()?,
            None if size.is_sign_negative() => Side::Short,
            None => Side::Long,
        };
        let entry_price = row.entry_price_usd.ok_or(DataError::MissingField("entry_price_usd"))?;
        let size = size.abs();
        Ok(SourcePosition {
            token,
            side,
            size,
            entry_price,
            value_usd: row
                .position_value_usd
                .map(|v| v.abs())
                .unwrap_or(size * entry_price),
            leverage: row.leverage_value,
            liquidation_price: row.liquidation_price_usd,
        })
    }
}

/// Row from `/api/v1/profiler/perp-trades`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeRow {
    pub timestamp: Option<serde_json::Value>,
    pub token_symbol: Option<String>,
    pub side: Option<String>,
    pub action: Option<String>,
    pub price_usd: Option<Decimal>,
    #[serde(default)]
    pub token_amount: Option<Decimal>,
    pub value_usd: Option<Decimal>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

impl TradeRow {
    /// Convert into a domain event for `trader_address`.
    pub fn into_event(self, trader_address: &str) -> Result<TradeEvent, DataError> {
        let timestamp = parse_timestamp(self.timestamp.as_ref().ok_or(DataError::MissingField("timestamp"))?)?;
        let token = non_empty(self.token_symbol, "token_symbol")?;
        let side: Side = self.side.as_deref().ok_or(DataError::MissingField("side"))?.parse()?;
        let action: TradeAction = self
            .action
            .as_deref()
            .ok_or(DataError::MissingField("action"))?
            .parse()?;
        let price = self.price_usd.ok_or(DataError::MissingField("price_usd"))?;
        if price <= Decimal::ZERO {
            return Err(DataError::InvalidValue {
                field: "price_usd",
                value: price.to_string(),
            });
        }
        let size = self.token_amount.map(|s| s.abs()).unwrap_or_default();
        let value_usd = self
            .value_usd
            .map(|v| v.abs())
            .unwrap_or(size * price);
        let tx_hash = self.transaction_hash.unwrap_or_default();

        Ok(TradeEvent {
            id: TradeEvent::make_id(&tx_hash, &token, timestamp),
            trader_address: trader_address.to_string(),
            token,
            side,
            action,
            price,
            size,
            value_usd,
            timestamp,
            tx_hash,
            position_opened_at: None,
        })
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, DataError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(DataError::MissingField(field)),
    }
}

/// Accepts RFC 3339, naive ISO-8601 (taken as UTC), or epoch seconds/millis.
pub fn parse_timestamp(raw: &serde_json::Value) -> Result<DateTime<Utc>, DataError> {
    let invalid = || DataError::InvalidValue {
        field: "timestamp",
        value: raw.to_string(),
    };

    match raw {
        serde_json::Value::Number(n) => {
            let n = n.as_i64().ok_or_else(invalid)?;
            // anything past year 2286 in seconds is really millis
            let parsed = if n > 9_999_999_999 {
                DateTime::from_timestamp_millis(n)
            } else {
                DateTime::from_timestamp(n, 0)
            };
            parsed.ok_or_else(invalid)
        }
        serde_json::Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .map(|naive| naive.and_utc())
                .map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}
