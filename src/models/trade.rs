//! Trade event model: one fill observed on a tracked trader's perp feed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::DataError;

/// Direction of a perpetual position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// Whether opening this side is a buy on the exchange.
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Long)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" | "b" => Ok(Side::Long),
            "short" | "sell" | "a" | "s" => Ok(Side::Short),
            _ => Err(DataError::InvalidValue {
                field: "side",
                value: s.to_string(),
            }),
        }
    }
}

/// What the trade did to the trader's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Open,
    Add,
    Reduce,
    Close,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Open => "open",
            TradeAction::Add => "add",
            TradeAction::Reduce => "reduce",
            TradeAction::Close => "close",
        }
    }

    /// Open or Add: the trader increased exposure.
    pub fn is_entry(&self) -> bool {
        matches!(self, TradeAction::Open | TradeAction::Add)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(TradeAction::Open),
            "add" => Ok(TradeAction::Add),
            "reduce" => Ok(TradeAction::Reduce),
            "close" => Ok(TradeAction::Close),
            _ => Err(DataError::InvalidValue {
                field: "action",
                value: s.to_string(),
            }),
        }
    }
}

/// A raw trade observed on a source trader's feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    /// Stable identifier (tx hash + token + timestamp)
    pub id: String,

    /// Source trader's address
    pub trader_address: String,

    /// Perp token symbol (e.g. "BTC")
    pub token: String,

    pub side: Side,

    pub action: TradeAction,

    /// Fill price in USD
    pub price: Decimal,

    /// Size in token units
    pub size: Decimal,

    /// Notional value in USD
    pub value_usd: Decimal,

    /// When the fill happened
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub tx_hash: String,

    /// When the position this trade belongs to was opened, if known
    #[serde(default)]
    pub position_opened_at: Option<DateTime<Utc>>,
}

impl TradeEvent {
    /// Age of the event relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Build the stable id used for deduplication.
    pub fn make_id(tx_hash: &str, token: &str, timestamp: DateTime<Utc>) -> String {
        format!("{}:{}:{}", tx_hash, token, timestamp.timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn event(action: TradeAction, minutes_ago: i64) -> TradeEvent {
        let timestamp = Utc::now() - Duration::minutes(minutes_ago);
        TradeEvent {
            id: TradeEvent::make_id("0xabc", "ETH", timestamp),
            trader_address: "0xtrader".to_string(),
            token: "ETH".to_string(),
            side: Side::Long,
            action,
            price: dec!(2000),
            size: dec!(5),
            value_usd: dec!(10000),
            timestamp,
            tx_hash: "0xabc".to_string(),
            position_opened_at: None,
        }
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!("Long".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Short);
        assert!("sideways".parse::<Side>().is_err());
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert!(Side::Long.is_buy());
        assert!(!Side::Short.is_buy());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("Open".parse::<TradeAction>().unwrap(), TradeAction::Open);
        assert_eq!("close".parse::<TradeAction>().unwrap(), TradeAction::Close);
        assert!("liquidate".parse::<TradeAction>().is_err());
        assert!(TradeAction::Add.is_entry());
        assert!(!TradeAction::Reduce.is_entry());
    }

    #[test]
    fn test_event_age() {
        let e = event(TradeAction::Open, 5);
        let age = e.age(Utc::now());
        assert!(age >= Duration::minutes(5));
        assert!(age < Duration::minutes(6));
    }

    #[test]
    fn test_stable_id() {
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(TradeEvent::make_id("0xff", "BTC", ts), "0xff:BTC:1700000000000");
    }
}
