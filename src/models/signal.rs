//! Signal audit records and deferred re-check entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Side, TradeAction, TradeEvent};
use crate::api::DataError;

/// Outcome of evaluating one trade event. Exactly one tag per signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Execute,
    SkipBlacklisted,
    SkipUntracked,
    SkipAction,
    SkipTradeSize,
    SkipPositionWeight,
    SkipPositionGone,
    SkipNoPrice,
    SkipSlippage,
    SkipStale,
    SkipLowConfidence,
    SkipConsensus,
    SkipMaxPositions,
    SkipMaxExposure,
    SkipTokenExposure,
    SkipSize,
}

impl Decision {
    pub const ALL: [Decision; 16] = [
        Decision::Execute,
        Decision::SkipBlacklisted,
        Decision::SkipUntracked,
        Decision::SkipAction,
        Decision::SkipTradeSize,
        Decision::SkipPositionWeight,
        Decision::SkipPositionGone,
        Decision::SkipNoPrice,
        Decision::SkipSlippage,
        Decision::SkipStale,
        Decision::SkipLowConfidence,
        Decision::SkipConsensus,
        Decision::SkipMaxPositions,
        Decision::SkipMaxExposure,
        Decision::SkipTokenExposure,
        Decision::SkipSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Execute => "EXECUTE",
            Decision::SkipBlacklisted => "SKIP_BLACKLISTED",
            Decision::SkipUntracked => "SKIP_UNTRACKED",
            Decision::SkipAction => "SKIP_ACTION",
            Decision::SkipTradeSize => "SKIP_TRADE_SIZE",
            Decision::SkipPositionWeight => "SKIP_POSITION_WEIGHT",
            Decision::SkipPositionGone => "SKIP_POSITION_GONE",
            Decision::SkipNoPrice => "SKIP_NO_PRICE",
            Decision::SkipSlippage => "SKIP_SLIPPAGE",
            Decision::SkipStale => "SKIP_STALE",
            Decision::SkipLowConfidence => "SKIP_LOW_CONFIDENCE",
            Decision::SkipConsensus => "SKIP_CONSENSUS",
            Decision::SkipMaxPositions => "SKIP_MAX_POSITIONS",
            Decision::SkipMaxExposure => "SKIP_MAX_EXPOSURE",
            Decision::SkipTokenExposure => "SKIP_TOKEN_EXPOSURE",
            Decision::SkipSize => "SKIP_SIZE",
        }
    }

    pub fn is_execute(&self) -> bool {
        matches!(self, Decision::Execute)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decision::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| DataError::InvalidValue {
                field: "decision",
                value: s.to_string(),
            })
    }
}

/// How the entry order should be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStyle {
    /// Immediate-or-cancel at a slippage-adjusted limit
    Market,
    /// Good-til-cancelled at a slippage-adjusted limit
    Limit,
}

impl OrderStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStyle::Market => "market",
            OrderStyle::Limit => "limit",
        }
    }
}

impl FromStr for OrderStyle {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderStyle::Market),
            "limit" => Ok(OrderStyle::Limit),
            _ => Err(DataError::InvalidValue {
                field: "order_type",
                value: s.to_string(),
            }),
        }
    }
}

/// Immutable decision record for one trade event, persisted for audit
/// whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub event_id: String,
    pub trader_address: String,
    pub token: String,
    pub side: Side,
    pub action: TradeAction,

    /// Source trade notional in USD
    pub value_usd: Decimal,

    /// Source trade value relative to the trader's account value
    pub position_weight: Option<Decimal>,

    pub age_secs: i64,

    /// Price at the source trade
    pub event_price: Decimal,

    /// Mark price when the slippage gate ran
    pub current_price: Option<Decimal>,

    pub slippage_pct: Option<Decimal>,

    /// `None` when evaluation stopped before the slippage gate
    pub slippage_ok: Option<bool>,

    pub priority_score: f64,

    /// Our copy size in USD
    pub copy_size_usd: Decimal,

    pub leverage: u32,

    pub order_style: Option<OrderStyle>,

    /// Slippage budget for the entry order
    pub max_slippage_pct: Option<Decimal>,

    pub decision: Decision,

    /// Human-readable detail for the decision
    pub reason: String,

    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn is_execute(&self) -> bool {
        self.decision.is_execute()
    }
}

/// A trade event waiting for its copy delay to elapse.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredSignal {
    pub event: TradeEvent,
    pub check_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_round_trips_through_tag() {
        for decision in Decision::ALL {
            assert_eq!(decision.as_str().parse::<Decision>().unwrap(), decision);
        }
        assert!("SKIP_WHATEVER".parse::<Decision>().is_err());
    }

    #[test]
    fn test_only_execute_is_execute() {
        let executes: Vec<_> = Decision::ALL.iter().filter(|d| d.is_execute()).collect();
        assert_eq!(executes, vec![&Decision::Execute]);
        assert!(Decision::ALL[1..].iter().all(|d| d.as_str().starts_with("SKIP_")));
    }

    #[test]
    fn test_serde_tag_matches_db_tag() {
        let json = serde_json::to_string(&Decision::SkipTokenExposure).unwrap();
        assert_eq!(json, "\"SKIP_TOKEN_EXPOSURE\"");
    }
}
