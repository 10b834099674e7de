//! Our copy position and the trailing-stop arithmetic applied to it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Side;
use crate::api::DataError;

/// Lifecycle state of a copy position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closed" => Ok(PositionStatus::Closed),
            _ => Err(DataError::InvalidValue {
                field: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// Why a position was fully closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TrailingStop,
    TimeStop,
    TraderLiquidated,
    TraderExited,
    EntryCancelled,
    /// Last profit tier took the whole remaining size
    TakeProfit,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::TimeStop => "time_stop",
            CloseReason::TraderLiquidated => "trader_liquidated",
            CloseReason::TraderExited => "trader_exited",
            CloseReason::EntryCancelled => "entry_cancelled",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Manual => "manual",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trailing_stop" => Ok(CloseReason::TrailingStop),
            "time_stop" => Ok(CloseReason::TimeStop),
            "trader_liquidated" => Ok(CloseReason::TraderLiquidated),
            "trader_exited" => Ok(CloseReason::TraderExited),
            "entry_cancelled" => Ok(CloseReason::EntryCancelled),
            "take_profit" => Ok(CloseReason::TakeProfit),
            "manual" => Ok(CloseReason::Manual),
            _ => Err(DataError::InvalidValue {
                field: "close_reason",
                value: s.to_string(),
            }),
        }
    }
}

/// A copy position we hold on the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OurPosition {
    pub id: String,
    pub token: String,
    pub side: Side,

    /// Average fill price (provisional limit price while the entry rests)
    pub entry_price: Decimal,

    /// Size in token units
    pub size: Decimal,

    /// Entry notional in USD
    pub notional_usd: Decimal,

    pub leverage: u32,

    /// Fixed protective stop placed on the exchange
    pub stop_price: Decimal,

    /// Ratcheting stop enforced by the monitor
    pub trailing_stop_price: Decimal,

    /// Best price seen for longs
    pub highest_price: Decimal,

    /// Best price seen for shorts
    pub lowest_price: Decimal,

    /// Highest profit-take tier already executed (0 = none)
    pub last_tier_fired: u8,

    pub entry_order_id: Option<u64>,

    /// Entry order accepted but not yet filled
    pub entry_resting: bool,

    pub stop_order_id: Option<u64>,

    pub opened_at: DateTime<Utc>,
    pub source_trader: String,
    pub source_signal_id: String,

    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
}

/// Price `pct` away from `price` on the losing side of `side`.
pub fn stop_price_for(side: Side, price: Decimal, pct: Decimal) -> Decimal {
    match side {
        Side::Long => price * (Decimal::ONE - pct),
        Side::Short => price * (Decimal::ONE + pct),
    }
}

impl OurPosition {
    /// Create an open position from a fill.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        token: String,
        side: Side,
        fill_price: Decimal,
        size: Decimal,
        leverage: u32,
        stop_loss_pct: Decimal,
        trailing_stop_pct: Decimal,
        source_trader: String,
        source_signal_id: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            token,
            side,
            entry_price: fill_price,
            size,
            notional_usd: fill_price * size,
            leverage,
            stop_price: stop_price_for(side, fill_price, stop_loss_pct),
            trailing_stop_price: stop_price_for(side, fill_price, trailing_stop_pct),
            highest_price: fill_price,
            lowest_price: fill_price,
            last_tier_fired: 0,
            entry_order_id: None,
            entry_resting: false,
            stop_order_id: None,
            opened_at: Utc::now(),
            source_trader,
            source_signal_id,
            status: PositionStatus::Open,
            close_reason: None,
            closed_at: None,
            exit_price: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Best price observed so far in our favour.
    pub fn water_mark(&self) -> Decimal {
        match self.side {
            Side::Long => self.highest_price,
            Side::Short => self.lowest_price,
        }
    }

    /// Whether `candidate` is at least as favourable a stop as `current`.
    fn stop_at_least_as_favorable(&self, candidate: Decimal, current: Decimal) -> bool {
        match self.side {
            Side::Long => candidate >= current,
            Side::Short => candidate <= current,
        }
    }

    /// Advance the water-mark if `price` is a new favourable extreme.
    /// Returns true when the water-mark moved.
    pub fn observe_price(&mut self, price: Decimal) -> bool {
        match self.side {
            Side::Long if price > self.highest_price => {
                self.highest_price = price;
                true
            }
            Side::Short if price < self.lowest_price => {
                self.lowest_price = price;
                true
            }
            _ => false,
        }
    }

    /// Observe `price`, recompute the trailing stop from the water-mark and
    /// apply it only if it does not widen the stop. Returns the resulting
    /// trailing stop.
    pub fn update_trailing_stop(&mut self, price: Decimal, trailing_pct: Decimal) -> Decimal {
        if self.observe_price(price) {
            let candidate = stop_price_for(self.side, self.water_mark(), trailing_pct);
            if self.stop_at_least_as_favorable(candidate, self.trailing_stop_price) {
                self.trailing_stop_price = candidate;
            }
        }
        self.trailing_stop_price
    }

    /// Price has reached or crossed the trailing stop on the losing side.
    pub fn trailing_stop_triggered(&self, price: Decimal) -> bool {
        match self.side {
            Side::Long => price <= self.trailing_stop_price,
            Side::Short => price >= self.trailing_stop_price,
        }
    }

    /// Unrealized return on entry price as a fraction (unlevered).
    pub fn unrealized_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        match self.side {
            Side::Long => (price - self.entry_price) / self.entry_price,
            Side::Short => (self.entry_price - price) / self.entry_price,
        }
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.unrealized_pct(price) * self.entry_price * self.size
    }

    pub fn holding_duration(&self, now: DateTime<Utc>) -> Duration {
        now - self.opened_at
    }

    /// Reduce the position after a partial fill on the way out.
    pub fn reduce(&mut self, size: Decimal) -> Decimal {
        let reduced = size.min(self.size);
        self.size -= reduced;
        self.notional_usd = self.size * self.entry_price;
        reduced
    }

    /// Mark the position closed.
    pub fn close(&mut self, reason: CloseReason, exit_price: Option<Decimal>, now: DateTime<Utc>) {
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.closed_at = Some(now);
        self.exit_price = exit_price;
    }
}
