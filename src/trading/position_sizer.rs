//! Position sizing: mirror the source weight, scale by trader score, or fixed.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::TradingConfig;

/// Position sizing method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    /// Same share of our equity as the source trade is of theirs
    Mirror,
    /// Base fraction of equity scaled by the trader's priority score
    Score,
    /// Fixed USD amount
    Fixed,
}

impl SizingMethod {
    pub fn from_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "mirror" | "proportional" => Self::Mirror,
            "fixed" => Self::Fixed,
            _ => Self::Score,
        }
    }
}

/// Calculator for copy sizes in USD.
pub struct PositionSizer {
    config: TradingConfig,
    method: SizingMethod,
}

impl PositionSizer {
    /// Create a new position sizer with given config.
    pub fn new(config: TradingConfig) -> Self {
        let method = SizingMethod::from_name(&config.sizing_method);
        Self { config, method }
    }

    pub fn method(&self) -> SizingMethod {
        self.method
    }

    /// Calculate the copy size for a trade.
    ///
    /// # Arguments
    /// * `position_weight` - Source trade value over the trader's account value
    /// * `trader_score` - Priority score of the trader (0-100)
    /// * `current_exposure` - Notional of our open positions in USD
    ///
    /// # Returns
    /// Copy size in USD, zero when the trade should not be taken
    pub fn calculate_size(
        &self,
        position_weight: Option<Decimal>,
        trader_score: f64,
        current_exposure: Decimal,
    ) -> Decimal {
        let equity = self.config.account_value_usd;

        let sized = match self.method {
            SizingMethod::Mirror => match position_weight {
                Some(weight) => equity * weight,
                None => Decimal::ZERO,
            },
            SizingMethod::Score => equity * self.config.base_position_pct * score_multiplier(trader_score),
            SizingMethod::Fixed => self.config.fixed_size_usd,
        };

        self.apply_constraints(sized, current_exposure)
    }

    /// Apply order-size and exposure limits.
    fn apply_constraints(&self, size: Decimal, current_exposure: Decimal) -> Decimal {
        if size <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let mut final_size = size.min(self.config.max_order_usd);

        // Remaining total exposure capacity
        let remaining_capacity = self.config.max_total_exposure_usd - current_exposure;
        if remaining_capacity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        final_size = final_size.min(remaining_capacity);

        // Too small to be worth an order
        if final_size < self.config.min_order_usd {
            return Decimal::ZERO;
        }

        final_size.round_dp(2)
    }
}

/// 0.5x at score 0 up to 1.5x at score 100.
fn score_multiplier(score: f64) -> Decimal {
    let score = Decimal::try_from(score.clamp(0.0, 100.0)).unwrap_or(dec!(50));
    dec!(0.5) + score / dec!(100)
}
