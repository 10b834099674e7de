//! Trading configuration: signal gates, sizing, exits and trader selection.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};

/// Token symbols are matched upper-case, whatever the config file used.
fn uppercase_keys<'de, D>(deserializer: D) -> Result<HashMap<String, Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, Decimal>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect())
}

/// One profit-taking step: close `fraction` of the remaining size once the
/// unrealized gain reaches `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitTier {
    pub threshold: Decimal,
    pub fraction: Decimal,
}

/// Configuration for signal evaluation, sizing and position management.
/// Percentages are fractions (0.08 = 8%).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    // ---- gates ----
    /// Oldest an Add may be, measured from the position's open, to be copied
    pub max_add_age_secs: i64,

    /// Minimum source trade value in USD, per token
    #[serde(deserialize_with = "uppercase_keys")]
    pub min_trade_size_usd: HashMap<String, Decimal>,

    /// Minimum source trade value for tokens not listed above
    pub default_min_trade_size_usd: Decimal,

    /// Source trade value relative to the trader's account value
    pub min_position_weight: Decimal,
    pub max_position_weight: Decimal,

    /// Wait this long after a trade before trusting it
    pub copy_delay_secs: i64,

    /// Reject if price moved more than this since the source trade
    pub max_slippage_pct: Decimal,

    /// Signals at most this old may go out as market orders
    pub fresh_signal_secs: i64,

    /// Signals older than this are stale
    pub max_signal_age_secs: i64,

    /// Trader score below which signals are ignored
    pub min_confidence_score: f64,

    /// Trader score at which fresh signals go out as market orders
    pub high_confidence_score: f64,

    pub market_slippage_pct: Decimal,
    pub limit_slippage_pct: Decimal,

    /// Require several tracked traders on the same token and side
    pub require_consensus: bool,
    pub min_consensus_traders: usize,
    pub consensus_window_secs: i64,

    pub max_open_positions: usize,
    pub max_total_exposure_usd: Decimal,
    pub max_token_exposure_usd: Decimal,

    // ---- sizing ----
    /// Our equity used for sizing
    pub account_value_usd: Decimal,

    /// "mirror", "score" or "fixed"
    pub sizing_method: String,

    /// Base fraction of equity per copy for score sizing
    pub base_position_pct: Decimal,

    pub fixed_size_usd: Decimal,
    pub min_order_usd: Decimal,
    pub max_order_usd: Decimal,

    // ---- execution ----
    pub default_leverage: u32,

    /// Hard ceiling whatever the source trader uses
    pub max_leverage: u32,

    pub stop_loss_pct: Decimal,
    pub trailing_stop_pct: Decimal,

    // ---- exits ----
    pub max_position_hours: i64,

    /// Increasing thresholds
    pub profit_tiers: Vec<ProfitTier>,

    pub blacklist_hours: i64,

    /// Close when the source trader closes normally
    pub follow_trader_exits: bool,

    /// How far back to look for the source trader's Close
    pub exit_lookback_secs: i64,

    // ---- trader selection ----
    pub leaderboard_days: u32,
    pub top_traders: usize,
    pub min_trades: u32,
    pub max_win_rate: f64,

    /// One-sided binomial significance for beating a coin flip
    pub significance_level: f64,

    pub min_account_value_usd: Decimal,
    pub smart_money_only: bool,
}

impl Default for TradingConfig {
    fn default() -> Self {
        let min_trade_size_usd = HashMap::from([
            ("BTC".to_string(), dec!(25000)),
            ("ETH".to_string(), dec!(10000)),
            ("SOL".to_string(), dec!(5000)),
        ]);

        Self {
            max_add_age_secs: 2 * 3600,
            min_trade_size_usd,
            default_min_trade_size_usd: dec!(2000),
            min_position_weight: dec!(0.02),
            max_position_weight: dec!(3.0),
            copy_delay_secs: 15 * 60,
            max_slippage_pct: dec!(0.02),
            fresh_signal_secs: 30 * 60,
            max_signal_age_secs: 2 * 3600,
            min_confidence_score: 40.0,
            high_confidence_score: 70.0,
            market_slippage_pct: dec!(0.005),
            limit_slippage_pct: dec!(0.002),
            require_consensus: false,
            min_consensus_traders: 2,
            consensus_window_secs: 3600,
            max_open_positions: 5,
            max_total_exposure_usd: dec!(5000),
            max_token_exposure_usd: dec!(2000),
            account_value_usd: dec!(1000),
            sizing_method: "score".to_string(),
            base_position_pct: dec!(0.1),
            fixed_size_usd: dec!(100),
            min_order_usd: dec!(10),
            max_order_usd: dec!(1000),
            default_leverage: 3,
            max_leverage: 5,
            stop_loss_pct: dec!(0.05),
            trailing_stop_pct: dec!(0.08),
            max_position_hours: 72,
            profit_tiers: vec![
                ProfitTier { threshold: dec!(0.05), fraction: dec!(0.25) },
                ProfitTier { threshold: dec!(0.10), fraction: dec!(0.33) },
                ProfitTier { threshold: dec!(0.20), fraction: dec!(0.5) },
            ],
            blacklist_hours: 168,
            follow_trader_exits: true,
            exit_lookback_secs: 3600,
            leaderboard_days: 30,
            top_traders: 10,
            min_trades: 20,
            max_win_rate: 0.9,
            significance_level: 0.05,
            min_account_value_usd: dec!(10000),
            smart_money_only: false,
        }
    }
}

impl TradingConfig {
    pub fn min_trade_size_for(&self, token: &str) -> Decimal {
        self.min_trade_size_usd
            .get(&token.to_uppercase())
            .copied()
            .unwrap_or(self.default_min_trade_size_usd)
    }

    /// Clamp a requested leverage into `[1, max_leverage]`.
    pub fn cap_leverage(&self, requested: u32) -> u32 {
        requested.clamp(1, self.max_leverage.max(1))
    }

    /// Reject settings the monitor and evaluator cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.trailing_stop_pct <= Decimal::ZERO || self.trailing_stop_pct >= Decimal::ONE {
            anyhow::bail!("trailing_stop_pct must be in (0, 1)");
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= Decimal::ONE {
            anyhow::bail!("stop_loss_pct must be in (0, 1)");
        }
        if self.trailing_stop_pct <= self.stop_loss_pct {
            anyhow::bail!("trailing_stop_pct must be wider than stop_loss_pct");
        }
        if self.fresh_signal_secs > self.max_signal_age_secs {
            anyhow::bail!("fresh_signal_secs must not exceed max_signal_age_secs");
        }
        if self.min_position_weight > self.max_position_weight {
            anyhow::bail!("min_position_weight must not exceed max_position_weight");
        }
        if self.profit_tiers.len() > u8::MAX as usize {
            anyhow::bail!("too many profit tiers");
        }
        for pair in self.profit_tiers.windows(2) {
            if pair[1].threshold <= pair[0].threshold {
                anyhow::bail!("profit tier thresholds must increase");
            }
        }
        if self
            .profit_tiers
            .iter()
            .any(|t| t.fraction <= Decimal::ZERO || t.fraction > Decimal::ONE)
        {
            anyhow::bail!("profit tier fractions must be in (0, 1]");
        }
        Ok(())
    }
}
