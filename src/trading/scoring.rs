//! Trader selection: anti-luck filtering, priority scoring and the tracked
//! trader book.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::distribution::{Binomial, DiscreteCDF};
use tokio::sync::RwLock;

use super::TradingConfig;
use crate::models::{LeaderboardEntry, TrackedTrader};

/// Why a leaderboard row was not tracked.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Blacklisted,
    NotSmartMoney,
    Unprofitable,
    SmallAccount,
    TooFewTrades(u32),
    ImplausibleWinRate(f64),
    /// Win rate not distinguishable from a coin flip (p-value)
    NotSignificant(f64),
}

/// Scores leaderboard rows and picks the set worth copying.
pub struct TraderScorer {
    config: TradingConfig,
}

impl TraderScorer {
    pub fn new(config: TradingConfig) -> Self {
        Self { config }
    }

    /// Probability of at least `wins` heads in `trades` fair coin flips.
    pub fn coin_flip_p_value(wins: u64, trades: u64) -> f64 {
        if wins == 0 {
            return 1.0;
        }
        match Binomial::new(0.5, trades) {
            Ok(dist) => dist.sf(wins - 1),
            Err(_) => 1.0,
        }
    }

    /// Anti-luck filter. Rows without trade statistics skip the statistical
    /// checks rather than being rejected.
    pub fn check(&self, entry: &LeaderboardEntry) -> Result<(), Rejection> {
        if self.config.smart_money_only && !entry.is_smart_money() {
            return Err(Rejection::NotSmartMoney);
        }
        if entry.total_pnl <= Decimal::ZERO || entry.roi <= Decimal::ZERO {
            return Err(Rejection::Unprofitable);
        }
        if entry.account_value < self.config.min_account_value_usd {
            return Err(Rejection::SmallAccount);
        }

        if let Some(trades) = entry.trade_count {
            if trades < self.config.min_trades {
                return Err(Rejection::TooFewTrades(trades));
            }
            if let Some(win_rate) = entry.win_rate {
                if win_rate > self.config.max_win_rate {
                    return Err(Rejection::ImplausibleWinRate(win_rate));
                }
                let wins = (win_rate * trades as f64).round() as u64;
                let p = Self::coin_flip_p_value(wins, trades as u64);
                if p > self.config.significance_level {
                    return Err(Rejection::NotSignificant(p));
                }
            }
        }
        Ok(())
    }

    /// Priority score in `[0, 100]`.
    ///
    /// ROI contributes up to 40 (saturating at 100%), PnL up to 30 on a log
    /// scale (saturating at $10M), win rate up to 20 (50% to 80%), and a
    /// smart-money label adds 10.
    pub fn score(&self, entry: &LeaderboardEntry) -> f64 {
        let roi = entry.roi.to_f64().unwrap_or(0.0).clamp(0.0, 1.0);
        let pnl = entry.total_pnl.to_f64().unwrap_or(0.0).max(1.0);
        let pnl_component = (pnl.log10() / 7.0).clamp(0.0, 1.0);
        let win_component = entry
            .win_rate
            .map(|w| ((w - 0.5) / 0.3).clamp(0.0, 1.0))
            .unwrap_or(0.5);
        let label_bonus = if entry.is_smart_money() { 10.0 } else { 0.0 };

        (roi * 40.0 + pnl_component * 30.0 + win_component * 20.0 + label_bonus).clamp(0.0, 100.0)
    }

    /// Filter, score and keep the top N, best first.
    pub fn select(
        &self,
        entries: &[LeaderboardEntry],
        blacklisted: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> (Vec<TrackedTrader>, Vec<(String, Rejection)>) {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for entry in entries {
            if blacklisted.contains(&entry.address) {
                rejected.push((entry.address.clone(), Rejection::Blacklisted));
                continue;
            }
            match self.check(entry) {
                Ok(()) => accepted.push(TrackedTrader {
                    address: entry.address.clone(),
                    label: entry.label.clone(),
                    account_value: entry.account_value,
                    score: self.score(entry),
                    updated_at: now,
                }),
                Err(reason) => rejected.push((entry.address.clone(), reason)),
            }
        }

        accepted.sort_by(|a, b| b.score.total_cmp(&a.score));
        accepted.truncate(self.config.top_traders);
        (accepted, rejected)
    }
}

/// The currently tracked traders, shared by the poller, the evaluator and
/// the leaderboard refresh.
#[derive(Debug, Clone, Default)]
pub struct TraderBook {
    inner: Arc<RwLock<HashMap<String, TrackedTrader>>>,
}

impl TraderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace(&self, traders: Vec<TrackedTrader>) {
        let mut inner = self.inner.write().await;
        inner.clear();
        inner.extend(traders.into_iter().map(|t| (t.address.clone(), t)));
    }

    pub async fn get(&self, address: &str) -> Option<TrackedTrader> {
        self.inner.read().await.get(address).cloned()
    }

    pub async fn remove(&self, address: &str) -> Option<TrackedTrader> {
        self.inner.write().await.remove(address)
    }

    /// Tracked traders, best score first.
    pub async fn all(&self) -> Vec<TrackedTrader> {
        let mut traders: Vec<_> = self.inner.read().await.values().cloned().collect();
        traders.sort_by(|a, b| b.score.total_cmp(&a.score));
        traders
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(address: &str, win_rate: Option<f64>, trades: Option<u32>) -> LeaderboardEntry {
        LeaderboardEntry {
            address: address.to_string(),
            label: String::new(),
            total_pnl: dec!(250000),
            roi: dec!(0.6),
            account_value: dec!(500000),
            win_rate,
            trade_count: trades,
        }
    }

    #[test]
    fn test_coin_flip_p_value() {
        // 60 wins of 100 is significant at 5%, 55 of 100 is not
        assert!(TraderScorer::coin_flip_p_value(60, 100) < 0.05);
        assert!(TraderScorer::coin_flip_p_value(55, 100) > 0.05);
        assert_eq!(TraderScorer::coin_flip_p_value(0, 10), 1.0);
        let all = TraderScorer::coin_flip_p_value(10, 10);
        assert!((all - 1.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn test_anti_luck_filter() {
        let scorer = TraderScorer::new(TradingConfig::default());
        assert_eq!(scorer.check(&entry("a", Some(0.65), Some(200))), Ok(()));
        assert_eq!(
            scorer.check(&entry("b", Some(0.7), Some(5))),
            Err(Rejection::TooFewTrades(5))
        );
        assert_eq!(
            scorer.check(&entry("c", Some(0.97), Some(300))),
            Err(Rejection::ImplausibleWinRate(0.97))
        );
        assert!(matches!(
            scorer.check(&entry("d", Some(0.52), Some(50))),
            Err(Rejection::NotSignificant(_))
        ));
        // no stats: statistical checks do not apply
        assert_eq!(scorer.check(&entry("e", None, None)), Ok(()));
    }

    #[test]
    fn test_unprofitable_and_small_accounts_rejected() {
        let scorer = TraderScorer::new(TradingConfig::default());
        let losing = LeaderboardEntry {
            total_pnl: dec!(-5),
            ..entry("a", None, None)
        };
        assert_eq!(scorer.check(&losing), Err(Rejection::Unprofitable));
        let small = LeaderboardEntry {
            account_value: dec!(500),
            ..entry("b", None, None)
        };
        assert_eq!(scorer.check(&small), Err(Rejection::SmallAccount));
    }

    #[test]
    fn test_score_bounds_and_ordering() {
        let scorer = TraderScorer::new(TradingConfig::default());
        let strong = LeaderboardEntry {
            roi: dec!(2.0),
            total_pnl: dec!(50000000),
            label: "Smart HL Perps Trader".to_string(),
            ..entry("a", Some(0.85), Some(400))
        };
        assert_eq!(scorer.score(&strong), 100.0);

        let weak = LeaderboardEntry {
            roi: dec!(0.05),
            total_pnl: dec!(1000),
            ..entry("b", Some(0.5), Some(400))
        };
        let s = scorer.score(&weak);
        assert!(s > 0.0 && s < 30.0);
    }

    #[test]
    fn test_select_skips_blacklisted_and_truncates() {
        let config = TradingConfig {
            top_traders: 2,
            ..Default::default()
        };
        let scorer = TraderScorer::new(config);
        let entries = vec![
            LeaderboardEntry { roi: dec!(0.1), ..entry("0x1", None, None) },
            LeaderboardEntry { roi: dec!(0.9), ..entry("0x2", None, None) },
            LeaderboardEntry { roi: dec!(0.5), ..entry("0x3", None, None) },
            LeaderboardEntry { roi: dec!(1.0), ..entry("0xbad", None, None) },
        ];
        let blacklisted = HashSet::from(["0xbad".to_string()]);

        let (tracked, rejected) = scorer.select(&entries, &blacklisted, Utc::now());
        let addresses: Vec<_> = tracked.iter().map(|t| t.address.as_str()).collect();
        assert_eq!(addresses, vec!["0x2", "0x3"]);
        assert_eq!(rejected, vec![("0xbad".to_string(), Rejection::Blacklisted)]);
    }

    #[tokio::test]
    async fn test_book_replace_and_lookup() {
        let book = TraderBook::new();
        let scorer = TraderScorer::new(TradingConfig::default());
        let (tracked, _) = scorer.select(&[entry("0x1", None, None)], &HashSet::new(), Utc::now());
        book.replace(tracked).await;

        assert_eq!(book.len().await, 1);
        assert!(book.get("0x1").await.is_some());
        book.remove("0x1").await;
        assert!(book.get("0x1").await.is_none());
    }
}
