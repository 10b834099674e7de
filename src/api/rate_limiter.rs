//! Admission control for one endpoint class.
//!
//! A limiter enforces a minimum spacing between requests, a per-second cap,
//! a per-minute cap and any cooldown imposed after the server signalled a
//! rate limit. State survives restarts through a small JSON file.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Trailing window kept in state.
const WINDOW: chrono::Duration = chrono::Duration::seconds(60);
const SECOND: chrono::Duration = chrono::Duration::seconds(1);

/// Caps for one endpoint class. A cap of zero disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
    pub min_interval_ms: u64,
}

impl RateLimitConfig {
    pub fn new(per_second: u32, per_minute: u32, min_interval_ms: u64) -> Self {
        Self {
            per_second,
            per_minute,
            min_interval_ms,
        }
    }

    pub fn min_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.min_interval_ms as i64)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(5, 100, 100)
    }
}

/// Recent admissions and the cooldown deadline of one limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterState {
    /// Admission times, oldest first, bounded to the trailing minute
    pub timestamps: VecDeque<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl RateLimiterState {
    /// Forget admissions that can no longer affect any window, and an
    /// expired cooldown.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.timestamps.front() {
            if now - *front >= WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        if matches!(self.cooldown_until, Some(until) if until <= now) {
            self.cooldown_until = None;
        }
    }

    /// How long a request arriving at `now` must wait. Zero means admit.
    pub fn required_delay(&mut self, config: &RateLimitConfig, now: DateTime<Utc>) -> chrono::Duration {
        self.prune(now);
        let mut delay = chrono::Duration::zero();

        if let Some(until) = self.cooldown_until {
            delay = delay.max(until - now);
        }

        if let Some(last) = self.timestamps.back() {
            let ready_at = *last + config.min_interval();
            if ready_at > now {
                delay = delay.max(ready_at - now);
            }
        }

        delay = delay.max(self.window_delay(config.per_second, SECOND, now));
        delay = delay.max(self.window_delay(config.per_minute, WINDOW, now));
        delay
    }

    /// Wait until fewer than `cap` admissions fall inside `[t - window, t)`.
    fn window_delay(&self, cap: u32, window: chrono::Duration, now: DateTime<Utc>) -> chrono::Duration {
        if cap == 0 {
            return chrono::Duration::zero();
        }
        let recent: Vec<&DateTime<Utc>> = self
            .timestamps
            .iter()
            .filter(|ts| now - **ts < window)
            .collect();
        let cap = cap as usize;
        if recent.len() < cap {
            return chrono::Duration::zero();
        }
        let blocking = *recent[recent.len() - cap];
        (blocking + window - now).max(chrono::Duration::zero())
    }

    pub fn record(&mut self, now: DateTime<Utc>) {
        self.timestamps.push_back(now);
    }

    /// Push the cooldown out to `now + retry_after`, never pulling it in.
    pub fn extend_cooldown(&mut self, now: DateTime<Utc>, retry_after: Duration) -> DateTime<Utc> {
        let retry_after = chrono::Duration::from_std(retry_after).unwrap_or(WINDOW);
        let candidate = now + retry_after;
        let until = match self.cooldown_until {
            Some(current) if current >= candidate => current,
            _ => candidate,
        };
        self.cooldown_until = Some(until);
        until
    }
}

/// A named limiter, shared by every request bound to its endpoint class.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    state: Mutex<RateLimiterState>,
    path: Option<PathBuf>,
}

impl RateLimiter {
    /// Limiter without persistence.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(RateLimiterState::default()),
            path: None,
        }
    }

    /// Limiter whose state lives in `<state_dir>/<name>.json`. Stale
    /// timestamps and an expired cooldown are dropped on load; an unreadable
    /// file starts fresh.
    pub fn load(name: impl Into<String>, config: RateLimitConfig, state_dir: &Path) -> Self {
        let name = name.into();
        let path = state_dir.join(format!("{}.json", name));

        let mut state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<RateLimiterState>(&raw).unwrap_or_else(|e| {
                warn!(limiter = %name, error = %e, "Discarding unreadable limiter state");
                RateLimiterState::default()
            }),
            Err(_) => RateLimiterState::default(),
        };
        state.prune(Utc::now());

        if let Some(until) = state.cooldown_until {
            info!(limiter = %name, until = %until, "Restored rate-limit cooldown");
        }

        Self {
            name,
            config,
            state: Mutex::new(state),
            path: Some(path),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Suspend until a request may proceed, then record it.
    ///
    /// The lock is held across the sleep so concurrent callers queue behind
    /// each other instead of spending the same capacity.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Utc::now();
            let delay = state.required_delay(&self.config, now);
            if delay <= chrono::Duration::zero() {
                state.record(now);
                break;
            }
            debug!(limiter = %self.name, delay_ms = delay.num_milliseconds(), "Throttling request");
            tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
        }
        self.persist(&state).await;
    }

    /// Server answered 429: hold every admission for at least `retry_after`.
    pub async fn notify_rate_limited(&self, retry_after: Duration) -> DateTime<Utc> {
        let mut state = self.state.lock().await;
        let until = state.extend_cooldown(Utc::now(), retry_after);
        warn!(limiter = %self.name, until = %until, "Rate limited by server, cooling down");
        self.persist(&state).await;
        until
    }

    pub async fn snapshot(&self) -> RateLimiterState {
        self.state.lock().await.clone()
    }

    async fn persist(&self, state: &RateLimiterState) {
        let Some(path) = &self.path else {
            return;
        };
        let raw = match serde_json::to_vec(state) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(limiter = %self.name, error = %e, "Failed to encode limiter state");
                return;
            }
        };
        let tmp = path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, &raw).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!(limiter = %self.name, path = %path.display(), error = %e, "Failed to persist limiter state");
        }
    }
}
