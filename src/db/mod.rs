//! SQLite persistence for everything the copier needs to resume after a
//! restart:
//! - Our positions, open and closed
//! - The signal audit trail and the seen-event set
//! - The liquidation blacklist
//! - The tracked trader book

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{
    CloseReason, Decision, OrderStyle, OurPosition, PositionStatus, Signal, TrackedTrader,
};

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: String,
    pub token: String,
    pub side: String,
    pub entry_price: String,
    pub size: String,
    pub notional_usd: String,
    pub leverage: i64,
    pub stop_price: String,
    pub trailing_stop_price: String,
    pub highest_price: String,
    pub lowest_price: String,
    pub last_tier_fired: i64,
    pub entry_order_id: Option<i64>,
    pub entry_resting: bool,
    pub stop_order_id: Option<i64>,
    pub opened_at: String,
    pub source_trader: String,
    pub source_signal_id: String,
    pub status: String,
    pub close_reason: Option<String>,
    pub closed_at: Option<String>,
    pub exit_price: Option<String>,
}

/// Stored signal audit record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSignal {
    pub id: String,
    pub event_id: String,
    pub trader_address: String,
    pub token: String,
    pub side: String,
    pub action: String,
    pub value_usd: String,
    pub position_weight: Option<String>,
    pub age_secs: i64,
    pub event_price: String,
    pub current_price: Option<String>,
    pub slippage_pct: Option<String>,
    pub slippage_ok: Option<bool>,
    pub priority_score: f64,
    pub copy_size_usd: String,
    pub leverage: i64,
    pub order_type: Option<String>,
    pub max_slippage_pct: Option<String>,
    pub decision: String,
    pub reason: String,
    pub created_at: String,
}

/// Stored tracked trader.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrader {
    pub address: String,
    pub label: String,
    pub account_value: String,
    pub score: f64,
    pub updated_at: String,
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid decimal in {}: {}", field, raw))
}

fn parse_opt_decimal(raw: Option<&str>, field: &str) -> Result<Option<Decimal>> {
    raw.map(|r| parse_decimal(r, field)).transpose()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {}", raw))?
        .with_timezone(&Utc))
}

impl TryFrom<StoredPosition> for OurPosition {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        Ok(OurPosition {
            side: row.side.parse()?,
            entry_price: parse_decimal(&row.entry_price, "entry_price")?,
            size: parse_decimal(&row.size, "size")?,
            notional_usd: parse_decimal(&row.notional_usd, "notional_usd")?,
            leverage: u32::try_from(row.leverage).context("Invalid leverage")?,
            stop_price: parse_decimal(&row.stop_price, "stop_price")?,
            trailing_stop_price: parse_decimal(&row.trailing_stop_price, "trailing_stop_price")?,
            highest_price: parse_decimal(&row.highest_price, "highest_price")?,
            lowest_price: parse_decimal(&row.lowest_price, "lowest_price")?,
            last_tier_fired: u8::try_from(row.last_tier_fired).context("Invalid tier marker")?,
            entry_order_id: row.entry_order_id.map(|o| o as u64),
            entry_resting: row.entry_resting,
            stop_order_id: row.stop_order_id.map(|o| o as u64),
            opened_at: parse_time(&row.opened_at)?,
            status: row.status.parse::<PositionStatus>()?,
            close_reason: row
                .close_reason
                .as_deref()
                .map(str::parse::<CloseReason>)
                .transpose()?,
            closed_at: row.closed_at.as_deref().map(parse_time).transpose()?,
            exit_price: parse_opt_decimal(row.exit_price.as_deref(), "exit_price")?,
            id: row.id,
            token: row.token,
            source_trader: row.source_trader,
            source_signal_id: row.source_signal_id,
        })
    }
}

impl TryFrom<StoredSignal> for Signal {
    type Error = anyhow::Error;

    fn try_from(row: StoredSignal) -> Result<Self> {
        Ok(Signal {
            side: row.side.parse()?,
            action: row.action.parse()?,
            value_usd: parse_decimal(&row.value_usd, "value_usd")?,
            position_weight: parse_opt_decimal(row.position_weight.as_deref(), "position_weight")?,
            age_secs: row.age_secs,
            event_price: parse_decimal(&row.event_price, "event_price")?,
            current_price: parse_opt_decimal(row.current_price.as_deref(), "current_price")?,
            slippage_pct: parse_opt_decimal(row.slippage_pct.as_deref(), "slippage_pct")?,
            slippage_ok: row.slippage_ok,
            priority_score: row.priority_score,
            copy_size_usd: parse_decimal(&row.copy_size_usd, "copy_size_usd")?,
            leverage: u32::try_from(row.leverage).context("Invalid leverage")?,
            order_style: row
                .order_type
                .as_deref()
                .map(OrderStyle::from_str)
                .transpose()?,
            max_slippage_pct: parse_opt_decimal(row.max_slippage_pct.as_deref(), "max_slippage_pct")?,
            decision: row.decision.parse::<Decision>()?,
            created_at: parse_time(&row.created_at)?,
            id: row.id,
            event_id: row.event_id,
            trader_address: row.trader_address,
            token: row.token,
            reason: row.reason,
        })
    }
}

impl TryFrom<StoredTrader> for TrackedTrader {
    type Error = anyhow::Error;

    fn try_from(row: StoredTrader) -> Result<Self> {
        Ok(TrackedTrader {
            account_value: parse_decimal(&row.account_value, "account_value")?,
            updated_at: parse_time(&row.updated_at)?,
            address: row.address,
            label: row.label,
            score: row.score,
        })
    }
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. One connection that never recycles, so
    /// the schema lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                size TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                stop_price TEXT NOT NULL,
                trailing_stop_price TEXT NOT NULL,
                highest_price TEXT NOT NULL,
                lowest_price TEXT NOT NULL,
                last_tier_fired INTEGER NOT NULL DEFAULT 0,
                entry_order_id INTEGER,
                entry_resting INTEGER NOT NULL DEFAULT 0,
                stop_order_id INTEGER,
                opened_at TEXT NOT NULL,
                source_trader TEXT NOT NULL,
                source_signal_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                close_reason TEXT,
                closed_at TEXT,
                exit_price TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE,
                trader_address TEXT NOT NULL,
                token TEXT NOT NULL,
                side TEXT NOT NULL,
                action TEXT NOT NULL,
                value_usd TEXT NOT NULL,
                position_weight TEXT,
                age_secs INTEGER NOT NULL,
                event_price TEXT NOT NULL,
                current_price TEXT,
                slippage_pct TEXT,
                slippage_ok INTEGER,
                priority_score REAL NOT NULL,
                copy_size_usd TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                order_type TEXT,
                max_slippage_pct TEXT,
                decision TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_events (
                event_id TEXT PRIMARY KEY,
                trader_address TEXT NOT NULL,
                seen_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blacklist (
                address TEXT PRIMARY KEY,
                until TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traders (
                address TEXT PRIMARY KEY,
                label TEXT NOT NULL DEFAULT '',
                account_value TEXT NOT NULL,
                score REAL NOT NULL,
                is_tracked INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Positions ====================

    /// Record a newly opened position.
    pub async fn insert_position(&self, pos: &OurPosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, token, side, entry_price, size, notional_usd, leverage,
                stop_price, trailing_stop_price, highest_price, lowest_price,
                last_tier_fired, entry_order_id, entry_resting, stop_order_id,
                opened_at, source_trader, source_signal_id, status,
                close_reason, closed_at, exit_price
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pos.id)
        .bind(&pos.token)
        .bind(pos.side.as_str())
        .bind(pos.entry_price.to_string())
        .bind(pos.size.to_string())
        .bind(pos.notional_usd.to_string())
        .bind(pos.leverage as i64)
        .bind(pos.stop_price.to_string())
        .bind(pos.trailing_stop_price.to_string())
        .bind(pos.highest_price.to_string())
        .bind(pos.lowest_price.to_string())
        .bind(pos.last_tier_fired as i64)
        .bind(pos.entry_order_id.map(|o| o as i64))
        .bind(pos.entry_resting)
        .bind(pos.stop_order_id.map(|o| o as i64))
        .bind(pos.opened_at.to_rfc3339())
        .bind(&pos.source_trader)
        .bind(&pos.source_signal_id)
        .bind(pos.status.as_str())
        .bind(pos.close_reason.map(|r| r.as_str()))
        .bind(pos.closed_at.map(|t| t.to_rfc3339()))
        .bind(pos.exit_price.map(|p| p.to_string()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert position {}", pos.id))?;

        Ok(())
    }

    /// Write back every mutable field of a position.
    pub async fn update_position(&self, pos: &OurPosition) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                entry_price = ?, size = ?, notional_usd = ?,
                stop_price = ?, trailing_stop_price = ?,
                highest_price = ?, lowest_price = ?, last_tier_fired = ?,
                entry_order_id = ?, entry_resting = ?, stop_order_id = ?,
                status = ?, close_reason = ?, closed_at = ?, exit_price = ?,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(pos.entry_price.to_string())
        .bind(pos.size.to_string())
        .bind(pos.notional_usd.to_string())
        .bind(pos.stop_price.to_string())
        .bind(pos.trailing_stop_price.to_string())
        .bind(pos.highest_price.to_string())
        .bind(pos.lowest_price.to_string())
        .bind(pos.last_tier_fired as i64)
        .bind(pos.entry_order_id.map(|o| o as i64))
        .bind(pos.entry_resting)
        .bind(pos.stop_order_id.map(|o| o as i64))
        .bind(pos.status.as_str())
        .bind(pos.close_reason.map(|r| r.as_str()))
        .bind(pos.closed_at.map(|t| t.to_rfc3339()))
        .bind(pos.exit_price.map(|p| p.to_string()))
        .bind(&pos.id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update position {}", pos.id))?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Position {} not found", pos.id);
        }
        Ok(())
    }

    /// Persist a terminal close. The position must already be marked closed.
    pub async fn close_position(&self, pos: &OurPosition) -> Result<()> {
        if pos.is_open() {
            anyhow::bail!("Position {} is still open", pos.id);
        }
        self.update_position(pos).await
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<OurPosition>> {
        let row = sqlx::query_as::<_, StoredPosition>("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OurPosition::try_from).transpose()
    }

    /// All open positions, oldest first.
    pub async fn list_open_positions(&self) -> Result<Vec<OurPosition>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE status = 'open' ORDER BY opened_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch positions")?;

        rows.into_iter().map(OurPosition::try_from).collect()
    }

    // ==================== Signals ====================

    /// Append a signal to the audit trail and mark its event seen, atomically.
    /// Returns false if the event already had a signal.
    pub async fn record_signal(&self, signal: &Signal) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO signals (
                id, event_id, trader_address, token, side, action, value_usd,
                position_weight, age_secs, event_price, current_price, slippage_pct,
                slippage_ok, priority_score, copy_size_usd, leverage, order_type,
                max_slippage_pct, decision, reason, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&signal.id)
        .bind(&signal.event_id)
        .bind(&signal.trader_address)
        .bind(&signal.token)
        .bind(signal.side.as_str())
        .bind(signal.action.as_str())
        .bind(signal.value_usd.to_string())
        .bind(signal.position_weight.map(|w| w.to_string()))
        .bind(signal.age_secs)
        .bind(signal.event_price.to_string())
        .bind(signal.current_price.map(|p| p.to_string()))
        .bind(signal.slippage_pct.map(|p| p.to_string()))
        .bind(signal.slippage_ok)
        .bind(signal.priority_score)
        .bind(signal.copy_size_usd.to_string())
        .bind(signal.leverage as i64)
        .bind(signal.order_style.map(|s| s.as_str()))
        .bind(signal.max_slippage_pct.map(|p| p.to_string()))
        .bind(signal.decision.as_str())
        .bind(&signal.reason)
        .bind(signal.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("Failed to insert signal")?;

        sqlx::query("INSERT OR IGNORE INTO seen_events (event_id, trader_address) VALUES (?, ?)")
            .bind(&signal.event_id)
            .bind(&signal.trader_address)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn recent_signals(&self, limit: i64) -> Result<Vec<Signal>> {
        let rows = sqlx::query_as::<_, StoredSignal>(
            "SELECT * FROM signals ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch signals")?;

        rows.into_iter().map(Signal::try_from).collect()
    }

    /// Decision tag counts over the whole audit trail.
    pub async fn decision_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT decision, COUNT(*) FROM signals GROUP BY decision ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ==================== Seen Events ====================

    /// Check if an event already has a persisted decision.
    pub async fn has_seen(&self, event_id: &str) -> Result<bool> {
        let result: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM seen_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    /// Most recently seen event ids, used to warm the in-memory dedup set.
    pub async fn recent_seen_events(&self, limit: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT event_id FROM seen_events ORDER BY seen_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // ==================== Blacklist ====================

    /// Blacklist `address` until `until`. An existing entry is only ever
    /// extended.
    pub async fn blacklist(&self, address: &str, until: DateTime<Utc>, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO blacklist (address, until, reason)
            VALUES (?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                until = MAX(blacklist.until, excluded.until),
                reason = excluded.reason
            "#,
        )
        .bind(address)
        .bind(until.to_rfc3339())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_blacklisted(&self, address: &str, now: DateTime<Utc>) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT until FROM blacklist WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((until,)) => Ok(parse_time(&until)? > now),
            None => Ok(false),
        }
    }

    /// Addresses whose blacklist cooldown is still running.
    pub async fn active_blacklist(&self, now: DateTime<Utc>) -> Result<Vec<(String, DateTime<Utc>)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT address, until FROM blacklist")
            .fetch_all(&self.pool)
            .await?;

        let mut active = Vec::new();
        for (address, until) in rows {
            let until = parse_time(&until)?;
            if until > now {
                active.push((address, until));
            }
        }
        Ok(active)
    }

    // ==================== Traders ====================

    /// Replace the tracked set: everything not in `traders` is untracked.
    pub async fn replace_tracked_traders(&self, traders: &[TrackedTrader]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE traders SET is_tracked = 0")
            .execute(&mut *tx)
            .await?;

        for trader in traders {
            sqlx::query(
                r#"
                INSERT INTO traders (address, label, account_value, score, is_tracked, updated_at)
                VALUES (?, ?, ?, ?, 1, ?)
                ON CONFLICT(address) DO UPDATE SET
                    label = COALESCE(NULLIF(excluded.label, ''), traders.label),
                    account_value = excluded.account_value,
                    score = excluded.score,
                    is_tracked = 1,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&trader.address)
            .bind(&trader.label)
            .bind(trader.account_value.to_string())
            .bind(trader.score)
            .bind(trader.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_tracked_traders(&self) -> Result<Vec<TrackedTrader>> {
        let rows = sqlx::query_as::<_, StoredTrader>(
            "SELECT address, label, account_value, score, updated_at FROM traders WHERE is_tracked = 1 ORDER BY score DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch traders")?;

        rows.into_iter().map(TrackedTrader::try_from).collect()
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
