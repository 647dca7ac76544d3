//! SQLite-backed persistence. Grounded on the teacher's
//! `vault/vault_db.rs::VaultDb`: a single `rusqlite::Connection` behind a
//! `tokio::sync::Mutex`, WAL mode, `CREATE TABLE IF NOT EXISTS` schema setup,
//! and `INSERT ... ON CONFLICT DO UPDATE` / `INSERT OR IGNORE` upserts for
//! idempotent writes.

mod ledger;
mod queue;
mod small_trade;
mod trades;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::models::FollowedUser;

pub use ledger::*;
pub use queue::*;
pub use small_trade::*;
pub use trades::*;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(database_url)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) async fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T> + Send,
    ) -> anyhow::Result<T>
    where
        T: Send + 'static,
    {
        let conn = self.conn.lock().await;
        Ok(f(&conn)?)
    }

    pub async fn list_followed_users(&self) -> anyhow::Result<Vec<FollowedUser>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, profile_wallet, label, enabled FROM followed_users",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(FollowedUser {
                    id: row.get(0)?,
                    profile_wallet: row.get(1)?,
                    label: row.get(2)?,
                    enabled: row.get::<_, i64>(3)? != 0,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn list_proxy_wallets(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT wallet, followed_user_id FROM followed_user_proxy_wallets",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    pub async fn get_checkpoint(&self, key: &str) -> anyhow::Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value_json FROM system_checkpoints WHERE key = ?1",
                [&key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .await
    }

    pub async fn set_checkpoint(&self, key: &str, value_json: &str) -> anyhow::Result<()> {
        let key = key.to_string();
        let value_json = value_json.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO system_checkpoints (key, value_json, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                rusqlite::params![key, value_json, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_guardrail_config(
        &self,
        scope: &str,
        followed_user_id: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let scope = scope.to_string();
        let followed_user_id = followed_user_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT config_json FROM guardrail_configs WHERE scope = ?1 AND followed_user_id IS ?2
                 ORDER BY updated_at DESC LIMIT 1",
                rusqlite::params![scope, followed_user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .await
    }

    pub async fn get_copy_sizing_config(
        &self,
        scope: &str,
        followed_user_id: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let scope = scope.to_string();
        let followed_user_id = followed_user_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT config_json FROM copy_sizing_configs WHERE scope = ?1 AND followed_user_id IS ?2
                 ORDER BY updated_at DESC LIMIT 1",
                rusqlite::params![scope, followed_user_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .await
    }

    pub async fn latest_portfolio_snapshot(
        &self,
        scope: &str,
        followed_user_id: Option<&str>,
    ) -> anyhow::Result<Option<(i64, i64, i64)>> {
        let scope = scope.to_string();
        let followed_user_id = followed_user_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT equity_micros, cash_micros, exposure_micros FROM portfolio_snapshots
                 WHERE portfolio_scope = ?1 AND followed_user_id IS ?2
                 ORDER BY bucket_time DESC LIMIT 1",
                rusqlite::params![scope, followed_user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
        .await
    }

    pub async fn insert_portfolio_snapshot(
        &self,
        scope: &str,
        followed_user_id: Option<&str>,
        bucket_time: DateTime<Utc>,
        equity_micros: i64,
        cash_micros: i64,
        exposure_micros: i64,
        realized_pnl_micros: i64,
        unrealized_pnl_micros: i64,
    ) -> anyhow::Result<()> {
        let scope = scope.to_string();
        let followed_user_id = followed_user_id.map(|s| s.to_string());
        let bucket_time = bucket_time.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO portfolio_snapshots
                   (portfolio_scope, followed_user_id, bucket_time, equity_micros, cash_micros,
                    exposure_micros, realized_pnl_micros, unrealized_pnl_micros)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(portfolio_scope, followed_user_id, bucket_time) DO UPDATE SET
                   equity_micros = excluded.equity_micros,
                   cash_micros = excluded.cash_micros,
                   exposure_micros = excluded.exposure_micros,
                   realized_pnl_micros = excluded.realized_pnl_micros,
                   unrealized_pnl_micros = excluded.unrealized_pnl_micros",
                rusqlite::params![
                    scope,
                    followed_user_id,
                    bucket_time,
                    equity_micros,
                    cash_micros,
                    exposure_micros,
                    realized_pnl_micros,
                    unrealized_pnl_micros
                ],
            )?;
            Ok(())
        })
        .await
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS followed_users (
    id TEXT PRIMARY KEY,
    profile_wallet TEXT UNIQUE NOT NULL,
    label TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS followed_user_proxy_wallets (
    wallet TEXT PRIMARY KEY,
    followed_user_id TEXT NOT NULL REFERENCES followed_users(id)
);

CREATE TABLE IF NOT EXISTS trade_events (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    source_id TEXT,
    tx_hash TEXT NOT NULL,
    log_index INTEGER,
    is_canonical INTEGER NOT NULL DEFAULT 1,
    profile_wallet TEXT NOT NULL,
    proxy_wallet TEXT,
    side TEXT NOT NULL,
    price_micros INTEGER NOT NULL,
    share_micros INTEGER NOT NULL,
    notional_micros INTEGER NOT NULL,
    fee_micros INTEGER NOT NULL DEFAULT 0,
    event_time TEXT NOT NULL,
    detect_time TEXT NOT NULL,
    market_id TEXT,
    asset_id TEXT,
    raw_token_id TEXT,
    condition_id TEXT,
    enrichment_status TEXT NOT NULL DEFAULT 'PENDING'
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trade_events_tx_log ON trade_events(tx_hash, log_index);
CREATE UNIQUE INDEX IF NOT EXISTS idx_trade_events_source_id
    ON trade_events(source, source_id) WHERE source_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS activity_events (
    id TEXT PRIMARY KEY,
    source_id TEXT UNIQUE NOT NULL,
    activity_type TEXT NOT NULL,
    profile_wallet TEXT NOT NULL,
    items_json TEXT NOT NULL,
    collateral_amount_micros INTEGER,
    event_time TEXT NOT NULL,
    detect_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id TEXT PRIMARY KEY,
    portfolio_scope TEXT NOT NULL,
    followed_user_id TEXT,
    market_id TEXT,
    asset_id TEXT,
    entry_type TEXT NOT NULL,
    share_delta_micros INTEGER NOT NULL,
    cash_delta_micros INTEGER NOT NULL,
    price_micros INTEGER,
    ref_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(portfolio_scope, ref_id, entry_type)
);

CREATE TABLE IF NOT EXISTS copy_attempts (
    id TEXT PRIMARY KEY,
    portfolio_scope TEXT NOT NULL,
    followed_user_id TEXT,
    group_key TEXT UNIQUE NOT NULL,
    decision TEXT NOT NULL,
    reason_codes_json TEXT NOT NULL,
    source_type TEXT NOT NULL,
    target_notional_micros INTEGER NOT NULL,
    filled_notional_micros INTEGER NOT NULL,
    filled_ratio_bps INTEGER NOT NULL,
    vwap_price_micros INTEGER NOT NULL,
    their_reference_price_micros INTEGER NOT NULL,
    mid_price_micros_at_decision INTEGER,
    buffered_trade_count INTEGER,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executable_fills (
    id TEXT PRIMARY KEY,
    copy_attempt_id TEXT NOT NULL REFERENCES copy_attempts(id),
    seq INTEGER NOT NULL,
    price_micros INTEGER NOT NULL,
    filled_share_micros INTEGER NOT NULL,
    fill_notional_micros INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    portfolio_scope TEXT NOT NULL,
    followed_user_id TEXT,
    bucket_time TEXT NOT NULL,
    equity_micros INTEGER NOT NULL,
    cash_micros INTEGER NOT NULL,
    exposure_micros INTEGER NOT NULL,
    realized_pnl_micros INTEGER NOT NULL,
    unrealized_pnl_micros INTEGER NOT NULL,
    UNIQUE(portfolio_scope, followed_user_id, bucket_time)
);

CREATE TABLE IF NOT EXISTS system_checkpoints (
    key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS small_trade_buckets (
    bucket_key TEXT PRIMARY KEY,
    followed_user_id TEXT NOT NULL,
    token_id TEXT NOT NULL,
    side TEXT,
    net_notional_micros INTEGER NOT NULL,
    net_share_micros INTEGER NOT NULL,
    first_seen_at_ms INTEGER NOT NULL,
    last_updated_at_ms INTEGER NOT NULL,
    count_trades_buffered INTEGER NOT NULL,
    reference_price_micros INTEGER NOT NULL,
    trade_event_ids_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS guardrail_configs (
    scope TEXT NOT NULL,
    followed_user_id TEXT,
    config_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS copy_sizing_configs (
    scope TEXT NOT NULL,
    followed_user_id TEXT,
    config_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS queue_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    job_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    available_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(queue, job_id)
);
CREATE INDEX IF NOT EXISTS idx_queue_jobs_claim ON queue_jobs(queue, status, available_at);
"#;
