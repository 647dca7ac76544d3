use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::models::{CopyAttempt, Decision, ExecutableFill, LedgerEntry, PortfolioScope};

use super::Store;

impl Store {
    /// Upsert on `(portfolio_scope, ref_id, entry_type)` — safe under retry.
    pub async fn upsert_ledger_entry(&self, entry: &LedgerEntry) -> anyhow::Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ledger_entries
                   (id, portfolio_scope, followed_user_id, market_id, asset_id, entry_type,
                    share_delta_micros, cash_delta_micros, price_micros, ref_id, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                 ON CONFLICT(portfolio_scope, ref_id, entry_type) DO UPDATE SET
                   share_delta_micros = excluded.share_delta_micros,
                   cash_delta_micros = excluded.cash_delta_micros,
                   price_micros = excluded.price_micros",
                rusqlite::params![
                    entry.id,
                    entry.portfolio_scope.as_str(),
                    entry.followed_user_id,
                    entry.market_id,
                    entry.asset_id,
                    entry.entry_type.as_str(),
                    entry.share_delta_micros,
                    entry.cash_delta_micros,
                    entry.price_micros,
                    entry.ref_id,
                    entry.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn copy_attempt_exists(&self, group_key: &str) -> anyhow::Result<bool> {
        let group_key = group_key.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM copy_attempts WHERE group_key = ?1",
                [&group_key],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    /// Persist a `CopyAttempt` plus its `ExecutableFill`s and, for an
    /// EXECUTE decision, its ledger entries — all in one transaction so
    /// partial state is never visible (SPEC_FULL.md §5 ordering guarantee).
    pub async fn persist_copy_attempt(
        &self,
        attempt: &CopyAttempt,
        fills: &[ExecutableFill],
        ledger_entries: &[LedgerEntry],
    ) -> anyhow::Result<()> {
        let attempt = attempt.clone();
        let fills = fills.to_vec();
        let ledger_entries = ledger_entries.to_vec();
        self.with_conn(move |conn| {
            let reason_codes_json =
                serde_json::to_string(&attempt.reason_codes).unwrap_or_else(|_| "[]".to_string());
            let mut tx = conn.unchecked_transaction()?;
            tx.set_drop_behavior(rusqlite::DropBehavior::Rollback);

            tx.execute(
                "INSERT INTO copy_attempts
                   (id, portfolio_scope, followed_user_id, group_key, decision, reason_codes_json,
                    source_type, target_notional_micros, filled_notional_micros, filled_ratio_bps,
                    vwap_price_micros, their_reference_price_micros, mid_price_micros_at_decision,
                    buffered_trade_count, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
                 ON CONFLICT(group_key) DO NOTHING",
                rusqlite::params![
                    attempt.id,
                    attempt.portfolio_scope.as_str(),
                    attempt.followed_user_id,
                    attempt.group_key,
                    match attempt.decision {
                        Decision::Execute => "EXECUTE",
                        Decision::Skip => "SKIP",
                    },
                    reason_codes_json,
                    attempt.source_type.as_str(),
                    attempt.target_notional_micros,
                    attempt.filled_notional_micros,
                    attempt.filled_ratio_bps,
                    attempt.vwap_price_micros,
                    attempt.their_reference_price_micros,
                    attempt.mid_price_micros_at_decision,
                    attempt.buffered_trade_count,
                    attempt.created_at.to_rfc3339(),
                ],
            )?;

            for fill in &fills {
                tx.execute(
                    "INSERT INTO executable_fills
                       (id, copy_attempt_id, seq, price_micros, filled_share_micros, fill_notional_micros)
                     VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![
                        fill.id,
                        fill.copy_attempt_id,
                        fill.seq,
                        fill.price_micros,
                        fill.filled_share_micros,
                        fill.fill_notional_micros,
                    ],
                )?;
            }

            for entry in &ledger_entries {
                tx.execute(
                    "INSERT INTO ledger_entries
                       (id, portfolio_scope, followed_user_id, market_id, asset_id, entry_type,
                        share_delta_micros, cash_delta_micros, price_micros, ref_id, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(portfolio_scope, ref_id, entry_type) DO UPDATE SET
                       share_delta_micros = excluded.share_delta_micros,
                       cash_delta_micros = excluded.cash_delta_micros,
                       price_micros = excluded.price_micros",
                    rusqlite::params![
                        entry.id,
                        entry.portfolio_scope.as_str(),
                        entry.followed_user_id,
                        entry.market_id,
                        entry.asset_id,
                        entry.entry_type.as_str(),
                        entry.share_delta_micros,
                        entry.cash_delta_micros,
                        entry.price_micros,
                        entry.ref_id,
                        entry.created_at.to_rfc3339(),
                    ],
                )?;
            }

            tx.set_drop_behavior(rusqlite::DropBehavior::Commit);
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Sum of `cash_delta_micros` for a scope over a trailing window, used
    /// by the circuit-breaker guardrail checks (best-effort, see DESIGN.md
    /// Open Question #3).
    pub async fn sum_cash_delta_since(
        &self,
        scope: PortfolioScope,
        since: chrono::DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let scope = scope.as_str().to_string();
        let since = since.to_rfc3339();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cash_delta_micros), 0) FROM ledger_entries
                 WHERE portfolio_scope = ?1 AND created_at >= ?2",
                rusqlite::params![scope, since],
                |row| row.get(0),
            )
        })
        .await
    }

    /// All-time sum of `cash_delta_micros` for a scope, optionally scoped to
    /// one followed user. Used by the portfolio snapshotter to compute cash.
    pub async fn total_cash_delta(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
    ) -> anyhow::Result<i64> {
        let scope = scope.as_str().to_string();
        let followed_user_id = followed_user_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cash_delta_micros), 0) FROM ledger_entries
                 WHERE portfolio_scope = ?1 AND followed_user_id IS ?2",
                rusqlite::params![scope, followed_user_id],
                |row| row.get(0),
            )
        })
        .await
    }

    /// Net share position per asset for a scope, with the most recent
    /// non-null fill price recorded against that asset (used as a mark price
    /// stand-in when no live book quote is available).
    pub async fn positions_by_asset(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
    ) -> anyhow::Result<Vec<(String, i64, Option<i64>)>> {
        let scope_s = scope.as_str().to_string();
        let followed_user_id = followed_user_id.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT asset_id, SUM(share_delta_micros) FROM ledger_entries
                 WHERE portfolio_scope = ?1 AND followed_user_id IS ?2 AND asset_id IS NOT NULL
                 GROUP BY asset_id",
            )?;
            let sums: Vec<(String, i64)> = stmt
                .query_map(rusqlite::params![scope_s, followed_user_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut out = Vec::with_capacity(sums.len());
            for (asset_id, share_sum) in sums {
                let last_price: Option<i64> = conn
                    .query_row(
                        "SELECT price_micros FROM ledger_entries
                         WHERE portfolio_scope = ?1 AND followed_user_id IS ?2 AND asset_id = ?3
                           AND price_micros IS NOT NULL
                         ORDER BY created_at DESC LIMIT 1",
                        rusqlite::params![scope_s, followed_user_id, asset_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                out.push((asset_id, share_sum, last_price));
            }
            Ok(out)
        })
        .await
    }
}

pub fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
