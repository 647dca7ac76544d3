//! Periodic equity/exposure/PnL rollup per portfolio scope (SPEC_FULL.md
//! §4.9, §3.1 `portfolio_snapshots`). Grounded on the teacher's
//! `vault/position_tracker.rs`'s periodic mark-to-market sweep, generalized
//! from one account to the scoped ledger this system keeps (shadow-user
//! leader mirrors plus the global executable book).

use chrono::Utc;

use crate::book::{BookCache, GetBookOptions};
use crate::db::Store;
use crate::models::PortfolioScope;

pub struct PortfolioSnapshotter {
    store: Store,
    book_cache: BookCache,
}

impl PortfolioSnapshotter {
    pub fn new(store: Store, book_cache: BookCache) -> Self {
        PortfolioSnapshotter { store, book_cache }
    }

    pub async fn run_forever(&self, interval_secs: u64) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            if let Err(err) = self.snapshot_all().await {
                tracing::warn!(error = %err, "portfolio snapshot sweep failed");
            }
        }
    }

    pub async fn snapshot_all(&self) -> anyhow::Result<()> {
        self.snapshot_scope(PortfolioScope::ExecGlobal, None).await?;
        for user in self.store.list_followed_users().await? {
            self.snapshot_scope(PortfolioScope::ShadowUser, Some(user.id.as_str())).await?;
        }
        Ok(())
    }

    /// Compute equity/exposure/PnL for one scope from its ledger sums and
    /// the cached best-available mark price for each open position, then
    /// persist one bucketed snapshot row.
    async fn snapshot_scope(
        &self,
        scope: PortfolioScope,
        followed_user_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let cash = self.store.total_cash_delta(scope, followed_user_id).await?;
        let positions = self.store.positions_by_asset(scope, followed_user_id).await?;

        let mut exposure = 0i64;
        let mut unrealized_pnl = 0i64;
        for (asset_id, share_sum, last_fill_price) in &positions {
            if *share_sum == 0 {
                continue;
            }
            let mark_price = self.mark_price(asset_id, *last_fill_price).await;
            let mark_value = crate::micros::mul_div(*share_sum, mark_price, crate::micros::ONE);
            exposure += mark_value.abs();
            if let Some(cost_price) = last_fill_price {
                let cost_value = crate::micros::mul_div(*share_sum, *cost_price, crate::micros::ONE);
                unrealized_pnl += mark_value - cost_value;
            }
        }

        let equity = cash + exposure;

        self.store
            .insert_portfolio_snapshot(
                scope.as_str(),
                followed_user_id,
                Utc::now(),
                equity,
                cash,
                exposure,
                0,
                unrealized_pnl,
            )
            .await
    }

    async fn mark_price(&self, token_id: &str, fallback: Option<i64>) -> i64 {
        let result = self
            .book_cache
            .get_book(
                token_id,
                GetBookOptions {
                    wait_ms: 0,
                    freshness_ms: 10_000,
                    no_wait: true,
                },
            )
            .await;
        result
            .book
            .and_then(|b| b.mid_price())
            .or(fallback)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LedgerEntry, LedgerEntryType};
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    async fn fresh_store() -> Store {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        store.migrate().await.unwrap();
        std::mem::forget(file);
        store
    }

    #[tokio::test]
    async fn snapshot_with_no_positions_is_all_cash() {
        let store = fresh_store().await;
        store
            .upsert_ledger_entry(&LedgerEntry {
                id: Uuid::new_v4().to_string(),
                portfolio_scope: PortfolioScope::ExecGlobal,
                followed_user_id: None,
                market_id: None,
                asset_id: None,
                entry_type: LedgerEntryType::TradeFill,
                share_delta_micros: 0,
                cash_delta_micros: 5_000_000,
                price_micros: None,
                ref_id: "seed".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let book_cache = BookCache::new("ws://unused".to_string(), "http://unused".to_string(), false);
        let snapshotter = PortfolioSnapshotter::new(store.clone(), book_cache);
        snapshotter.snapshot_scope(PortfolioScope::ExecGlobal, None).await.unwrap();

        let snap = store.latest_portfolio_snapshot("EXEC_GLOBAL", None).await.unwrap().unwrap();
        assert_eq!(snap.0, 5_000_000);
        assert_eq!(snap.2, 0);
    }
}
