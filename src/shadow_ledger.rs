//! Double-entry shadow ledger under `PortfolioScope::ShadowUser`
//! (SPEC_FULL.md §4.6 shadow accounting, §3.1 `ledger_entries`). Every
//! canonical trade and every MERGE/SPLIT/REDEEM activity produces one entry
//! here regardless of whether the executor copies it. Grounded on the
//! teacher's `vault/position_tracker.rs`-style share/cash delta bookkeeping,
//! adapted from a single-account ledger to the scoped multi-leader ledger
//! this system needs.

use chrono::Utc;
use uuid::Uuid;

use crate::db::Store;
use crate::models::{ActivityEvent, ActivityType, LedgerEntry, LedgerEntryType, PortfolioScope, Side, TradeEvent};

pub struct ShadowLedger {
    store: Store,
}

impl ShadowLedger {
    pub fn new(store: Store) -> Self {
        ShadowLedger { store }
    }

    /// Record a leader's trade as a shadow fill: their side's share/cash
    /// deltas, scaled 1:1, with no sizing or guardrails applied.
    pub async fn record_trade(&self, trade: &TradeEvent) -> anyhow::Result<()> {
        let (share_delta, cash_delta) = match trade.side {
            Side::Buy => (trade.share_micros, -trade.notional_micros),
            Side::Sell => (-trade.share_micros, trade.notional_micros),
        };
        let entry = LedgerEntry {
            id: Uuid::new_v4().to_string(),
            portfolio_scope: PortfolioScope::ShadowUser,
            followed_user_id: Some(trade.profile_wallet.clone()),
            market_id: trade.market_id.clone(),
            asset_id: trade.effective_token_id().map(str::to_string),
            entry_type: LedgerEntryType::TradeFill,
            share_delta_micros: share_delta,
            cash_delta_micros: cash_delta,
            price_micros: Some(trade.price_micros),
            ref_id: format!("trade:{}", trade.id),
            created_at: Utc::now(),
        };
        self.store.upsert_ledger_entry(&entry).await
    }

    /// Record a MERGE/SPLIT/REDEEM activity. MERGE and REDEEM consume share
    /// positions and return collateral; SPLIT consumes collateral and opens
    /// share positions. One ledger row per asset leg, scoped to the same
    /// `ref_id` so a replayed activity event is idempotent per leg.
    pub async fn record_activity(&self, activity: &ActivityEvent) -> anyhow::Result<()> {
        let entry_type = match activity.activity_type {
            ActivityType::Merge => LedgerEntryType::Merge,
            ActivityType::Split => LedgerEntryType::Split,
            ActivityType::Redeem => LedgerEntryType::Settlement,
        };

        for item in &activity.items {
            let share_delta = match activity.activity_type {
                ActivityType::Split => item.amount_micros,
                ActivityType::Merge | ActivityType::Redeem => -item.amount_micros,
            };
            let entry = LedgerEntry {
                id: Uuid::new_v4().to_string(),
                portfolio_scope: PortfolioScope::ShadowUser,
                followed_user_id: Some(activity.profile_wallet.clone()),
                market_id: None,
                asset_id: Some(item.asset_id.clone()),
                entry_type,
                share_delta_micros: share_delta,
                cash_delta_micros: 0,
                price_micros: None,
                ref_id: format!("activity:{}:{}", activity.source_id, item.asset_id),
                created_at: Utc::now(),
            };
            self.store.upsert_ledger_entry(&entry).await?;
        }

        if let Some(collateral) = activity.collateral_amount_micros {
            let cash_delta = match activity.activity_type {
                ActivityType::Split => -collateral,
                ActivityType::Merge | ActivityType::Redeem => collateral,
            };
            let entry = LedgerEntry {
                id: Uuid::new_v4().to_string(),
                portfolio_scope: PortfolioScope::ShadowUser,
                followed_user_id: Some(activity.profile_wallet.clone()),
                market_id: None,
                asset_id: None,
                entry_type,
                share_delta_micros: 0,
                cash_delta_micros: cash_delta,
                price_micros: None,
                ref_id: format!("activity:{}:collateral", activity.source_id),
                created_at: Utc::now(),
            };
            self.store.upsert_ledger_entry(&entry).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnrichmentStatus, TradeSource};
    use tempfile::NamedTempFile;

    async fn fresh_store() -> Store {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        store.migrate().await.unwrap();
        std::mem::forget(file);
        store
    }

    fn buy_trade() -> TradeEvent {
        let now = Utc::now();
        TradeEvent {
            id: "t1".to_string(),
            source: TradeSource::OnchainWs,
            source_id: None,
            tx_hash: "0xabc".to_string(),
            log_index: Some(0),
            is_canonical: true,
            profile_wallet: "0xleader".to_string(),
            proxy_wallet: None,
            side: Side::Buy,
            price_micros: 500_000,
            share_micros: 2_000_000,
            notional_micros: 1_000_000,
            fee_micros: 0,
            event_time: now,
            detect_time: now,
            market_id: Some("m1".to_string()),
            asset_id: Some("tok1".to_string()),
            raw_token_id: Some("tok1".to_string()),
            condition_id: None,
            enrichment_status: EnrichmentStatus::Pending,
        }
    }

    #[tokio::test]
    async fn records_buy_as_negative_cash_positive_shares() {
        let store = fresh_store().await;
        let ledger = ShadowLedger::new(store.clone());
        ledger.record_trade(&buy_trade()).await.unwrap();

        let delta = store
            .sum_cash_delta_since(PortfolioScope::ShadowUser, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(delta, -1_000_000);
    }

    #[tokio::test]
    async fn re_recording_the_same_trade_is_idempotent() {
        let store = fresh_store().await;
        let ledger = ShadowLedger::new(store.clone());
        ledger.record_trade(&buy_trade()).await.unwrap();
        ledger.record_trade(&buy_trade()).await.unwrap();

        let delta = store
            .sum_cash_delta_since(PortfolioScope::ShadowUser, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(delta, -1_000_000);
    }
}
