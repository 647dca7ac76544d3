//! Durable netting buffer for copy notionals below the sizing threshold
//! (SPEC_FULL.md §4.5). Grounded on `db/mod.rs`'s upsert idiom for the
//! durable bucket rows and on `other_examples/.../copy_trading.rs`'s
//! explicit skip-with-reason emission pattern for the below-min-exec flush
//! case.

use chrono::Utc;
use uuid::Uuid;

use crate::db::{SmallTradeBucketRow, Store};
use crate::models::{
    Decision, NettingMode, ReasonCode, Side, SmallTradeBufferingConfig, SourceType, TradeEvent,
    TradeEventGroup,
};

pub enum FlushReason {
    Threshold,
    MaxTime,
    Quiet,
    Shutdown,
}

pub struct SmallTradeBuffer {
    store: Store,
}

fn bucket_key(leader_id: &str, token_id: &str, side: Side, mode: NettingMode) -> String {
    match mode {
        NettingMode::SameSideOnly => format!("{leader_id}:{token_id}:{}", side.as_str()),
        NettingMode::NetBuySell => format!("{leader_id}:{token_id}"),
    }
}

fn signed_notional(side: Side, notional: i64) -> i64 {
    match side {
        Side::Buy => notional,
        Side::Sell => -notional,
    }
}

impl SmallTradeBuffer {
    pub fn new(store: Store) -> Self {
        SmallTradeBuffer { store }
    }

    /// Append a trade to its bucket. In `netBuySell` mode the opposite side
    /// nets against the existing balance; in `sameSideOnly` mode the
    /// arrival of the opposite side flushes the existing opposite bucket
    /// first (handled by the caller checking `opposite_bucket_key`).
    pub async fn append(
        &self,
        trade: &TradeEvent,
        token_id: &str,
        cfg: &SmallTradeBufferingConfig,
    ) -> anyhow::Result<()> {
        let key = bucket_key(&trade.profile_wallet, token_id, trade.side, cfg.netting_mode);
        let now_ms = Utc::now().timestamp_millis();

        let mut row = self
            .store
            .get_small_trade_bucket(&key)
            .await?
            .unwrap_or(SmallTradeBucketRow {
                bucket_key: key.clone(),
                followed_user_id: trade.profile_wallet.clone(),
                token_id: token_id.to_string(),
                side: match cfg.netting_mode {
                    NettingMode::SameSideOnly => Some(trade.side.as_str().to_string()),
                    NettingMode::NetBuySell => None,
                },
                net_notional_micros: 0,
                net_share_micros: 0,
                first_seen_at_ms: now_ms,
                last_updated_at_ms: now_ms,
                count_trades_buffered: 0,
                reference_price_micros: 0,
                trade_event_ids: Vec::new(),
            });

        let delta_notional = signed_notional(trade.side, trade.notional_micros);
        let delta_shares = signed_notional(trade.side, trade.share_micros);

        // VWAP-weighted reference price across all appended trades, by
        // absolute notional.
        let prior_abs = row.net_notional_micros.unsigned_abs() as i64;
        let new_abs = trade.notional_micros;
        let total_abs = prior_abs + new_abs;
        row.reference_price_micros = if total_abs == 0 {
            trade.price_micros
        } else {
            ((row.reference_price_micros * prior_abs) + (trade.price_micros * new_abs)) / total_abs
        };

        row.net_notional_micros += delta_notional;
        row.net_share_micros += delta_shares;
        row.last_updated_at_ms = now_ms;
        row.count_trades_buffered += 1;
        row.trade_event_ids.push(trade.id.clone());

        self.store.put_small_trade_bucket(&row).await
    }

    pub async fn opposite_bucket_key(
        &self,
        leader_id: &str,
        token_id: &str,
        side: Side,
        cfg: &SmallTradeBufferingConfig,
    ) -> Option<String> {
        if cfg.netting_mode != NettingMode::SameSideOnly {
            return None;
        }
        Some(bucket_key(leader_id, token_id, side.opposite(), cfg.netting_mode))
    }

    /// Flush the bucket at `key` if one exists. Used by the caller to flush
    /// an opposite-side bucket ahead of an `append` in `sameSideOnly` mode.
    pub async fn flush_if_present(
        &self,
        key: &str,
        cfg: &SmallTradeBufferingConfig,
    ) -> anyhow::Result<Option<FlushOutcome>> {
        match self.store.get_small_trade_bucket(key).await? {
            Some(row) => Ok(Some(self.flush_bucket(row, cfg).await?)),
            None => Ok(None),
        }
    }

    /// SPEC_FULL §4.5 "Immediate path": a trade whose sizing pre-estimate is
    /// at or above the buffering threshold. If a bucket already exists for
    /// its position, merge the trade in and flush once, subsuming whatever
    /// was pending; otherwise emit the trade directly as a single-member
    /// `IMMEDIATE` group without ever touching durable bucket storage.
    pub async fn immediate(
        &self,
        trade: &TradeEvent,
        token_id: &str,
        cfg: &SmallTradeBufferingConfig,
    ) -> anyhow::Result<FlushOutcome> {
        let key = bucket_key(&trade.profile_wallet, token_id, trade.side, cfg.netting_mode);
        if self.store.get_small_trade_bucket(&key).await?.is_some() {
            self.append(trade, token_id, cfg).await?;
            let row = self
                .store
                .get_small_trade_bucket(&key)
                .await?
                .ok_or_else(|| anyhow::anyhow!("bucket disappeared immediately after append"))?;
            return self.flush_bucket(row, cfg).await;
        }

        Ok(FlushOutcome::Group(TradeEventGroup {
            group_key: format!("immediate:{}", trade.id),
            followed_user_id: trade.profile_wallet.clone(),
            token_id: token_id.to_string(),
            side: trade.side,
            total_notional_micros: trade.notional_micros,
            total_share_micros: trade.share_micros,
            vwap_price_micros: trade.price_micros,
            earliest_detect_time: trade.detect_time,
            trade_event_ids: vec![trade.id.clone()],
            source_type: SourceType::Immediate,
        }))
    }

    /// Evaluate flush rules against one bucket (priority order: threshold,
    /// maxTime, quiet). Returns the flush reason if the bucket should flush
    /// now.
    fn should_flush(row: &SmallTradeBucketRow, cfg: &SmallTradeBufferingConfig, now_ms: i64) -> Option<FlushReason> {
        let abs_net = row.net_notional_micros.abs();
        if abs_net >= cfg.flush_min_notional_micros {
            return Some(FlushReason::Threshold);
        }
        if now_ms - row.first_seen_at_ms >= cfg.max_buffer_ms {
            return Some(FlushReason::MaxTime);
        }
        if now_ms - row.last_updated_at_ms >= cfg.quiet_flush_ms && abs_net >= cfg.min_exec_notional_micros {
            return Some(FlushReason::Quiet);
        }
        None
    }

    /// Global flush loop: scan all buckets on every tick and flush whichever
    /// qualify. On shutdown, call `flush_all_for_shutdown` instead.
    pub async fn scan_and_flush(
        &self,
        cfg: &SmallTradeBufferingConfig,
    ) -> anyhow::Result<Vec<FlushOutcome>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut outcomes = Vec::new();
        for row in self.store.list_small_trade_buckets().await? {
            if let Some(_reason) = Self::should_flush(&row, cfg, now_ms) {
                outcomes.push(self.flush_bucket(row, cfg).await?);
            }
        }
        Ok(outcomes)
    }

    pub async fn flush_all_for_shutdown(&self, cfg: &SmallTradeBufferingConfig) -> anyhow::Result<Vec<FlushOutcome>> {
        let mut outcomes = Vec::new();
        for row in self.store.list_small_trade_buckets().await? {
            outcomes.push(self.flush_bucket(row, cfg).await?);
        }
        Ok(outcomes)
    }

    async fn flush_bucket(
        &self,
        row: SmallTradeBucketRow,
        cfg: &SmallTradeBufferingConfig,
    ) -> anyhow::Result<FlushOutcome> {
        self.store.delete_small_trade_bucket(&row.bucket_key).await?;

        let abs_net = row.net_notional_micros.abs();
        let side = if row.net_notional_micros >= 0 { Side::Buy } else { Side::Sell };

        if abs_net < cfg.min_exec_notional_micros {
            return Ok(FlushOutcome::BelowMinExec {
                followed_user_id: row.followed_user_id,
                buffered_trade_count: row.count_trades_buffered,
                group_key: format!("buffer:{}", Uuid::new_v4()),
            });
        }

        let group = TradeEventGroup {
            group_key: format!("buffer:{}:{}:{}", row.followed_user_id, row.token_id, Utc::now().timestamp_millis()),
            followed_user_id: row.followed_user_id,
            token_id: row.token_id,
            side,
            total_notional_micros: abs_net,
            total_share_micros: row.net_share_micros.abs(),
            vwap_price_micros: row.reference_price_micros,
            earliest_detect_time: Utc::now(),
            trade_event_ids: row.trade_event_ids,
            source_type: SourceType::Buffer,
        };
        Ok(FlushOutcome::Group(group))
    }
}

pub enum FlushOutcome {
    Group(TradeEventGroup),
    BelowMinExec {
        followed_user_id: String,
        buffered_trade_count: i64,
        group_key: String,
    },
}

impl FlushOutcome {
    /// The `SKIP` decision and reason code attached to a below-min-exec
    /// flush, per SPEC_FULL §4.5.
    pub fn below_min_exec_decision() -> (Decision, Vec<ReasonCode>) {
        (Decision::Skip, vec![ReasonCode::BufferFlushBelowMinExec])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_key_respects_netting_mode() {
        let same = bucket_key("u1", "tok", Side::Buy, NettingMode::SameSideOnly);
        let net = bucket_key("u1", "tok", Side::Buy, NettingMode::NetBuySell);
        assert_eq!(same, "u1:tok:BUY");
        assert_eq!(net, "u1:tok");
    }

    #[test]
    fn should_flush_threshold_takes_priority() {
        let cfg = SmallTradeBufferingConfig {
            flush_min_notional_micros: 500_000,
            max_buffer_ms: 2_500,
            quiet_flush_ms: 600,
            min_exec_notional_micros: 100_000,
            ..Default::default()
        };
        let row = SmallTradeBucketRow {
            bucket_key: "k".to_string(),
            followed_user_id: "u1".to_string(),
            token_id: "t".to_string(),
            side: Some("BUY".to_string()),
            net_notional_micros: 600_000,
            net_share_micros: 1_200_000,
            first_seen_at_ms: 0,
            last_updated_at_ms: 0,
            count_trades_buffered: 3,
            reference_price_micros: 500_000,
            trade_event_ids: vec!["a".into(), "b".into(), "c".into()],
        };
        assert!(matches!(
            SmallTradeBuffer::should_flush(&row, &cfg, 100),
            Some(FlushReason::Threshold)
        ));
    }

    #[test]
    fn should_flush_max_time_when_below_threshold() {
        let cfg = SmallTradeBufferingConfig {
            flush_min_notional_micros: 500_000,
            max_buffer_ms: 2_500,
            quiet_flush_ms: 600,
            min_exec_notional_micros: 100_000,
            ..Default::default()
        };
        let row = SmallTradeBucketRow {
            bucket_key: "k".to_string(),
            followed_user_id: "u1".to_string(),
            token_id: "t".to_string(),
            side: Some("BUY".to_string()),
            net_notional_micros: 90_000,
            net_share_micros: 180_000,
            first_seen_at_ms: 0,
            last_updated_at_ms: 0,
            count_trades_buffered: 2,
            reference_price_micros: 500_000,
            trade_event_ids: vec!["a".into(), "b".into()],
        };
        assert!(matches!(
            SmallTradeBuffer::should_flush(&row, &cfg, 2_500),
            Some(FlushReason::MaxTime)
        ));
    }

    use crate::models::{EnrichmentStatus, TradeSource};
    use tempfile::NamedTempFile;

    async fn fresh_store() -> Store {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        store.migrate().await.unwrap();
        std::mem::forget(file);
        store
    }

    fn trade(id: &str, side: Side, notional: i64) -> TradeEvent {
        let now = Utc::now();
        TradeEvent {
            id: id.to_string(),
            source: TradeSource::OnchainWs,
            source_id: None,
            tx_hash: "0xabc".to_string(),
            log_index: Some(1),
            is_canonical: true,
            profile_wallet: "leader1".to_string(),
            proxy_wallet: None,
            side,
            price_micros: 500_000,
            share_micros: notional * 2,
            notional_micros: notional,
            fee_micros: 0,
            event_time: now,
            detect_time: now,
            market_id: None,
            asset_id: Some("tok".to_string()),
            raw_token_id: Some("tok".to_string()),
            condition_id: None,
            enrichment_status: EnrichmentStatus::Pending,
        }
    }

    #[tokio::test]
    async fn immediate_path_emits_single_member_group_without_a_bucket() {
        let store = fresh_store().await;
        let buffer = SmallTradeBuffer::new(store);
        let cfg = SmallTradeBufferingConfig::default();

        let outcome = buffer.immediate(&trade("t1", Side::Buy, 300_000), "tok", &cfg).await.unwrap();
        match outcome {
            FlushOutcome::Group(group) => {
                assert_eq!(group.source_type, SourceType::Immediate);
                assert_eq!(group.trade_event_ids, vec!["t1".to_string()]);
                assert_eq!(group.total_notional_micros, 300_000);
            }
            FlushOutcome::BelowMinExec { .. } => panic!("expected a group outcome"),
        }
    }

    #[tokio::test]
    async fn immediate_path_merges_into_and_flushes_an_existing_bucket() {
        let store = fresh_store().await;
        let buffer = SmallTradeBuffer::new(store);
        let cfg = SmallTradeBufferingConfig::default();

        buffer.append(&trade("t1", Side::Buy, 90_000), "tok", &cfg).await.unwrap();
        let outcome = buffer.immediate(&trade("t2", Side::Buy, 300_000), "tok", &cfg).await.unwrap();
        match outcome {
            FlushOutcome::Group(group) => {
                assert_eq!(group.source_type, SourceType::Buffer);
                assert_eq!(group.total_notional_micros, 390_000);
                assert_eq!(group.trade_event_ids, vec!["t1".to_string(), "t2".to_string()]);
            }
            FlushOutcome::BelowMinExec { .. } => panic!("expected a group outcome"),
        }
    }

    #[tokio::test]
    async fn flush_if_present_flushes_the_opposite_side_bucket() {
        let store = fresh_store().await;
        let buffer = SmallTradeBuffer::new(store);
        let cfg = SmallTradeBufferingConfig::default();

        buffer.append(&trade("t1", Side::Buy, 90_000), "tok", &cfg).await.unwrap();
        let key = buffer.opposite_bucket_key("leader1", "tok", Side::Sell, &cfg).await.unwrap();
        assert_eq!(key, "leader1:tok:BUY");

        let outcome = buffer.flush_if_present(&key, &cfg).await.unwrap();
        assert!(outcome.is_some());
        assert!(buffer.flush_if_present(&key, &cfg).await.unwrap().is_none());
    }
}
