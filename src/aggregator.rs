//! Time-window aggregator (SPEC_FULL.md §4.4). Buckets canonical trades by
//! `(followedUserId, tokenId, side)` and flushes each bucket 250ms after its
//! first arrival. No direct teacher analogue exists for order aggregation;
//! grounded on the general "bucket by key with a deadline" shape used by
//! `middleware/rate_limit.rs`'s window/cleanup logic, adapted here to a
//! per-bucket one-shot timer instead of a shared sweep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::micros::vwap;
use crate::models::{Side, SourceType, TradeEvent, TradeEventGroup};

#[derive(Debug, Clone)]
struct Bucket {
    followed_user_id: String,
    token_id: String,
    side: Side,
    window_start: DateTime<Utc>,
    total_notional_micros: i64,
    total_share_micros: i64,
    earliest_detect_time: DateTime<Utc>,
    trade_event_ids: Vec<String>,
}

impl Bucket {
    fn into_group(self) -> TradeEventGroup {
        let vwap_price = vwap(self.total_notional_micros, self.total_share_micros);
        TradeEventGroup {
            group_key: format!(
                "{}:{}:{}:{}",
                self.followed_user_id,
                self.token_id,
                self.side.as_str(),
                self.window_start.to_rfc3339()
            ),
            followed_user_id: self.followed_user_id,
            token_id: self.token_id,
            side: self.side,
            total_notional_micros: self.total_notional_micros,
            total_share_micros: self.total_share_micros,
            vwap_price_micros: vwap_price,
            earliest_detect_time: self.earliest_detect_time,
            trade_event_ids: self.trade_event_ids,
            source_type: SourceType::Group,
        }
    }
}

type BucketKey = (String, String, &'static str);

pub struct Aggregator {
    window: chrono::Duration,
    buckets: Arc<Mutex<HashMap<BucketKey, Bucket>>>,
    flush_tx: mpsc::Sender<TradeEventGroup>,
}

impl Aggregator {
    pub fn new(window_ms: i64, flush_tx: mpsc::Sender<TradeEventGroup>) -> Self {
        Aggregator {
            window: chrono::Duration::milliseconds(window_ms),
            buckets: Arc::new(Mutex::new(HashMap::new())),
            flush_tx,
        }
    }

    /// Add a trade to the window it belongs to. If this is the bucket's
    /// first arrival, a one-shot timer is spawned to flush it at the
    /// deadline; the bucket is removed from the map on flush so late
    /// arrivals with the same key start a fresh window.
    pub fn add_trade(&self, trade: &TradeEvent) {
        let Some(token_id) = trade.effective_token_id().map(str::to_string) else {
            return;
        };
        let key: BucketKey = (trade.profile_wallet.clone(), token_id.clone(), trade.side.as_str());

        let mut buckets = self.buckets.lock();
        let is_new = !buckets.contains_key(&key);
        let bucket = buckets.entry(key.clone()).or_insert_with(|| Bucket {
            followed_user_id: trade.profile_wallet.clone(),
            token_id: token_id.clone(),
            side: trade.side,
            window_start: trade.detect_time,
            total_notional_micros: 0,
            total_share_micros: 0,
            earliest_detect_time: trade.detect_time,
            trade_event_ids: Vec::new(),
        });
        bucket.total_notional_micros += trade.notional_micros;
        bucket.total_share_micros += trade.share_micros;
        bucket.earliest_detect_time = bucket.earliest_detect_time.min(trade.detect_time);
        bucket.trade_event_ids.push(trade.id.clone());
        drop(buckets);

        if is_new {
            let deadline = self.window;
            let buckets = self.buckets.clone();
            let flush_tx = self.flush_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline.to_std().unwrap_or_default()).await;
                let flushed = buckets.lock().remove(&key);
                if let Some(bucket) = flushed {
                    let _ = flush_tx.send(bucket.into_group()).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnrichmentStatus, TradeSource};

    fn trade(id: &str, notional: i64, shares: i64) -> TradeEvent {
        let now = Utc::now();
        TradeEvent {
            id: id.to_string(),
            source: TradeSource::OnchainWs,
            source_id: None,
            tx_hash: "0xabc".to_string(),
            log_index: Some(1),
            is_canonical: true,
            profile_wallet: "user1".to_string(),
            proxy_wallet: None,
            side: Side::Buy,
            price_micros: 500_000,
            share_micros: shares,
            notional_micros: notional,
            fee_micros: 0,
            event_time: now,
            detect_time: now,
            market_id: None,
            asset_id: Some("token1".to_string()),
            raw_token_id: Some("token1".to_string()),
            condition_id: None,
            enrichment_status: EnrichmentStatus::Pending,
        }
    }

    #[tokio::test]
    async fn flushes_a_bucket_with_correct_vwap() {
        let (tx, mut rx) = mpsc::channel(8);
        let agg = Aggregator::new(30, tx);
        agg.add_trade(&trade("t1", 100_000_000, 200_000_000));
        agg.add_trade(&trade("t2", 50_000_000, 100_000_000));

        let group = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(group.total_notional_micros, 150_000_000);
        assert_eq!(group.total_share_micros, 300_000_000);
        assert_eq!(group.vwap_price_micros, 500_000);
        assert_eq!(group.trade_event_ids, vec!["t1".to_string(), "t2".to_string()]);
    }
}
