//! Periodic Data API poller with pagination cursor handling and
//! WS-trade reconciliation (SPEC_FULL.md §4.2). Grounded on
//! `scrapers/polymarket_api.rs`'s periodic-poll-with-cursor shape.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data_api_client::{DataApiClient, DataApiTrade};
use crate::db::Store;
use crate::models::{EnrichmentStatus, FollowedUser, TradeEvent, TradeSource};

const PAGE_SIZE: usize = 100;
const MAX_PAGES_ROUTINE: usize = 10;
const MAX_PAGES_FAST: usize = 5;
const DEFAULT_BACKFILL: Duration = Duration::minutes(15);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Cursor {
    last_time: Option<DateTime<Utc>>,
    resume_before: Option<DateTime<Utc>>,
}

pub struct ApiIngestor {
    client: DataApiClient,
    store: Store,
}

impl ApiIngestor {
    pub fn new(client: DataApiClient, store: Store) -> Self {
        ApiIngestor { client, store }
    }

    pub async fn run_forever(self, interval_secs: u64) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let users = match self.store.list_followed_users().await {
                Ok(u) => u,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to list followed users");
                    continue;
                }
            };
            for user in users.into_iter().filter(|u| u.enabled) {
                if let Err(err) = self.poll_once(&user, false).await {
                    tracing::warn!(error = %err, user = %user.id, "api ingest cycle failed");
                }
            }
        }
    }

    async fn load_cursor(&self, user_id: &str) -> anyhow::Result<Cursor> {
        let key = format!("api:cursor:{user_id}");
        match self.store.get_checkpoint(&key).await? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(Cursor {
                last_time: Some(Utc::now() - DEFAULT_BACKFILL),
                resume_before: None,
            }),
        }
    }

    async fn save_cursor(&self, user_id: &str, cursor: &Cursor) -> anyhow::Result<()> {
        let key = format!("api:cursor:{user_id}");
        self.store
            .set_checkpoint(&key, &serde_json::to_string(cursor)?)
            .await
    }

    pub async fn poll_once(&self, user: &FollowedUser, fast_path: bool) -> anyhow::Result<()> {
        let mut cursor = self.load_cursor(&user.id).await?;
        let max_pages = if fast_path { MAX_PAGES_FAST } else { MAX_PAGES_ROUTINE };

        let mut before = cursor.resume_before;
        let mut pages_fetched = 0usize;
        let mut max_time_seen: Option<DateTime<Utc>> = None;
        let mut prev_oldest: Option<DateTime<Utc>> = None;
        let mut stalled = false;
        let mut exhausted = false;

        loop {
            if pages_fetched >= max_pages {
                break;
            }
            let page = self
                .client
                .fetch_wallet_trades(&user.profile_wallet, before, PAGE_SIZE)
                .await?;
            pages_fetched += 1;

            if page.is_empty() {
                exhausted = true;
                break;
            }

            for trade in &page {
                max_time_seen = Some(max_time_seen.map_or(trade.timestamp, |m| m.max(trade.timestamp)));
                self.ingest_api_trade(user, trade).await?;
            }

            let oldest_in_page = page.iter().map(|t| t.timestamp).min().unwrap();
            if let Some(prev) = prev_oldest {
                if oldest_in_page >= prev {
                    stalled = true;
                    break;
                }
            }
            prev_oldest = Some(oldest_in_page);
            before = Some(oldest_in_page);

            if page.len() < PAGE_SIZE {
                exhausted = true;
                break;
            }
        }

        if stalled {
            tracing::warn!(user = %user.id, "api ingest pagination stalled, retrying next cycle");
            // cursor untouched; try again next cycle
        } else if exhausted {
            if let Some(max_time) = max_time_seen {
                cursor.last_time = Some(max_time);
            }
            cursor.resume_before = None;
            self.save_cursor(&user.id, &cursor).await?;
        } else {
            // hit max_pages: save resume point, do not advance last_time
            cursor.resume_before = before;
            self.save_cursor(&user.id, &cursor).await?;
        }

        Ok(())
    }

    async fn ingest_api_trade(&self, user: &FollowedUser, trade: &DataApiTrade) -> anyhow::Result<()> {
        let side = trade.side;
        if let Some((existing_id, event_time, detect_time)) = self
            .store
            .find_ws_trade_for_reconcile(&trade.tx_hash, &user.id, side, &trade.asset_id)
            .await?
        {
            if event_time == detect_time || trade.timestamp < event_time {
                self.store.backpatch_event_time(&existing_id, trade.timestamp).await?;
            }
            return Ok(());
        }

        let source_id = trade.id.clone().unwrap_or_else(|| {
            format!(
                "{}_{}_{}_{}_{}",
                trade.tx_hash,
                trade.timestamp.timestamp(),
                side.as_str(),
                trade.asset_id,
                trade.size_micros
            )
        });

        let now = Utc::now();
        let event = TradeEvent {
            id: Uuid::new_v4().to_string(),
            source: TradeSource::PolymarketApi,
            source_id: Some(source_id),
            tx_hash: trade.tx_hash.clone(),
            log_index: None,
            is_canonical: true,
            profile_wallet: user.id.clone(),
            proxy_wallet: trade.proxy_wallet.clone(),
            side,
            price_micros: trade.price_micros,
            share_micros: trade.size_micros,
            notional_micros: trade.notional_micros,
            fee_micros: 0,
            event_time: trade.timestamp,
            detect_time: now,
            market_id: trade.market_id.clone(),
            asset_id: Some(trade.asset_id.clone()),
            raw_token_id: Some(trade.asset_id.clone()),
            condition_id: trade.condition_id.clone(),
            enrichment_status: EnrichmentStatus::Pending,
        };

        let inserted = self.store.insert_trade_event(&event).await?;
        if inserted {
            let payload = serde_json::json!({
                "tradeEventId": event.id,
                "followedUserId": user.id,
            });
            self.store
                .enqueue("ingestEvents", &event.id, &payload.to_string())
                .await?;
        }
        Ok(())
    }
}
