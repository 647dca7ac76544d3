//! On-chain `OrderFilled` log subscriber. Connection-lifecycle/backoff
//! shape grounded directly on `scrapers/polymarket_ws.rs`, reused here for
//! the RPC log-subscription use case instead of the CLOB book feed
//! (SPEC_FULL.md §4.1).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Store;
use crate::health::HealthState;
use crate::models::{EnrichmentStatus, TradeEvent, TradeSource};
use crate::wallets::{attribute, WalletRegistry};

use super::decode::{attribute_fill, decode_order_filled, DecodeError, RawLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Resubscribing,
}

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const RATE_LIMIT_SCHEDULE_SECS: [u64; 3] = [120, 240, 480];
const RATE_LIMIT_CAP_SECS: u64 = 600;

pub struct WsIngestor {
    ws_url: String,
    store: Store,
    wallets: Arc<WalletRegistry>,
    health: Option<Arc<HealthState>>,
}

impl WsIngestor {
    pub fn new(ws_url: String, store: Store, wallets: Arc<WalletRegistry>) -> Self {
        WsIngestor { ws_url, store, wallets, health: None }
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    pub async fn run(self) {
        let mut state = ConnState::Disconnected;
        let mut backoff = BASE_BACKOFF;
        let mut rate_limit_attempt: usize = 0;

        loop {
            state = ConnState::Connecting;
            match self.connect_and_stream(&mut state).await {
                Ok(()) => {
                    backoff = BASE_BACKOFF;
                    rate_limit_attempt = 0;
                }
                Err(WsIngestError::RateLimited) => {
                    let idx = rate_limit_attempt.min(RATE_LIMIT_SCHEDULE_SECS.len() - 1);
                    let secs = RATE_LIMIT_SCHEDULE_SECS[idx].min(RATE_LIMIT_CAP_SECS);
                    let retry_not_before = Utc::now() + chrono::Duration::seconds(secs as i64);
                    let _ = self
                        .store
                        .set_checkpoint("ws:retry_not_before", &retry_not_before.to_rfc3339())
                        .await;
                    warn!(secs, "rate limited (429), backing off on separate schedule");
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    rate_limit_attempt += 1;
                    continue;
                }
                Err(WsIngestError::Other(err)) => {
                    warn!(error = %err, "ws ingest stream ended, reconnecting");
                }
            }
            state = ConnState::Disconnected;
            if let Some(health) = &self.health {
                health.set_ws_connected(false);
            }
            let jitter: f64 = rand::thread_rng().gen_range(0.9..1.1);
            let sleep_for = Duration::from_secs_f64(backoff.as_secs_f64() * jitter);
            tokio::time::sleep(sleep_for).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect_and_stream(&self, state: &mut ConnState) -> Result<(), WsIngestError> {
        let connect_fut = connect_async(&self.ws_url);
        let (ws_stream, _) = tokio::time::timeout(Duration::from_secs(30), connect_fut)
            .await
            .map_err(|_| WsIngestError::Other(anyhow::anyhow!("connect timed out")))?
            .map_err(|e| WsIngestError::Other(e.into()))?;
        *state = ConnState::Connected;
        info!("ws ingestor connected");

        let (mut write, mut read) = ws_stream.split();
        let sub_msg = serde_json::json!({ "type": "logs_subscribe" });
        write
            .send(Message::Text(sub_msg.to_string()))
            .await
            .map_err(|e| WsIngestError::Other(e.into()))?;
        *state = ConnState::Subscribed;
        if let Some(health) = &self.health {
            health.set_ws_connected(true);
        }
        let _ = self
            .store
            .enqueue(
                "reconcile",
                &format!("reconcile:{}", Utc::now().timestamp_millis()),
                &serde_json::json!({ "sinceMinutes": 5 }).to_string(),
            )
            .await;

        let mut last_fingerprint = self.wallets.current().fingerprint();
        let mut refresh_interval = tokio::time::interval(Duration::from_secs(60));

        loop {
            tokio::select! {
                _ = refresh_interval.tick() => {
                    if let Ok(changed) = self.wallets.refresh_from_store(&self.store).await {
                        let fp = self.wallets.current().fingerprint();
                        if changed && fp != last_fingerprint {
                            *state = ConnState::Resubscribing;
                            write.send(Message::Text(sub_msg.to_string())).await
                                .map_err(|e| WsIngestError::Other(e.into()))?;
                            *state = ConnState::Subscribed;
                            last_fingerprint = fp;
                        }
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(err) = self.handle_message(&text).await {
                                warn!(error = %err, "failed to process ws message");
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            if frame.as_ref().map(|f| f.code == tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Policy).unwrap_or(false) {
                                return Err(WsIngestError::RateLimited);
                            }
                            return Err(WsIngestError::Other(anyhow::anyhow!("ws closed")));
                        }
                        None => return Err(WsIngestError::Other(anyhow::anyhow!("ws stream ended"))),
                        Some(Err(err)) => return Err(WsIngestError::Other(err.into())),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_message(&self, text: &str) -> anyhow::Result<()> {
        let envelope: LogEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        let raw = envelope.into_raw_log();

        let decoded = match decode_order_filled(&raw) {
            Ok(d) => d,
            Err(DecodeError::Removed) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "dropping malformed OrderFilled log");
                return Ok(());
            }
        };

        let snapshot = self.wallets.current();
        let attribution = match attribute(&snapshot, &decoded.maker, &decoded.taker) {
            Some(a) => a,
            None => return Ok(()),
        };
        let fill = attribute_fill(&decoded, attribution.from_maker);
        let now = Utc::now();

        let trade = TradeEvent {
            id: Uuid::new_v4().to_string(),
            source: TradeSource::OnchainWs,
            source_id: None,
            tx_hash: raw.tx_hash.clone(),
            log_index: Some(raw.log_index),
            is_canonical: true,
            profile_wallet: attribution.followed_user_id.clone(),
            proxy_wallet: attribution.proxy_wallet.clone(),
            side: fill.side,
            price_micros: fill.price_micros,
            share_micros: fill.share_micros,
            notional_micros: fill.notional_micros,
            fee_micros: decoded.fee_micros,
            event_time: now,
            detect_time: now,
            market_id: None,
            asset_id: Some(fill.outcome_asset_id.to_string()),
            raw_token_id: Some(fill.outcome_asset_id.to_string()),
            condition_id: None,
            enrichment_status: EnrichmentStatus::Pending,
        };

        let inserted = self.store.insert_trade_event(&trade).await?;
        if inserted {
            if let Some(health) = &self.health {
                health.note_canonical_event(now);
            }
            self.store
                .set_checkpoint("alchemy:lastBlock", &envelope.block_number.to_string())
                .await?;
            let payload = serde_json::json!({
                "tradeEventId": trade.id,
                "followedUserId": trade.profile_wallet,
            });
            self.store
                .enqueue("ingestEvents", &trade.id, &payload.to_string())
                .await?;
        }
        Ok(())
    }
}

enum WsIngestError {
    RateLimited,
    Other(anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct LogEnvelope {
    #[serde(rename = "transactionHash")]
    tx_hash: String,
    #[serde(rename = "logIndex")]
    log_index: i64,
    #[serde(default)]
    removed: bool,
    topics: Vec<String>,
    data_words: Vec<String>,
    #[serde(default, rename = "blockNumber")]
    block_number: i64,
}

impl LogEnvelope {
    fn into_raw_log(&self) -> RawLog {
        RawLog {
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
            removed: self.removed,
            topics: self.topics.clone(),
            data_words: self.data_words.clone(),
        }
    }
}
