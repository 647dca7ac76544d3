//! Gamma API client for asynchronous market-metadata enrichment. Not on the
//! execution critical path (SPEC_FULL.md §6). Grounded directly on
//! `scrapers/polymarket_gamma.rs`: custom string-or-number deserializers and
//! a TTL-cached lookup-by-token-id pattern.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::db::Store;
use crate::error::StageError;
use crate::rate_limit::RateLimiter;

const TTL_SECONDS: i64 = 24 * 3600;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MarketMetadata {
    pub condition_id: String,
    pub market_id: String,
    pub market_slug: String,
    pub market_title: String,
    pub outcome_label: String,
    pub close_time: chrono::DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawGammaMarket {
    #[serde(rename = "conditionId")]
    condition_id: String,
    #[serde(rename = "marketId", alias = "id")]
    market_id: String,
    #[serde(rename = "marketSlug", alias = "slug")]
    market_slug: String,
    #[serde(rename = "marketTitle", alias = "question")]
    market_title: String,
    #[serde(rename = "outcomeLabel", default)]
    outcome_label: Option<String>,
    #[serde(rename = "closeTime", alias = "endDate")]
    close_time: String,
}

pub struct GammaClient {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
    store: Store,
}

impl GammaClient {
    pub fn new(base_url: String, store: Store) -> Self {
        GammaClient {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            base_url,
            limiter: RateLimiter::per_10s(20),
            store,
        }
    }

    pub async fn lookup_by_token_id(&self, token_id: &str) -> Result<Option<MarketMetadata>, StageError> {
        let cache_key = format!("gamma:token:{token_id}");
        if let Some(cached) = self.read_cache(&cache_key).await? {
            return Ok(Some(cached));
        }

        self.limiter.acquire().await;
        let url = format!("{}/markets", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("clob_token_ids", token_id)])
            .send()
            .await
            .map_err(|e| StageError::Transient(e.into()))?;

        if !resp.status().is_success() {
            return Err(StageError::InvalidData(format!("gamma api returned {}", resp.status())));
        }

        let raws: Vec<RawGammaMarket> = resp.json().await.map_err(|e| StageError::InvalidData(e.to_string()))?;
        let Some(raw) = raws.into_iter().next() else {
            return Ok(None);
        };

        let close_time = chrono::DateTime::parse_from_rfc3339(&raw.close_time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        let metadata = MarketMetadata {
            condition_id: raw.condition_id,
            market_id: raw.market_id,
            market_slug: raw.market_slug,
            market_title: raw.market_title,
            outcome_label: raw.outcome_label.unwrap_or_default(),
            close_time,
        };

        self.write_cache(&cache_key, &metadata).await?;
        Ok(Some(metadata))
    }

    async fn read_cache(&self, key: &str) -> Result<Option<MarketMetadata>, StageError> {
        let Some(raw) = self.store.get_checkpoint(key).await.map_err(StageError::Transient)? else {
            return Ok(None);
        };
        let cached: CachedMetadata = serde_json::from_str(&raw).map_err(|e| StageError::InvalidData(e.to_string()))?;
        if Utc::now().timestamp() - cached.cached_at > TTL_SECONDS {
            return Ok(None);
        }
        Ok(Some(cached.metadata))
    }

    async fn write_cache(&self, key: &str, metadata: &MarketMetadata) -> Result<(), StageError> {
        let cached = CachedMetadata {
            cached_at: Utc::now().timestamp(),
            metadata: metadata.clone(),
        };
        let json = serde_json::to_string(&cached).map_err(|e| StageError::InvalidData(e.to_string()))?;
        self.store.set_checkpoint(key, &json).await.map_err(StageError::Transient)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CachedMetadata {
    cached_at: i64,
    metadata: MarketMetadata,
}
