//! Venue Data API client (wallet trades + activity). Grounded directly on
//! `scrapers/polymarket_api.rs`: a shared `reqwest::Client`, a per-family
//! `RateLimiter`, and `execute_with_retry`-style exponential backoff that
//! distinguishes 429 from other failures.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::StageError;
use crate::micros::clamp_price;
use crate::models::Side;
use crate::rate_limit::RateLimiter;

const MAX_RETRIES: u32 = 3;

pub struct DataApiClient {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

#[derive(Debug, Clone)]
pub struct DataApiTrade {
    pub id: Option<String>,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    pub price_micros: i64,
    pub size_micros: i64,
    pub notional_micros: i64,
    pub asset_id: String,
    pub market_id: Option<String>,
    pub condition_id: Option<String>,
    pub proxy_wallet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrade {
    id: Option<String>,
    #[serde(rename = "transactionHash", alias = "transaction_hash")]
    transaction_hash: Option<String>,
    #[serde(alias = "match_time")]
    timestamp: Option<i64>,
    side: String,
    #[serde(deserialize_with = "de_string_f64_as_micros")]
    price: i64,
    #[serde(deserialize_with = "de_string_f64_as_micros")]
    size: i64,
    #[serde(default, rename = "usdcSize", deserialize_with = "de_opt_string_f64_as_micros")]
    usdc_size: Option<i64>,
    #[serde(alias = "asset_id", alias = "assetId")]
    asset: String,
    #[serde(default, alias = "marketId")]
    market: Option<String>,
    #[serde(default)]
    condition_id: Option<String>,
    #[serde(default, alias = "owner")]
    proxy_wallet: Option<String>,
}

/// Venue APIs send numeric fields as JSON strings or bare numbers
/// inconsistently; this deserializer accepts either and converts to
/// micros, matching the teacher's `de_string_f64_opt` convention in
/// `scrapers/polymarket_gamma.rs`.
fn de_string_f64_as_micros<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    Ok(value_to_micros(&v))
}

fn de_opt_string_f64_as_micros<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(v.map(|v| value_to_micros(&v)))
}

fn value_to_micros(v: &serde_json::Value) -> i64 {
    let s = match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return 0,
    };
    decimal_str_to_micros(&s)
}

fn decimal_str_to_micros(s: &str) -> i64 {
    let (int_part, frac_part) = s.trim().split_once('.').unwrap_or((s, ""));
    let sign = if int_part.starts_with('-') { -1 } else { 1 };
    let int_val: i64 = int_part.parse().unwrap_or(0);
    let mut frac = frac_part.to_string();
    frac.truncate(6);
    while frac.len() < 6 {
        frac.push('0');
    }
    let frac_val: i64 = frac.parse().unwrap_or(0);
    sign * (int_val.abs() * 1_000_000 + frac_val)
}

impl DataApiClient {
    pub fn new(base_url: String) -> Self {
        DataApiClient {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            base_url,
            limiter: RateLimiter::per_10s(50),
        }
    }

    pub async fn fetch_wallet_trades(
        &self,
        wallet: &str,
        before: Option<DateTime<Utc>>,
        page_size: usize,
    ) -> Result<Vec<DataApiTrade>, StageError> {
        self.limiter.acquire().await;
        let url = format!("{}/trades", self.base_url);
        let before_secs = before.map(|t| t.timestamp().to_string());
        let limit = page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![("user", wallet), ("limit", &limit)];
        if let Some(b) = &before_secs {
            query.push(("before", b));
        }

        let raws: Vec<RawTrade> = self.execute_with_retry(&url, &query).await?;
        Ok(raws.into_iter().filter_map(raw_to_trade).collect())
    }

    async fn execute_with_retry<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, StageError> {
        let mut backoff_ms: u64 = 250;
        let mut last_err: Option<StageError> = None;

        for _ in 0..MAX_RETRIES {
            let resp = tokio::time::timeout(Duration::from_secs(10), self.client.get(url).query(query).send()).await;
            let resp = match resp {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    last_err = Some(StageError::Transient(e.into()));
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                    continue;
                }
                Err(_) => {
                    last_err = Some(StageError::Transient(anyhow::anyhow!("data api request timed out")));
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                    continue;
                }
            };

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                tokio::time::sleep(Duration::from_millis(backoff_ms * 10)).await;
                backoff_ms = (backoff_ms * 2).min(30_000);
                last_err = Some(StageError::RateLimited {
                    retry_not_before: Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64 * 10),
                });
                continue;
            }
            if !resp.status().is_success() {
                return Err(StageError::InvalidData(format!("data api returned {}", resp.status())));
            }
            return resp.json::<T>().await.map_err(|e| StageError::InvalidData(e.to_string()));
        }
        Err(last_err.unwrap_or(StageError::Transient(anyhow::anyhow!("data api retries exhausted"))))
    }
}

fn raw_to_trade(raw: RawTrade) -> Option<DataApiTrade> {
    let tx_hash = raw.transaction_hash?;
    let timestamp = DateTime::from_timestamp(raw.timestamp?, 0)?;
    let side = if raw.side.eq_ignore_ascii_case("buy") {
        Side::Buy
    } else {
        Side::Sell
    };
    let notional = raw.usdc_size.unwrap_or_else(|| {
        crate::micros::mul_div(raw.price, raw.size, crate::micros::ONE)
    });
    Some(DataApiTrade {
        id: raw.id,
        tx_hash,
        timestamp,
        side,
        price_micros: clamp_price(raw.price),
        size_micros: raw.size,
        notional_micros: notional,
        asset_id: raw.asset,
        market_id: raw.market,
        condition_id: raw.condition_id,
        proxy_wallet: raw.proxy_wallet,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_str_to_micros_handles_fractions() {
        assert_eq!(decimal_str_to_micros("0.5"), 500_000);
        assert_eq!(decimal_str_to_micros("123.456789"), 123_456_789);
        assert_eq!(decimal_str_to_micros("-0.25"), -250_000);
    }
}
