//! REST fallback for order-book reads. Grounded directly on the teacher's
//! `scrapers/polymarket_api.rs` retry/backoff loop (`execute_with_retry`).

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::StageError;
use crate::rate_limit::RateLimiter;

use super::{NormalizedBook, PriceLevel};

const MAX_RETRIES: u32 = 3;

pub struct ClobRestClient {
    client: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

#[derive(Debug, Deserialize)]
struct RestLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct RestOrderBook {
    #[serde(default)]
    bids: Vec<RestLevel>,
    #[serde(default)]
    asks: Vec<RestLevel>,
}

impl ClobRestClient {
    pub fn new(base_url: String) -> Self {
        ClobRestClient {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            base_url,
            limiter: RateLimiter::per_10s(50),
        }
    }

    pub async fn fetch_orderbook(&self, token_id: &str) -> Result<NormalizedBook, StageError> {
        self.limiter.acquire().await;
        let url = format!("{}/book", self.base_url);
        let params = [("token_id", token_id)];

        let mut backoff_ms: u64 = 250;
        let mut last_err: Option<StageError> = None;

        for _attempt in 0..MAX_RETRIES {
            let resp = tokio::time::timeout(
                Duration::from_secs(10),
                self.client.get(&url).query(&params).send(),
            )
            .await;

            let resp = match resp {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    last_err = Some(StageError::Transient(e.into()));
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                    continue;
                }
                Err(_) => {
                    last_err = Some(StageError::Transient(anyhow::anyhow!("orderbook fetch timed out")));
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                    continue;
                }
            };

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                tokio::time::sleep(Duration::from_millis(backoff_ms * 10)).await;
                backoff_ms = (backoff_ms * 2).min(30_000);
                last_err = Some(StageError::RateLimited {
                    retry_not_before: chrono::Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64 * 10),
                });
                continue;
            }
            if !resp.status().is_success() {
                return Err(StageError::InvalidData(format!(
                    "orderbook fetch returned {}",
                    resp.status()
                )));
            }

            let parsed: RestOrderBook = resp
                .json()
                .await
                .map_err(|e| StageError::InvalidData(e.to_string()))?;

            let bids = parsed
                .bids
                .into_iter()
                .map(|l| PriceLevel {
                    price_micros: decimal_to_micros(&l.price),
                    size_micros: decimal_to_micros(&l.size),
                })
                .collect();
            let asks = parsed
                .asks
                .into_iter()
                .map(|l| PriceLevel {
                    price_micros: decimal_to_micros(&l.price),
                    size_micros: decimal_to_micros(&l.size),
                })
                .collect();
            // never assume ordering — NormalizedBook::new re-sorts both sides
            return Ok(NormalizedBook::new(token_id.to_string(), bids, asks));
        }

        Err(last_err.unwrap_or(StageError::Transient(anyhow::anyhow!("orderbook fetch exhausted retries"))))
    }
}

fn decimal_to_micros(s: &str) -> i64 {
    let s = s.trim();
    let (int_part, frac_part) = s.split_once('.').unwrap_or((s, ""));
    let int_val: i64 = int_part.parse().unwrap_or(0);
    let mut frac = frac_part.to_string();
    frac.truncate(6);
    while frac.len() < 6 {
        frac.push('0');
    }
    let frac_val: i64 = frac.parse().unwrap_or(0);
    int_val * 1_000_000 + frac_val
}
