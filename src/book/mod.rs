mod cache;
mod rest_client;
mod ws_client;

pub use cache::{BookCache, GetBookOptions, GetBookResult};
pub use rest_client::ClobRestClient;
pub use ws_client::BookWsClient;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price_micros: i64,
    pub size_micros: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedBook {
    pub token_id: String,
    /// sorted strictly descending by price
    pub bids: Vec<PriceLevel>,
    /// sorted strictly ascending by price
    pub asks: Vec<PriceLevel>,
}

impl NormalizedBook {
    pub fn new(token_id: String, mut bids: Vec<PriceLevel>, mut asks: Vec<PriceLevel>) -> Self {
        bids.sort_by(|a, b| b.price_micros.cmp(&a.price_micros));
        asks.sort_by(|a, b| a.price_micros.cmp(&b.price_micros));
        NormalizedBook {
            token_id,
            bids,
            asks,
        }
    }

    pub fn best_bid(&self) -> Option<i64> {
        self.bids.first().map(|l| l.price_micros)
    }

    pub fn best_ask(&self) -> Option<i64> {
        self.asks.first().map(|l| l.price_micros)
    }

    pub fn mid_price(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a + 1) / 2),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<i64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }
}
