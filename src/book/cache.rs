//! `BookCache::get_book` implements SPEC_FULL.md §4.3's freshness / wait /
//! REST-fallback contract, layered on top of the WS supervisor
//! (`BookWsClient`) from the same grounding file.

use std::sync::Arc;
use std::time::Duration;

use super::{BookWsClient, ClobRestClient, NormalizedBook};

#[derive(Debug, Clone, Copy)]
pub struct GetBookOptions {
    pub wait_ms: u64,
    pub freshness_ms: u64,
    pub no_wait: bool,
}

impl Default for GetBookOptions {
    fn default() -> Self {
        GetBookOptions {
            wait_ms: 500,
            freshness_ms: 2_000,
            no_wait: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSource {
    Ws,
    Rest,
}

pub struct GetBookResult {
    pub book: Option<NormalizedBook>,
    pub source: BookSource,
    pub stale: bool,
}

pub struct BookCache {
    ws: Option<Arc<BookWsClient>>,
    rest: ClobRestClient,
    streaming_enabled: bool,
}

impl BookCache {
    pub fn new(ws_url: String, rest_base_url: String, streaming_enabled: bool) -> Self {
        let ws = if streaming_enabled {
            Some(BookWsClient::spawn(ws_url))
        } else {
            None
        };
        BookCache {
            ws,
            rest: ClobRestClient::new(rest_base_url),
            streaming_enabled,
        }
    }

    pub fn ensure_subscribed(&self, token_id: &str) {
        if let Some(ws) = &self.ws {
            ws.request_subscribe(token_id);
        }
    }

    pub async fn get_book(&self, token_id: &str, opts: GetBookOptions) -> GetBookResult {
        let freshness = Duration::from_millis(opts.freshness_ms);

        if self.streaming_enabled {
            if let Some(ws) = &self.ws {
                if let Some(book) = ws.get_book(token_id, freshness) {
                    return GetBookResult {
                        book: Some(book),
                        source: BookSource::Ws,
                        stale: false,
                    };
                }

                if !opts.no_wait {
                    ws.wait_for_update(token_id, Duration::from_millis(opts.wait_ms))
                        .await;
                    if let Some(book) = ws.get_book(token_id, freshness) {
                        return GetBookResult {
                            book: Some(book),
                            source: BookSource::Ws,
                            stale: false,
                        };
                    }
                }
            }
        }

        match self.rest.fetch_orderbook(token_id).await {
            Ok(book) => {
                // opportunistically seed the WS cache so later readers can
                // hit the fast path; the WS supervisor owns the canonical
                // cache, this is a courtesy warm-up only.
                self.ensure_subscribed(token_id);
                GetBookResult {
                    book: Some(book),
                    source: BookSource::Rest,
                    stale: false,
                }
            }
            Err(_) => GetBookResult {
                book: None,
                source: BookSource::Rest,
                stale: true,
            },
        }
    }
}
