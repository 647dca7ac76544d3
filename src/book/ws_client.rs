//! CLOB market book WebSocket supervisor. Grounded directly on the
//! teacher's `scrapers/polymarket_ws.rs::PolymarketMarketWsCache`: one
//! supervisor task owns the socket, a `HashMap<TokenId, CachedBook>` behind
//! `parking_lot::RwLock` holds the latest normalized book per token, and
//! reads never touch the socket directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{NormalizedBook, PriceLevel};

enum WsCommand {
    Subscribe(String),
}

struct CachedEntry {
    book: NormalizedBook,
    updated_at: Instant,
}

pub struct BookWsClient {
    cmd_tx: mpsc::Sender<WsCommand>,
    books: Arc<RwLock<HashMap<String, CachedEntry>>>,
    waiters: Arc<RwLock<HashMap<String, Arc<Notify>>>>,
    ws_url: String,
}

impl BookWsClient {
    pub fn spawn(ws_url: String) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let client = Arc::new(BookWsClient {
            cmd_tx,
            books: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            ws_url,
        });
        let worker = client.clone();
        tokio::spawn(async move {
            worker.run(cmd_rx).await;
        });
        client
    }

    pub fn request_subscribe(&self, token_id: &str) {
        let _ = self.cmd_tx.try_send(WsCommand::Subscribe(token_id.to_string()));
    }

    pub fn get_book(&self, token_id: &str, max_age: Duration) -> Option<NormalizedBook> {
        let books = self.books.read();
        books.get(token_id).and_then(|entry| {
            if entry.updated_at.elapsed() <= max_age {
                Some(entry.book.clone())
            } else {
                None
            }
        })
    }

    fn notify_for(&self, token_id: &str) -> Arc<Notify> {
        self.waiters
            .write()
            .entry(token_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub async fn wait_for_update(&self, token_id: &str, timeout: Duration) {
        let notify = self.notify_for(token_id);
        let _ = tokio::time::timeout(timeout, notify.notified()).await;
    }

    async fn run(self: Arc<Self>, mut cmd_rx: mpsc::Receiver<WsCommand>) {
        let subscribed = Arc::new(RwLock::new(HashSet::<String>::new()));
        let mut backoff = Duration::from_secs(1);
        loop {
            // drain pending subscribe commands into the interest set before connecting
            while let Ok(cmd) = cmd_rx.try_recv() {
                match cmd {
                    WsCommand::Subscribe(token_id) => {
                        subscribed.write().insert(token_id);
                    }
                }
            }
            if subscribed.read().is_empty() {
                match cmd_rx.recv().await {
                    Some(WsCommand::Subscribe(token_id)) => {
                        subscribed.write().insert(token_id);
                    }
                    None => return,
                }
            }

            match self.connect_and_stream(&mut cmd_rx, &subscribed).await {
                Ok(()) => {
                    backoff = Duration::from_secs(1);
                }
                Err(err) => {
                    warn!(error = %err, "book ws stream ended, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<WsCommand>,
        subscribed: &Arc<RwLock<HashSet<String>>>,
    ) -> anyhow::Result<()> {
        let (ws_stream, _) = connect_async(&self.ws_url).await?;
        info!("book ws connected");
        let (mut write, mut read) = ws_stream.split();

        let assets: Vec<String> = subscribed.read().iter().cloned().collect();
        let sub_msg = serde_json::json!({ "type": "market", "assets_ids": assets });
        write.send(Message::Text(sub_msg.to_string())).await?;

        let mut ping_interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    write.send(Message::Text("PING".to_string())).await?;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(WsCommand::Subscribe(token_id)) => {
                            subscribed.write().insert(token_id.clone());
                            let assets: Vec<String> = subscribed.read().iter().cloned().collect();
                            let sub_msg = serde_json::json!({ "type": "market", "assets_ids": assets });
                            write.send(Message::Text(sub_msg.to_string())).await?;
                        }
                        None => return Ok(()),
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text_message(&text),
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(anyhow::anyhow!("ws closed"));
                        }
                        Some(Err(err)) => return Err(err.into()),
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_text_message(&self, text: &str) {
        let parsed: Result<WsBookMsg, _> = serde_json::from_str(text);
        let msg = match parsed {
            Ok(m) if m.event_type == "book" => m,
            Ok(_) => return,
            Err(_) => {
                debug!(raw = %text, "ignoring non-book ws message");
                return;
            }
        };

        let bids = msg
            .bids
            .into_iter()
            .map(|l| PriceLevel {
                price_micros: l.price_micros(),
                size_micros: l.size_micros(),
            })
            .collect();
        let asks = msg
            .asks
            .into_iter()
            .map(|l| PriceLevel {
                price_micros: l.price_micros(),
                size_micros: l.size_micros(),
            })
            .collect();
        let book = NormalizedBook::new(msg.asset_id.clone(), bids, asks);

        self.books.write().insert(
            msg.asset_id.clone(),
            CachedEntry {
                book,
                updated_at: Instant::now(),
            },
        );
        if let Some(notify) = self.waiters.read().get(&msg.asset_id) {
            notify.notify_waiters();
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsLevel {
    price: String,
    size: String,
}

impl WsLevel {
    fn price_micros(&self) -> i64 {
        parse_decimal_to_micros(&self.price)
    }
    fn size_micros(&self) -> i64 {
        parse_decimal_to_micros(&self.size)
    }
}

#[derive(Debug, Deserialize)]
struct WsBookMsg {
    event_type: String,
    asset_id: String,
    #[serde(default)]
    bids: Vec<WsLevel>,
    #[serde(default)]
    asks: Vec<WsLevel>,
}

/// Parse a decimal string price/size (as the CLOB API sends them) into
/// micros without going through floats.
fn parse_decimal_to_micros(s: &str) -> i64 {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_strings_without_floats() {
        assert_eq!(parse_decimal_to_micros("0.5"), 500_000);
        assert_eq!(parse_decimal_to_micros("1"), 1_000_000);
        assert_eq!(parse_decimal_to_micros("0.123456"), 123_456);
    }
}
