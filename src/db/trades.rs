use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::models::{
    ActivityEvent, EnrichmentStatus, Side, TradeEvent, TradeSource,
};

use super::Store;

fn side_str(side: Side) -> &'static str {
    side.as_str()
}

fn parse_side(s: &str) -> Side {
    if s == "BUY" {
        Side::Buy
    } else {
        Side::Sell
    }
}

fn enrichment_str(status: EnrichmentStatus) -> &'static str {
    match status {
        EnrichmentStatus::Pending => "PENDING",
        EnrichmentStatus::Enriched => "ENRICHED",
        EnrichmentStatus::Failed => "FAILED",
    }
}

impl Store {
    /// Insert a canonical trade event. Returns `true` if a new row was
    /// inserted, `false` if it already existed (idempotent by
    /// `(tx_hash, log_index)` or `(source, source_id)`).
    pub async fn insert_trade_event(&self, trade: &TradeEvent) -> anyhow::Result<bool> {
        let trade = trade.clone();
        self.with_conn(move |conn| {
            let existing: Option<String> = if trade.source_id.is_some() {
                conn.query_row(
                    "SELECT id FROM trade_events WHERE source = ?1 AND source_id = ?2",
                    rusqlite::params![trade.source.as_str(), trade.source_id],
                    |row| row.get(0),
                )
                .optional()?
            } else {
                conn.query_row(
                    "SELECT id FROM trade_events WHERE tx_hash = ?1 AND log_index IS ?2",
                    rusqlite::params![trade.tx_hash, trade.log_index],
                    |row| row.get(0),
                )
                .optional()?
            };
            if existing.is_some() {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO trade_events
                   (id, source, source_id, tx_hash, log_index, is_canonical, profile_wallet,
                    proxy_wallet, side, price_micros, share_micros, notional_micros, fee_micros,
                    event_time, detect_time, market_id, asset_id, raw_token_id, condition_id,
                    enrichment_status)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)
                 ON CONFLICT DO NOTHING",
                rusqlite::params![
                    trade.id,
                    trade.source.as_str(),
                    trade.source_id,
                    trade.tx_hash,
                    trade.log_index,
                    trade.is_canonical as i64,
                    trade.profile_wallet,
                    trade.proxy_wallet,
                    side_str(trade.side),
                    trade.price_micros,
                    trade.share_micros,
                    trade.notional_micros,
                    trade.fee_micros,
                    trade.event_time.to_rfc3339(),
                    trade.detect_time.to_rfc3339(),
                    trade.market_id,
                    trade.asset_id,
                    trade.raw_token_id,
                    trade.condition_id,
                    enrichment_str(trade.enrichment_status),
                ],
            )?;
            Ok(true)
        })
        .await
    }

    /// Find an existing `ONCHAIN_WS` trade matching the API reconciliation
    /// key `(tx_hash, profile_wallet, side, token_id)`. `profile_wallet`
    /// stores `FollowedUser.id` (both ingestors key rows by the stable
    /// followed-user id, not the wallet address).
    pub async fn find_ws_trade_for_reconcile(
        &self,
        tx_hash: &str,
        followed_user_id: &str,
        side: Side,
        token_id: &str,
    ) -> anyhow::Result<Option<(String, DateTime<Utc>, DateTime<Utc>)>> {
        let tx_hash = tx_hash.to_string();
        let followed_user_id = followed_user_id.to_lowercase();
        let side_s = side_str(side).to_string();
        let token_id = token_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, event_time, detect_time FROM trade_events
                 WHERE source = 'ONCHAIN_WS' AND tx_hash = ?1 AND lower(profile_wallet) = ?2
                   AND side = ?3 AND (raw_token_id = ?4 OR asset_id = ?4)",
                rusqlite::params![tx_hash, followed_user_id, side_s, token_id],
                |row| {
                    let event_time: String = row.get(1)?;
                    let detect_time: String = row.get(2)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        DateTime::parse_from_rfc3339(&event_time)
                            .unwrap()
                            .with_timezone(&Utc),
                        DateTime::parse_from_rfc3339(&detect_time)
                            .unwrap()
                            .with_timezone(&Utc),
                    ))
                },
            )
            .optional()
        })
        .await
    }

    /// Back-patch `event_time` on an existing WS-sourced trade. Never
    /// touches `detect_time` (see DESIGN.md Open Question #1).
    pub async fn backpatch_event_time(
        &self,
        trade_id: &str,
        event_time: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let trade_id = trade_id.to_string();
        let event_time = event_time.to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE trade_events SET event_time = ?1 WHERE id = ?2",
                rusqlite::params![event_time, trade_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_trade_event(&self, id: &str) -> anyhow::Result<Option<TradeEvent>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, source, source_id, tx_hash, log_index, is_canonical, profile_wallet,
                        proxy_wallet, side, price_micros, share_micros, notional_micros, fee_micros,
                        event_time, detect_time, market_id, asset_id, raw_token_id, condition_id,
                        enrichment_status
                 FROM trade_events WHERE id = ?1",
                [&id],
                |row| {
                    let source: String = row.get(1)?;
                    let side: String = row.get(8)?;
                    let event_time: String = row.get(13)?;
                    let detect_time: String = row.get(14)?;
                    let enrichment: String = row.get(19)?;
                    Ok(TradeEvent {
                        id: row.get(0)?,
                        source: if source == "ONCHAIN_WS" {
                            TradeSource::OnchainWs
                        } else {
                            TradeSource::PolymarketApi
                        },
                        source_id: row.get(2)?,
                        tx_hash: row.get(3)?,
                        log_index: row.get(4)?,
                        is_canonical: row.get::<_, i64>(5)? != 0,
                        profile_wallet: row.get(6)?,
                        proxy_wallet: row.get(7)?,
                        side: parse_side(&side),
                        price_micros: row.get(9)?,
                        share_micros: row.get(10)?,
                        notional_micros: row.get(11)?,
                        fee_micros: row.get(12)?,
                        event_time: DateTime::parse_from_rfc3339(&event_time)
                            .unwrap()
                            .with_timezone(&Utc),
                        detect_time: DateTime::parse_from_rfc3339(&detect_time)
                            .unwrap()
                            .with_timezone(&Utc),
                        market_id: row.get(15)?,
                        asset_id: row.get(16)?,
                        raw_token_id: row.get(17)?,
                        condition_id: row.get(18)?,
                        enrichment_status: match enrichment.as_str() {
                            "ENRICHED" => EnrichmentStatus::Enriched,
                            "FAILED" => EnrichmentStatus::Failed,
                            _ => EnrichmentStatus::Pending,
                        },
                    })
                },
            )
            .optional()
        })
        .await
    }

    pub async fn insert_activity_event(&self, activity: &ActivityEvent) -> anyhow::Result<bool> {
        let activity = activity.clone();
        let items_json = serde_json::to_string(&activity.items)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "INSERT INTO activity_events
                   (id, source_id, activity_type, profile_wallet, items_json,
                    collateral_amount_micros, event_time, detect_time)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                 ON CONFLICT(source_id) DO NOTHING",
                rusqlite::params![
                    activity.id,
                    activity.source_id,
                    format!("{:?}", activity.activity_type).to_uppercase(),
                    activity.profile_wallet,
                    items_json,
                    activity.collateral_amount_micros,
                    activity.event_time.to_rfc3339(),
                    activity.detect_time.to_rfc3339(),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }
}
