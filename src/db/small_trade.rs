use rusqlite::OptionalExtension;

use super::Store;

/// Durable row backing one small-trade netting bucket (SPEC_FULL.md §4.5).
#[derive(Debug, Clone)]
pub struct SmallTradeBucketRow {
    pub bucket_key: String,
    pub followed_user_id: String,
    pub token_id: String,
    pub side: Option<String>,
    pub net_notional_micros: i64,
    pub net_share_micros: i64,
    pub first_seen_at_ms: i64,
    pub last_updated_at_ms: i64,
    pub count_trades_buffered: i64,
    pub reference_price_micros: i64,
    pub trade_event_ids: Vec<String>,
}

impl Store {
    pub async fn get_small_trade_bucket(
        &self,
        bucket_key: &str,
    ) -> anyhow::Result<Option<SmallTradeBucketRow>> {
        let bucket_key = bucket_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT bucket_key, followed_user_id, token_id, side, net_notional_micros,
                        net_share_micros, first_seen_at_ms, last_updated_at_ms,
                        count_trades_buffered, reference_price_micros, trade_event_ids_json
                 FROM small_trade_buckets WHERE bucket_key = ?1",
                [&bucket_key],
                |row| {
                    let ids_json: String = row.get(10)?;
                    let trade_event_ids: Vec<String> =
                        serde_json::from_str(&ids_json).unwrap_or_default();
                    Ok(SmallTradeBucketRow {
                        bucket_key: row.get(0)?,
                        followed_user_id: row.get(1)?,
                        token_id: row.get(2)?,
                        side: row.get(3)?,
                        net_notional_micros: row.get(4)?,
                        net_share_micros: row.get(5)?,
                        first_seen_at_ms: row.get(6)?,
                        last_updated_at_ms: row.get(7)?,
                        count_trades_buffered: row.get(8)?,
                        reference_price_micros: row.get(9)?,
                        trade_event_ids,
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// Atomically write the bucket record and its key-set membership
    /// together (a single table row covers both in this store).
    pub async fn put_small_trade_bucket(&self, row: &SmallTradeBucketRow) -> anyhow::Result<()> {
        let row = row.clone();
        let ids_json = serde_json::to_string(&row.trade_event_ids)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO small_trade_buckets
                   (bucket_key, followed_user_id, token_id, side, net_notional_micros,
                    net_share_micros, first_seen_at_ms, last_updated_at_ms,
                    count_trades_buffered, reference_price_micros, trade_event_ids_json)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                 ON CONFLICT(bucket_key) DO UPDATE SET
                   net_notional_micros = excluded.net_notional_micros,
                   net_share_micros = excluded.net_share_micros,
                   last_updated_at_ms = excluded.last_updated_at_ms,
                   count_trades_buffered = excluded.count_trades_buffered,
                   reference_price_micros = excluded.reference_price_micros,
                   trade_event_ids_json = excluded.trade_event_ids_json",
                rusqlite::params![
                    row.bucket_key,
                    row.followed_user_id,
                    row.token_id,
                    row.side,
                    row.net_notional_micros,
                    row.net_share_micros,
                    row.first_seen_at_ms,
                    row.last_updated_at_ms,
                    row.count_trades_buffered,
                    row.reference_price_micros,
                    ids_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_small_trade_bucket(&self, bucket_key: &str) -> anyhow::Result<()> {
        let bucket_key = bucket_key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM small_trade_buckets WHERE bucket_key = ?1",
                [&bucket_key],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_small_trade_buckets(&self) -> anyhow::Result<Vec<SmallTradeBucketRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT bucket_key, followed_user_id, token_id, side, net_notional_micros,
                        net_share_micros, first_seen_at_ms, last_updated_at_ms,
                        count_trades_buffered, reference_price_micros, trade_event_ids_json
                 FROM small_trade_buckets",
            )?;
            let rows = stmt.query_map([], |row| {
                let ids_json: String = row.get(10)?;
                let trade_event_ids: Vec<String> =
                    serde_json::from_str(&ids_json).unwrap_or_default();
                Ok(SmallTradeBucketRow {
                    bucket_key: row.get(0)?,
                    followed_user_id: row.get(1)?,
                    token_id: row.get(2)?,
                    side: row.get(3)?,
                    net_notional_micros: row.get(4)?,
                    net_share_micros: row.get(5)?,
                    first_seen_at_ms: row.get(6)?,
                    last_updated_at_ms: row.get(7)?,
                    count_trades_buffered: row.get(8)?,
                    reference_price_micros: row.get(9)?,
                    trade_event_ids,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }
}
