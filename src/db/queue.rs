use chrono::{Duration, Utc};
use rusqlite::OptionalExtension;

use super::Store;

#[derive(Debug, Clone)]
pub struct QueueJob {
    pub row_id: i64,
    pub job_id: String,
    pub payload_json: String,
    pub attempts: i64,
}

impl Store {
    /// Enqueue a job. Deduplicated by `(queue, job_id)` — a repeated enqueue
    /// of an already-pending/claimed job id is a no-op.
    pub async fn enqueue(&self, queue: &str, job_id: &str, payload_json: &str) -> anyhow::Result<()> {
        let queue = queue.to_string();
        let job_id = job_id.to_string();
        let payload_json = payload_json.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queue_jobs (queue, job_id, payload_json, status, attempts, available_at, created_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)
                 ON CONFLICT(queue, job_id) DO NOTHING",
                rusqlite::params![queue, job_id, payload_json, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Atomically claim the oldest available pending job on a queue.
    pub async fn claim_next(&self, queue: &str) -> anyhow::Result<Option<QueueJob>> {
        let queue = queue.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let found: Option<(i64, String, String, i64)> = tx
                .query_row(
                    "SELECT id, job_id, payload_json, attempts FROM queue_jobs
                     WHERE queue = ?1 AND status = 'pending' AND available_at <= ?2
                     ORDER BY id LIMIT 1",
                    rusqlite::params![queue, now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            if let Some((row_id, job_id, payload_json, attempts)) = &found {
                tx.execute(
                    "UPDATE queue_jobs SET status = 'claimed' WHERE id = ?1",
                    [row_id],
                )?;
                tx.commit()?;
                return Ok(Some(QueueJob {
                    row_id: *row_id,
                    job_id: job_id.clone(),
                    payload_json: payload_json.clone(),
                    attempts: *attempts,
                }));
            }
            tx.commit()?;
            Ok(None)
        })
        .await
    }

    pub async fn ack(&self, row_id: i64) -> anyhow::Result<()> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM queue_jobs WHERE id = ?1", [row_id])?;
            Ok(())
        })
        .await
    }

    /// Return a failed job to `pending` with exponential backoff, or move it
    /// to the dead-letter partition once `max_attempts` is exceeded.
    pub async fn retry_or_dead_letter(
        &self,
        row_id: i64,
        max_attempts: i64,
        backoff: Duration,
    ) -> anyhow::Result<()> {
        let available_at = (Utc::now() + backoff).to_rfc3339();
        self.with_conn(move |conn| {
            let attempts: i64 = conn.query_row(
                "SELECT attempts FROM queue_jobs WHERE id = ?1",
                [row_id],
                |row| row.get(0),
            )?;
            if attempts + 1 >= max_attempts {
                conn.execute(
                    "UPDATE queue_jobs SET status = 'dead_letter', attempts = attempts + 1 WHERE id = ?1",
                    [row_id],
                )?;
            } else {
                conn.execute(
                    "UPDATE queue_jobs SET status = 'pending', attempts = attempts + 1, available_at = ?2
                     WHERE id = ?1",
                    rusqlite::params![row_id, available_at],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn queue_depth(&self, queue: &str) -> anyhow::Result<i64> {
        let queue = queue.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM queue_jobs WHERE queue = ?1 AND status IN ('pending', 'claimed')",
                [queue],
                |row| row.get(0),
            )
        })
        .await
    }
}

pub fn exponential_backoff(attempt: i64, base: Duration, cap: Duration) -> Duration {
    let factor = 2i64.saturating_pow(attempt.max(0) as u32);
    let millis = (base.num_milliseconds().saturating_mul(factor)).min(cap.num_milliseconds());
    Duration::milliseconds(millis)
}
