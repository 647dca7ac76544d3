//! Named queues and the generic N-consumer worker loop (SPEC_FULL.md §4.10).
//! Thin wrapper over `db::queue`'s primitives: this module owns queue naming
//! and the claim/ack/retry loop shape, grounded on the teacher's
//! `workers/mod.rs` consumer-pool spawn pattern (N tasks per named queue,
//! each polling with a backoff sleep when idle).

use std::future::Future;
use std::sync::Arc;

use chrono::Duration;

use crate::db::{exponential_backoff, Store};

pub const INGEST_EVENTS: &str = "ingestEvents";
pub const GROUP_EVENTS: &str = "groupEvents";
pub const COPY_ATTEMPT_GLOBAL: &str = "copyAttemptGlobal";
pub const RECONCILE: &str = "reconcile";

const MAX_ATTEMPTS: i64 = 8;
const BASE_BACKOFF_MS: i64 = 500;
const MAX_BACKOFF_MS: i64 = 60_000;
const IDLE_POLL_MS: u64 = 250;

/// Outcome a handler reports for a claimed job.
pub enum JobOutcome {
    Ack,
    Retry,
    /// A terminal failure: skip straight to the dead-letter partition.
    DeadLetter,
}

/// Spawn `consumers` worker tasks polling `queue`. Each task loops:
/// claim → run `handler` → ack/retry/dead-letter → sleep if idle.
pub fn spawn_consumers<F, Fut>(
    store: Store,
    queue: &'static str,
    consumers: usize,
    handler: F,
) -> Vec<tokio::task::JoinHandle<()>>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    let handler = Arc::new(handler);
    (0..consumers)
        .map(|_| {
            let store = store.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer_loop(store, queue, handler).await })
        })
        .collect()
}

async fn consumer_loop<F, Fut>(store: Store, queue: &'static str, handler: Arc<F>)
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = JobOutcome>,
{
    loop {
        let claimed = match store.claim_next(queue).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(std::time::Duration::from_millis(IDLE_POLL_MS)).await;
                continue;
            }
            Err(err) => {
                tracing::warn!(queue, error = %err, "queue claim failed");
                tokio::time::sleep(std::time::Duration::from_millis(IDLE_POLL_MS)).await;
                continue;
            }
        };

        let outcome = handler(claimed.payload_json.clone()).await;
        let result = match outcome {
            JobOutcome::Ack => store.ack(claimed.row_id).await,
            JobOutcome::Retry => {
                let backoff = exponential_backoff(
                    claimed.attempts,
                    Duration::milliseconds(BASE_BACKOFF_MS),
                    Duration::milliseconds(MAX_BACKOFF_MS),
                );
                store.retry_or_dead_letter(claimed.row_id, MAX_ATTEMPTS, backoff).await
            }
            JobOutcome::DeadLetter => {
                store.retry_or_dead_letter(claimed.row_id, 0, Duration::zero()).await
            }
        };
        if let Err(err) = result {
            tracing::error!(queue, job_id = %claimed.job_id, error = %err, "failed to finalize queue job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn consumer_acks_a_claimed_job() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        store.migrate().await.unwrap();
        std::mem::forget(file);

        store.enqueue(INGEST_EVENTS, "job-1", "{}").await.unwrap();
        assert_eq!(store.queue_depth(INGEST_EVENTS).await.unwrap(), 1);

        let handles = spawn_consumers(store.clone(), INGEST_EVENTS, 1, |_payload| async { JobOutcome::Ack });

        let depth = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if store.queue_depth(INGEST_EVENTS).await.unwrap() == 0 {
                    return 0;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(depth, 0);

        for h in handles {
            h.abort();
        }
    }
}
