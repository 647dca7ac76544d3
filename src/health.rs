//! `GET /health` (SPEC_FULL.md §6). The only HTTP server surface the core
//! owns. Grounded on the teacher's `api/health.rs::health_handler` shape:
//! a single axum route over shared `Arc` state, degrading rather than
//! failing outright when a non-DB dependency is unhealthy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::db::Store;
use crate::queue::{COPY_ATTEMPT_GLOBAL, GROUP_EVENTS, INGEST_EVENTS, RECONCILE};

pub struct HealthState {
    store: Store,
    ws_connected: AtomicBool,
    last_canonical_event_time: RwLock<Option<DateTime<Utc>>>,
}

impl HealthState {
    pub fn new(store: Store) -> Arc<Self> {
        Arc::new(HealthState {
            store,
            ws_connected: AtomicBool::new(false),
            last_canonical_event_time: RwLock::new(None),
        })
    }

    pub fn set_ws_connected(&self, connected: bool) {
        self.ws_connected.store(connected, Ordering::Relaxed);
    }

    pub fn note_canonical_event(&self, at: DateTime<Utc>) {
        let mut slot = self.last_canonical_event_time.write();
        if slot.map(|existing| at > existing).unwrap_or(true) {
            *slot = Some(at);
        }
    }
}

#[derive(Serialize)]
struct QueueDepths {
    #[serde(rename = "ingestEvents")]
    ingest_events: i64,
    #[serde(rename = "groupEvents")]
    group_events: i64,
    /// Always 0: `PortfolioScope::ExecUser` is reserved but unwritten, so no
    /// stage enqueues per-user copy attempts separately from the global queue.
    #[serde(rename = "copyAttemptUser")]
    copy_attempt_user: i64,
    #[serde(rename = "copyAttemptGlobal")]
    copy_attempt_global: i64,
    reconcile: i64,
    /// Always 0: price ticks are pulled on demand through `BookCache`, not
    /// queued as jobs.
    prices: i64,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: DateTime<Utc>,
    #[serde(rename = "lastCanonicalEventTime")]
    last_canonical_event_time: Option<DateTime<Utc>>,
    #[serde(rename = "wsConnected")]
    ws_connected: bool,
    #[serde(rename = "queueDepths")]
    queue_depths: QueueDepths,
    #[serde(rename = "dbConnected")]
    db_connected: bool,
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new().route("/health", get(health_handler)).with_state(state)
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let db_connected = state.store.get_checkpoint("health:probe").await.is_ok();

    let queue_depths = QueueDepths {
        ingest_events: state.store.queue_depth(INGEST_EVENTS).await.unwrap_or(-1),
        group_events: state.store.queue_depth(GROUP_EVENTS).await.unwrap_or(-1),
        copy_attempt_user: 0,
        copy_attempt_global: state.store.queue_depth(COPY_ATTEMPT_GLOBAL).await.unwrap_or(-1),
        reconcile: state.store.queue_depth(RECONCILE).await.unwrap_or(-1),
        prices: 0,
    };

    let ws_connected = state.ws_connected.load(Ordering::Relaxed);
    let status = if !db_connected {
        "unhealthy"
    } else if !ws_connected {
        "degraded"
    } else {
        "ok"
    };

    let status_code = if db_connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    let body = HealthBody {
        status,
        timestamp: Utc::now(),
        last_canonical_event_time: *state.last_canonical_event_time.read(),
        ws_connected,
        queue_depths,
        db_connected,
    };

    (status_code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn degrades_when_ws_disconnected_but_db_ok() {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path().to_str().unwrap()).unwrap();
        store.migrate().await.unwrap();
        std::mem::forget(file);

        let state = HealthState::new(store);
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
