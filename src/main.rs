//! Process bootstrap (SPEC_FULL.md §2.1, §6). Grounded on the teacher's
//! `main.rs`: load env, open the store, spawn each stage as a task, serve
//! `/health` until a shutdown signal arrives.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use copytrade_engine::aggregator::Aggregator;
use copytrade_engine::book::BookCache;
use copytrade_engine::config::Config;
use copytrade_engine::config_resolver::ConfigResolver;
use copytrade_engine::data_api_client::DataApiClient;
use copytrade_engine::db::Store;
use copytrade_engine::executor::{Executor, MarketContext};
use copytrade_engine::gamma_client::GammaClient;
use copytrade_engine::health::{self, HealthState};
use copytrade_engine::ingest::{ApiIngestor, WsIngestor};
use copytrade_engine::micros::apply_bps;
use copytrade_engine::models::{Decision, FollowedUser, ResolvedConfig, TradeEvent, TradeEventGroup};
use copytrade_engine::queue::{self, JobOutcome, COPY_ATTEMPT_GLOBAL, GROUP_EVENTS, INGEST_EVENTS, RECONCILE};
use copytrade_engine::shadow_ledger::ShadowLedger;
use copytrade_engine::shutdown::{self, ShutdownSignal};
use copytrade_engine::small_trade_buffer::{FlushOutcome, SmallTradeBuffer};
use copytrade_engine::wallets::WalletRegistry;

#[tokio::main]
async fn main() {
    let cfg = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(node_env = %cfg.node_env, "starting copytrade engine");

    let store = match Store::open(&cfg.database_url) {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(error = %err, "failed to open store");
            std::process::exit(1);
        }
    };
    if let Err(err) = store.migrate().await {
        tracing::error!(error = %err, "failed to run migrations");
        std::process::exit(1);
    }

    let wallets = Arc::new(WalletRegistry::new());
    if let Err(err) = wallets.refresh_from_store(&store).await {
        tracing::warn!(error = %err, "initial wallet refresh failed, starting with an empty set");
    }

    let clob_ws_url = cfg.polymarket_clob_base_url.replacen("https://", "wss://", 1) + "/ws/market";
    let new_book_cache =
        || BookCache::new(clob_ws_url.clone(), cfg.polymarket_clob_base_url.clone(), cfg.clob_book_ws_enabled);

    let health_state = HealthState::new(store.clone());
    let config_resolver = Arc::new(ConfigResolver::new(store.clone()));
    let shadow_ledger = Arc::new(ShadowLedger::new(store.clone()));
    let gamma_client = Arc::new(GammaClient::new(cfg.gamma_api_base_url.clone(), store.clone()));
    let executor = Arc::new(Executor::new(store.clone(), new_book_cache()));
    let small_trade_buffer = Arc::new(SmallTradeBuffer::new(store.clone()));

    let (shutdown_signal, mut shutdown_rx_main) = ShutdownSignal::new();

    let (flush_tx, mut flush_rx) = mpsc::channel::<TradeEventGroup>(256);
    let aggregator = Arc::new(Aggregator::new(cfg.aggregator_window_ms, flush_tx));

    let mut tasks = Vec::new();

    // WsIngestor: on-chain OrderFilled subscription.
    {
        let ingestor = WsIngestor::new(cfg.alchemy_ws_url.clone(), store.clone(), wallets.clone())
            .with_health(health_state.clone());
        tasks.push(tokio::spawn(ingestor.run()));
    }

    // ApiIngestor: periodic Data API poll + reconciliation.
    {
        let client = DataApiClient::new(cfg.polymarket_data_api_base_url.clone());
        let ingestor = ApiIngestor::new(client, store.clone());
        tasks.push(tokio::spawn(ingestor.run_forever(cfg.api_poll_interval_secs)));
    }

    // Aggregator flush sink: enqueue each completed window as a copyAttemptGlobal job.
    {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(group) = flush_rx.recv().await {
                if let Ok(payload) = serde_json::to_string(&group) {
                    if let Err(err) = store.enqueue(COPY_ATTEMPT_GLOBAL, &group.group_key, &payload).await {
                        tracing::error!(error = %err, group_key = %group.group_key, "failed to enqueue flushed group");
                    }
                }
            }
        }));
    }

    // ingestEvents consumer: shadow-ledger every canonical trade, forward to groupEvents.
    {
        let store = store.clone();
        let shadow_ledger = shadow_ledger.clone();
        let handles = queue::spawn_consumers(store.clone(), INGEST_EVENTS, cfg.queue_consumers_per_queue, move |payload| {
            let store = store.clone();
            let shadow_ledger = shadow_ledger.clone();
            async move { handle_ingest_event(&store, &shadow_ledger, &payload).await }
        });
        tasks.extend(handles);
    }

    // groupEvents consumer: route each canonical trade into the aggregator or the
    // small-trade buffer depending on its notional and the resolved sizing config.
    {
        let store = store.clone();
        let aggregator = aggregator.clone();
        let small_trade_buffer = small_trade_buffer.clone();
        let config_resolver = config_resolver.clone();
        let handles = queue::spawn_consumers(store.clone(), GROUP_EVENTS, cfg.queue_consumers_per_queue, move |payload| {
            let store = store.clone();
            let aggregator = aggregator.clone();
            let small_trade_buffer = small_trade_buffer.clone();
            let config_resolver = config_resolver.clone();
            async move {
                handle_group_event(&store, &aggregator, &small_trade_buffer, &config_resolver, &payload).await
            }
        });
        tasks.extend(handles);
    }

    // copyAttemptGlobal consumer: run the executor on each flushed group.
    {
        let store = store.clone();
        let executor = executor.clone();
        let config_resolver = config_resolver.clone();
        let gamma_client = gamma_client.clone();
        let handles = queue::spawn_consumers(store.clone(), COPY_ATTEMPT_GLOBAL, cfg.queue_consumers_per_queue, move |payload| {
            let store = store.clone();
            let executor = executor.clone();
            let config_resolver = config_resolver.clone();
            let gamma_client = gamma_client.clone();
            async move {
                handle_copy_attempt(&store, &executor, &config_resolver, &gamma_client, &payload).await
            }
        });
        tasks.extend(handles);
    }

    // reconcile consumer: fast-path re-poll of the Data API after a ws reconnect.
    {
        let store = store.clone();
        let base_url = cfg.polymarket_data_api_base_url.clone();
        let handles = queue::spawn_consumers(store.clone(), RECONCILE, 1, move |_payload| {
            let store = store.clone();
            let base_url = base_url.clone();
            async move { handle_reconcile(&store, &base_url).await }
        });
        tasks.extend(handles);
    }

    // Small-trade buffer sweep: scan every bucket on a tick and flush whichever qualify.
    {
        let store = store.clone();
        let small_trade_buffer = small_trade_buffer.clone();
        let config_resolver = config_resolver.clone();
        let interval_ms = cfg.small_trade_flush_interval_ms;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let cfg = match config_resolver.resolve(None).await {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to resolve buffering config");
                        continue;
                    }
                };
                if !cfg.buffering.enabled {
                    continue;
                }
                match small_trade_buffer.scan_and_flush(&cfg.buffering).await {
                    Ok(outcomes) => {
                        for outcome in outcomes {
                            if let Err(err) = dispatch_flush_outcome(&store, outcome).await {
                                tracing::warn!(error = %err, "failed to dispatch small-trade flush outcome");
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "small-trade buffer scan failed"),
                }
            }
        }));
    }

    // PortfolioSnapshotter: periodic equity/exposure/PnL rollup.
    {
        let snapshotter =
            copytrade_engine::portfolio_snapshotter::PortfolioSnapshotter::new(store.clone(), new_book_cache());
        let interval_secs = cfg.snapshot_interval_secs;
        tasks.push(tokio::spawn(async move {
            snapshotter.run_forever(interval_secs).await;
        }));
    }

    // /health over axum, bound until shutdown fires.
    let health_router = health::router(health_state);
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", cfg.worker_port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, port = cfg.worker_port, "failed to bind health listener");
            std::process::exit(1);
        }
    };
    let mut shutdown_rx_http = shutdown_rx_main.clone();
    let http_task = tokio::spawn(async move {
        let serve = axum::serve(listener, health_router).with_graceful_shutdown(async move {
            shutdown_rx_http.wait().await;
        });
        if let Err(err) = serve.await {
            tracing::error!(error = %err, "health server exited with error");
        }
    });

    shutdown::wait_for_os_signal().await;
    tracing::info!("shutdown signal received, draining");
    shutdown_signal.fire();
    shutdown_rx_main.wait().await;

    let grace_period = std::time::Duration::from_secs(10);
    let buffering_cfg = config_resolver
        .resolve(None)
        .await
        .map(|c| c.buffering)
        .unwrap_or_default();
    shutdown::run_shutdown_sequence(&small_trade_buffer, &buffering_cfg, grace_period).await;

    http_task.abort();
    for task in tasks {
        task.abort();
    }
    tracing::info!("shutdown complete");
}

async fn handle_ingest_event(store: &Store, shadow_ledger: &ShadowLedger, payload: &str) -> JobOutcome {
    let Ok(envelope) = serde_json::from_str::<IngestEnvelope>(payload) else {
        return JobOutcome::DeadLetter;
    };
    let trade = match store.load_trade_event(&envelope.trade_event_id).await {
        Ok(Some(trade)) => trade,
        Ok(None) => return JobOutcome::DeadLetter,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load trade event");
            return JobOutcome::Retry;
        }
    };

    if let Err(err) = shadow_ledger.record_trade(&trade).await {
        tracing::warn!(error = %err, "shadow ledger record failed");
        return JobOutcome::Retry;
    }

    let payload = serde_json::json!({ "tradeEventId": trade.id }).to_string();
    match store.enqueue(GROUP_EVENTS, &trade.id, &payload).await {
        Ok(()) => JobOutcome::Ack,
        Err(err) => {
            tracing::warn!(error = %err, "failed to enqueue group event");
            JobOutcome::Retry
        }
    }
}

async fn handle_group_event(
    store: &Store,
    aggregator: &Aggregator,
    small_trade_buffer: &SmallTradeBuffer,
    config_resolver: &ConfigResolver,
    payload: &str,
) -> JobOutcome {
    let Ok(envelope) = serde_json::from_str::<GroupEnvelope>(payload) else {
        return JobOutcome::DeadLetter;
    };
    let trade = match store.load_trade_event(&envelope.trade_event_id).await {
        Ok(Some(trade)) => trade,
        Ok(None) => return JobOutcome::DeadLetter,
        Err(err) => {
            tracing::warn!(error = %err, "failed to load trade event");
            return JobOutcome::Retry;
        }
    };
    let Some(token_id) = trade.effective_token_id().map(str::to_string) else {
        return JobOutcome::DeadLetter;
    };

    let resolved = match config_resolver.resolve(Some(&trade.profile_wallet)).await {
        Ok(resolved) => resolved,
        Err(err) => {
            tracing::warn!(error = %err, "failed to resolve config");
            return JobOutcome::Retry;
        }
    };

    let routed = route_group_event(store, aggregator, small_trade_buffer, &trade, &token_id, &resolved).await;

    match routed {
        Ok(()) => JobOutcome::Ack,
        Err(err) => {
            tracing::warn!(error = %err, "failed to route group event");
            JobOutcome::Retry
        }
    }
}

/// SPEC_FULL §4.5: engaged when the sizing pre-estimate (`rawCopy`), not the
/// raw trade notional, is below the buffering threshold. Below threshold,
/// flush any existing opposite-side bucket first (`sameSideOnly` mode) then
/// append. At or above threshold, take the immediate path: merge into an
/// existing bucket and flush it, or emit a single-member `IMMEDIATE` group.
/// Buffering disabled entirely routes every trade through the time-window
/// aggregator (§4.4).
async fn route_group_event(
    store: &Store,
    aggregator: &Aggregator,
    small_trade_buffer: &SmallTradeBuffer,
    trade: &TradeEvent,
    token_id: &str,
    resolved: &ResolvedConfig,
) -> anyhow::Result<()> {
    if !resolved.buffering.enabled {
        aggregator.add_trade(trade);
        return Ok(());
    }

    let raw_copy = apply_bps(trade.notional_micros, resolved.sizing.copy_pct_notional_bps);
    if raw_copy < resolved.buffering.notional_threshold_micros {
        if let Some(opposite_key) = small_trade_buffer
            .opposite_bucket_key(&trade.profile_wallet, token_id, trade.side, &resolved.buffering)
            .await
        {
            if let Some(outcome) = small_trade_buffer.flush_if_present(&opposite_key, &resolved.buffering).await? {
                dispatch_flush_outcome(store, outcome).await?;
            }
        }
        return small_trade_buffer.append(trade, token_id, &resolved.buffering).await;
    }

    let outcome = small_trade_buffer.immediate(trade, token_id, &resolved.buffering).await?;
    dispatch_flush_outcome(store, outcome).await
}

async fn handle_copy_attempt(
    store: &Store,
    executor: &Executor,
    config_resolver: &ConfigResolver,
    gamma_client: &GammaClient,
    payload: &str,
) -> JobOutcome {
    let Ok(group) = serde_json::from_str::<TradeEventGroup>(payload) else {
        return JobOutcome::DeadLetter;
    };

    match store.copy_attempt_exists(&group.group_key).await {
        Ok(true) => return JobOutcome::Ack,
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(error = %err, "failed to check copy attempt idempotency");
            return JobOutcome::Retry;
        }
    }

    let resolved = match config_resolver.resolve(Some(&group.followed_user_id)).await {
        Ok(resolved) => resolved,
        Err(err) => {
            tracing::warn!(error = %err, "failed to resolve config");
            return JobOutcome::Retry;
        }
    };

    let blacklist_key = format!("market:blacklist:{}", group.token_id);
    let blacklisted = matches!(store.get_checkpoint(&blacklist_key).await, Ok(Some(_)));
    let close_time = gamma_client
        .lookup_by_token_id(&group.token_id)
        .await
        .ok()
        .flatten()
        .map(|m| m.close_time);
    let market = MarketContext { blacklisted, close_time };

    match executor.process_group(&group, &resolved, &market).await {
        Ok(attempt) => {
            if attempt.decision == Decision::Execute {
                tracing::info!(group_key = %group.group_key, "copy attempt executed");
            }
            JobOutcome::Ack
        }
        Err(err) => {
            tracing::warn!(error = %err, group_key = %group.group_key, "executor failed");
            JobOutcome::Retry
        }
    }
}

async fn handle_reconcile(store: &Store, data_api_base_url: &str) -> JobOutcome {
    let client = DataApiClient::new(data_api_base_url.to_string());
    let ingestor = ApiIngestor::new(client, store.clone());
    let users: Vec<FollowedUser> = match store.list_followed_users().await {
        Ok(users) => users,
        Err(err) => {
            tracing::warn!(error = %err, "reconcile: failed to list followed users");
            return JobOutcome::Retry;
        }
    };
    for user in users.into_iter().filter(|u| u.enabled) {
        if let Err(err) = ingestor.poll_once(&user, true).await {
            tracing::warn!(error = %err, user = %user.id, "reconcile poll failed");
        }
    }
    JobOutcome::Ack
}

async fn dispatch_flush_outcome(store: &Store, outcome: FlushOutcome) -> anyhow::Result<()> {
    match outcome {
        FlushOutcome::Group(group) => {
            let payload = serde_json::to_string(&group)?;
            store.enqueue(COPY_ATTEMPT_GLOBAL, &group.group_key, &payload).await
        }
        FlushOutcome::BelowMinExec { followed_user_id, buffered_trade_count, group_key } => {
            let (decision, reason_codes) = FlushOutcome::below_min_exec_decision();
            let attempt = copytrade_engine::models::CopyAttempt {
                id: uuid::Uuid::new_v4().to_string(),
                portfolio_scope: copytrade_engine::models::PortfolioScope::ExecGlobal,
                followed_user_id: Some(followed_user_id),
                group_key,
                decision,
                reason_codes,
                source_type: copytrade_engine::models::SourceType::Buffer,
                target_notional_micros: 0,
                filled_notional_micros: 0,
                filled_ratio_bps: 0,
                vwap_price_micros: 0,
                their_reference_price_micros: 0,
                mid_price_micros_at_decision: None,
                buffered_trade_count: Some(buffered_trade_count),
                created_at: Utc::now(),
            };
            store.persist_copy_attempt(&attempt, &[], &[]).await
        }
    }
}

#[derive(serde::Deserialize)]
struct IngestEnvelope {
    #[serde(rename = "tradeEventId")]
    trade_event_id: String,
}

#[derive(serde::Deserialize)]
struct GroupEnvelope {
    #[serde(rename = "tradeEventId")]
    trade_event_id: String,
}
