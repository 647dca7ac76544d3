//! Process-level environment configuration. Mirrors the teacher's
//! `models::Config::from_env` pattern: `dotenv` then `env::var(...)` chains
//! with hard-coded fallback defaults.

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub alchemy_ws_url: String,
    pub polymarket_data_api_base_url: String,
    pub polymarket_clob_base_url: String,
    pub gamma_api_base_url: String,
    pub log_level: String,
    pub node_env: String,
    pub worker_port: u16,
    pub clob_book_ws_enabled: bool,

    /// Accepted for compatibility with the dashboard's deployment env, but
    /// unused: the small-trade buffer and rate-limit gate are backed by the
    /// same SQLite store as the rest of the core (see SPEC_FULL.md §6).
    pub redis_url: Option<String>,

    pub queue_consumers_per_queue: usize,
    pub wallet_refresh_interval_secs: u64,
    pub aggregator_window_ms: i64,
    pub small_trade_flush_interval_ms: u64,
    pub snapshot_interval_secs: u64,
    pub api_poll_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Config {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "copytrade.sqlite3".to_string()),
            alchemy_ws_url: std::env::var("ALCHEMY_WS_URL").unwrap_or_else(|_| String::new()),
            polymarket_data_api_base_url: std::env::var("POLYMARKET_DATA_API_BASE_URL")
                .unwrap_or_else(|_| "https://data-api.polymarket.com".to_string()),
            polymarket_clob_base_url: std::env::var("POLYMARKET_CLOB_BASE_URL")
                .unwrap_or_else(|_| "https://clob.polymarket.com".to_string()),
            gamma_api_base_url: std::env::var("GAMMA_API_BASE_URL")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            node_env: std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string()),
            worker_port: std::env::var("WORKER_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            clob_book_ws_enabled: std::env::var("CLOB_BOOK_WS_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            redis_url: std::env::var("REDIS_URL").ok(),
            queue_consumers_per_queue: std::env::var("QUEUE_CONSUMERS_PER_QUEUE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            wallet_refresh_interval_secs: 60,
            aggregator_window_ms: 250,
            small_trade_flush_interval_ms: 100,
            snapshot_interval_secs: 60,
            api_poll_interval_secs: 5,
        }
    }
}
