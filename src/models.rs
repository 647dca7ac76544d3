//! Core data-model types shared across stages. Persisted shapes live beside
//! their table definitions in `db`; these are the in-process representations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSource {
    OnchainWs,
    PolymarketApi,
}

impl TradeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSource::OnchainWs => "ONCHAIN_WS",
            TradeSource::PolymarketApi => "POLYMARKET_API",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioScope {
    ShadowUser,
    ExecGlobal,
    /// Reserved for future per-leader executable portfolios. No stage
    /// currently constructs or writes this variant (see DESIGN.md Open
    /// Question #2).
    ExecUser,
}

impl PortfolioScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortfolioScope::ShadowUser => "SHADOW_USER",
            PortfolioScope::ExecGlobal => "EXEC_GLOBAL",
            PortfolioScope::ExecUser => "EXEC_USER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryType {
    TradeFill,
    Merge,
    Split,
    Settlement,
}

impl LedgerEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryType::TradeFill => "TRADE_FILL",
            LedgerEntryType::Merge => "MERGE",
            LedgerEntryType::Split => "SPLIT",
            LedgerEntryType::Settlement => "SETTLEMENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    Merge,
    Split,
    Redeem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Execute,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceType {
    Group,
    Buffer,
    Immediate,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Group => "GROUP",
            SourceType::Buffer => "BUFFER",
            SourceType::Immediate => "IMMEDIATE",
        }
    }
}

/// Stable reason codes attached to `CopyAttempt.reason_codes`. Stable across
/// revisions so dashboards/alerts can key off them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReasonCode {
    MarketBlacklisted,
    MarketNearClose,
    SpreadTooWide,
    DepthInsufficient,
    ExposureCapTotal,
    ExposureCapMarket,
    ExposureCapUser,
    CircuitBreakerDaily,
    CircuitBreakerWeekly,
    CircuitBreakerDrawdown,
    SizeBelowMin,
    BookUnavailable,
    BufferFlushBelowMinExec,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::MarketBlacklisted => "MARKET_BLACKLISTED",
            ReasonCode::MarketNearClose => "MARKET_NEAR_CLOSE",
            ReasonCode::SpreadTooWide => "SPREAD_TOO_WIDE",
            ReasonCode::DepthInsufficient => "DEPTH_INSUFFICIENT",
            ReasonCode::ExposureCapTotal => "EXPOSURE_CAP_TOTAL",
            ReasonCode::ExposureCapMarket => "EXPOSURE_CAP_MARKET",
            ReasonCode::ExposureCapUser => "EXPOSURE_CAP_USER",
            ReasonCode::CircuitBreakerDaily => "CIRCUIT_BREAKER_DAILY",
            ReasonCode::CircuitBreakerWeekly => "CIRCUIT_BREAKER_WEEKLY",
            ReasonCode::CircuitBreakerDrawdown => "CIRCUIT_BREAKER_DRAWDOWN",
            ReasonCode::SizeBelowMin => "SIZE_BELOW_MIN",
            ReasonCode::BookUnavailable => "BOOK_UNAVAILABLE",
            ReasonCode::BufferFlushBelowMinExec => "BUFFER_FLUSH_BELOW_MIN_EXEC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowedUser {
    pub id: String,
    pub profile_wallet: String,
    pub label: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowedUserProxyWallet {
    pub wallet: String,
    pub followed_user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub id: String,
    pub source: TradeSource,
    pub source_id: Option<String>,
    pub tx_hash: String,
    pub log_index: Option<i64>,
    pub is_canonical: bool,
    pub profile_wallet: String,
    pub proxy_wallet: Option<String>,
    pub side: Side,
    pub price_micros: i64,
    pub share_micros: i64,
    pub notional_micros: i64,
    pub fee_micros: i64,
    pub event_time: DateTime<Utc>,
    pub detect_time: DateTime<Utc>,
    pub market_id: Option<String>,
    pub asset_id: Option<String>,
    pub raw_token_id: Option<String>,
    pub condition_id: Option<String>,
    pub enrichment_status: EnrichmentStatus,
}

impl TradeEvent {
    /// `rawTokenId ?? assetId` — the identifier used to group fills before
    /// and after metadata enrichment.
    pub fn effective_token_id(&self) -> Option<&str> {
        self.raw_token_id.as_deref().or(self.asset_id.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEventItem {
    pub asset_id: String,
    pub amount_micros: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    pub source_id: String,
    pub activity_type: ActivityType,
    pub profile_wallet: String,
    pub items: Vec<ActivityEventItem>,
    pub collateral_amount_micros: Option<i64>,
    pub event_time: DateTime<Utc>,
    pub detect_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub portfolio_scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub market_id: Option<String>,
    pub asset_id: Option<String>,
    pub entry_type: LedgerEntryType,
    pub share_delta_micros: i64,
    pub cash_delta_micros: i64,
    pub price_micros: Option<i64>,
    pub ref_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyAttempt {
    pub id: String,
    pub portfolio_scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub group_key: String,
    pub decision: Decision,
    pub reason_codes: Vec<ReasonCode>,
    pub source_type: SourceType,
    pub target_notional_micros: i64,
    pub filled_notional_micros: i64,
    pub filled_ratio_bps: i64,
    pub vwap_price_micros: i64,
    pub their_reference_price_micros: i64,
    pub mid_price_micros_at_decision: Option<i64>,
    pub buffered_trade_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutableFill {
    pub id: String,
    pub copy_attempt_id: String,
    pub seq: i64,
    pub price_micros: i64,
    pub filled_share_micros: i64,
    pub fill_notional_micros: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub portfolio_scope: PortfolioScope,
    pub followed_user_id: Option<String>,
    pub bucket_time: DateTime<Utc>,
    pub equity_micros: i64,
    pub cash_micros: i64,
    pub exposure_micros: i64,
    pub realized_pnl_micros: i64,
    pub unrealized_pnl_micros: i64,
}

/// One flushed group of trades ready for the executor, produced either by
/// the time-window aggregator or the small-trade buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEventGroup {
    pub group_key: String,
    pub followed_user_id: String,
    pub token_id: String,
    pub side: Side,
    pub total_notional_micros: i64,
    pub total_share_micros: i64,
    pub vwap_price_micros: i64,
    pub earliest_detect_time: DateTime<Utc>,
    pub trade_event_ids: Vec<String>,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillLevel {
    pub price_micros: i64,
    pub share_micros: i64,
    pub notional_micros: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NettingMode {
    SameSideOnly,
    NetBuySell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub max_worsening_vs_their_fill_micros: i64,
    pub max_over_mid_micros: i64,
    pub max_spread_micros: i64,
    pub min_depth_multiplier_bps: i64,
    pub decision_latency_ms: u64,
    pub jitter_ms_max: u64,
    pub no_new_opens_within_minutes_to_close: i64,
    pub max_total_exposure_bps: i64,
    pub max_exposure_per_market_bps: i64,
    pub max_exposure_per_user_bps: i64,
    pub daily_loss_limit_bps: i64,
    pub weekly_loss_limit_bps: i64,
    pub max_drawdown_limit_bps: i64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        GuardrailConfig {
            max_worsening_vs_their_fill_micros: 10_000,
            max_over_mid_micros: 15_000,
            max_spread_micros: 20_000,
            min_depth_multiplier_bps: 12_500,
            decision_latency_ms: 0,
            jitter_ms_max: 0,
            no_new_opens_within_minutes_to_close: 30,
            max_total_exposure_bps: 7_000,
            max_exposure_per_market_bps: 500,
            max_exposure_per_user_bps: 2_000,
            daily_loss_limit_bps: 300,
            weekly_loss_limit_bps: 800,
            max_drawdown_limit_bps: 1_200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySizingConfig {
    pub copy_pct_notional_bps: i64,
    pub min_trade_notional_micros: i64,
    pub max_trade_notional_micros: i64,
    pub max_trade_bankroll_bps: i64,
}

impl Default for CopySizingConfig {
    fn default() -> Self {
        CopySizingConfig {
            copy_pct_notional_bps: 100,
            min_trade_notional_micros: 5_000_000,
            max_trade_notional_micros: 250_000_000,
            max_trade_bankroll_bps: 75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmallTradeBufferingConfig {
    pub enabled: bool,
    pub notional_threshold_micros: i64,
    pub flush_min_notional_micros: i64,
    pub min_exec_notional_micros: i64,
    pub max_buffer_ms: i64,
    pub quiet_flush_ms: i64,
    pub netting_mode: NettingMode,
}

impl Default for SmallTradeBufferingConfig {
    fn default() -> Self {
        SmallTradeBufferingConfig {
            enabled: false,
            notional_threshold_micros: 250_000,
            flush_min_notional_micros: 500_000,
            min_exec_notional_micros: 100_000,
            max_buffer_ms: 2_500,
            quiet_flush_ms: 600,
            netting_mode: NettingMode::SameSideOnly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub guardrails: GuardrailConfig,
    pub sizing: CopySizingConfig,
    pub buffering: SmallTradeBufferingConfig,
}
