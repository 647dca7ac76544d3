//! Sizing, book simulation, guardrail cascade and persistence for one
//! flushed trade group (SPEC_FULL.md §4.7). Grounded on the teacher's
//! `vault/trade_executor.rs::TradeExecutor` (`dry_run`-style
//! simulation-only execution matching the non-goal of no real order
//! submission) and `risk.rs` for the guardrail-result shape.

use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::book::{BookCache, GetBookOptions, PriceLevel};
use crate::db::Store;
use crate::guardrails::{self, GuardrailInput};
use crate::micros::{apply_bps, mul_div, price_from_fill, ratio_bps, shares_from_notional, ONE};
use crate::models::{
    CopyAttempt, Decision, ExecutableFill, FillLevel, LedgerEntry, LedgerEntryType,
    PortfolioScope, ReasonCode, ResolvedConfig, Side, TradeEventGroup,
};

pub struct MarketContext {
    pub blacklisted: bool,
    pub close_time: Option<chrono::DateTime<Utc>>,
}

pub struct Executor {
    store: Store,
    book_cache: BookCache,
}

impl Executor {
    pub fn new(store: Store, book_cache: BookCache) -> Self {
        Executor { store, book_cache }
    }

    pub async fn process_group(
        &self,
        group: &TradeEventGroup,
        cfg: &ResolvedConfig,
        market: &MarketContext,
    ) -> anyhow::Result<CopyAttempt> {
        if self.store.copy_attempt_exists(&group.group_key).await? {
            return self.load_existing(&group.group_key).await;
        }

        let equity = self.read_equity().await?;

        let raw_target = apply_bps(group.total_notional_micros, cfg.sizing.copy_pct_notional_bps);
        let clamped = raw_target
            .max(cfg.sizing.min_trade_notional_micros)
            .min(cfg.sizing.max_trade_notional_micros)
            .min(apply_bps(equity, cfg.sizing.max_trade_bankroll_bps));

        if clamped < cfg.sizing.min_trade_notional_micros {
            return self
                .persist_skip(group, 0, ReasonCode::SizeBelowMin, None)
                .await;
        }
        let target_notional = clamped;

        let get_book_result = self
            .book_cache
            .get_book(&group.token_id, GetBookOptions {
                wait_ms: 300,
                freshness_ms: 2_000,
                no_wait: false,
            })
            .await;

        let Some(book) = get_book_result.book else {
            return self
                .persist_skip(group, target_notional, ReasonCode::BookUnavailable, None)
                .await;
        };

        let mid_price = book.mid_price();

        let (current_total, current_market, current_user) = self.read_exposures(&group.followed_user_id, &group.token_id).await?;
        let (daily_delta, weekly_delta) = self.read_loss_windows().await?;

        let guardrail_input = GuardrailInput {
            side: group.side,
            book: &book,
            their_reference_price_micros: group.vwap_price_micros,
            target_notional_micros: target_notional,
            market_blacklisted: market.blacklisted,
            market_close_time: market.close_time,
            now: Utc::now(),
            current_total_exposure_micros: current_total,
            current_market_exposure_micros: current_market,
            current_user_exposure_micros: current_user,
            equity_micros: equity,
            daily_cash_delta_micros: daily_delta,
            weekly_cash_delta_micros: weekly_delta,
            drawdown_bps: 0,
            cfg: &cfg.guardrails,
        };

        if let Some(reason) = guardrails::evaluate(&guardrail_input) {
            return self
                .persist_skip(group, target_notional, reason, mid_price)
                .await;
        }

        let bound = mid_price
            .map(|mid| guardrails::price_bound(group.side, group.vwap_price_micros, mid, &cfg.guardrails))
            .unwrap_or(group.vwap_price_micros);

        let levels: &[PriceLevel] = match group.side {
            Side::Buy => &book.asks,
            Side::Sell => &book.bids,
        };
        let fills = simulate_fills(group.side, levels, bound, target_notional);

        let filled_shares: i64 = fills.iter().map(|f| f.share_micros).sum();
        let filled_notional: i64 = fills.iter().map(|f| f.notional_micros).sum();
        let filled_ratio_bps = ratio_bps(filled_notional, target_notional.max(1));

        if cfg.guardrails.jitter_ms_max > 0 {
            let jitter_ms = rand::thread_rng().gen_range(0..=cfg.guardrails.jitter_ms_max);
            tokio::time::sleep(std::time::Duration::from_millis(
                cfg.guardrails.decision_latency_ms + jitter_ms,
            ))
            .await;
        } else if cfg.guardrails.decision_latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(cfg.guardrails.decision_latency_ms)).await;
        }

        let attempt_id = Uuid::new_v4().to_string();
        let attempt = CopyAttempt {
            id: attempt_id.clone(),
            portfolio_scope: PortfolioScope::ExecGlobal,
            followed_user_id: Some(group.followed_user_id.clone()),
            group_key: group.group_key.clone(),
            decision: Decision::Execute,
            reason_codes: vec![],
            source_type: group.source_type,
            target_notional_micros: target_notional,
            filled_notional_micros: filled_notional,
            filled_ratio_bps,
            vwap_price_micros: price_from_fill(filled_notional, filled_shares),
            their_reference_price_micros: group.vwap_price_micros,
            mid_price_micros_at_decision: mid_price,
            buffered_trade_count: None,
            created_at: Utc::now(),
        };

        let executable_fills: Vec<ExecutableFill> = fills
            .iter()
            .enumerate()
            .map(|(seq, f)| ExecutableFill {
                id: Uuid::new_v4().to_string(),
                copy_attempt_id: attempt_id.clone(),
                seq: seq as i64,
                price_micros: f.price_micros,
                filled_share_micros: f.share_micros,
                fill_notional_micros: f.notional_micros,
            })
            .collect();

        let (share_delta, cash_delta) = match group.side {
            Side::Buy => (filled_shares, -filled_notional),
            Side::Sell => (-filled_shares, filled_notional),
        };

        let ledger_entries = if filled_shares > 0 {
            vec![LedgerEntry {
                id: Uuid::new_v4().to_string(),
                portfolio_scope: PortfolioScope::ExecGlobal,
                followed_user_id: Some(group.followed_user_id.clone()),
                market_id: None,
                asset_id: Some(group.token_id.clone()),
                entry_type: LedgerEntryType::TradeFill,
                share_delta_micros: share_delta,
                cash_delta_micros: cash_delta,
                price_micros: Some(group.vwap_price_micros),
                ref_id: format!("copy:{attempt_id}"),
                created_at: Utc::now(),
            }]
        } else {
            vec![]
        };

        self.store
            .persist_copy_attempt(&attempt, &executable_fills, &ledger_entries)
            .await?;

        Ok(attempt)
    }

    async fn persist_skip(
        &self,
        group: &TradeEventGroup,
        target_notional: i64,
        reason: ReasonCode,
        mid_price: Option<i64>,
    ) -> anyhow::Result<CopyAttempt> {
        let attempt = CopyAttempt {
            id: Uuid::new_v4().to_string(),
            portfolio_scope: PortfolioScope::ExecGlobal,
            followed_user_id: Some(group.followed_user_id.clone()),
            group_key: group.group_key.clone(),
            decision: Decision::Skip,
            reason_codes: vec![reason],
            source_type: group.source_type,
            target_notional_micros: target_notional,
            filled_notional_micros: 0,
            filled_ratio_bps: 0,
            vwap_price_micros: 0,
            their_reference_price_micros: group.vwap_price_micros,
            mid_price_micros_at_decision: mid_price,
            buffered_trade_count: None,
            created_at: Utc::now(),
        };
        self.store.persist_copy_attempt(&attempt, &[], &[]).await?;
        Ok(attempt)
    }

    async fn load_existing(&self, _group_key: &str) -> anyhow::Result<CopyAttempt> {
        // idempotent re-entry: the row already exists; callers that need
        // the full row should re-query it directly. The executor's
        // queue-driven callers only need to know "already processed".
        Err(anyhow::anyhow!("copy attempt already exists"))
    }

    async fn read_equity(&self) -> anyhow::Result<i64> {
        Ok(self
            .store
            .latest_portfolio_snapshot(PortfolioScope::ExecGlobal.as_str(), None)
            .await?
            .map(|(equity, _, _)| equity)
            .unwrap_or(0))
    }

    async fn read_exposures(&self, _followed_user_id: &str, _token_id: &str) -> anyhow::Result<(i64, i64, i64)> {
        // best-effort: derived from the latest snapshot rather than a live
        // per-market/per-user ledger scan (DESIGN.md Open Question #3).
        let total = self
            .store
            .latest_portfolio_snapshot(PortfolioScope::ExecGlobal.as_str(), None)
            .await?
            .map(|(_, _, exposure)| exposure)
            .unwrap_or(0);
        Ok((total, 0, 0))
    }

    async fn read_loss_windows(&self) -> anyhow::Result<(i64, i64)> {
        let now = Utc::now();
        let daily = self
            .store
            .sum_cash_delta_since(PortfolioScope::ExecGlobal, now - chrono::Duration::days(1))
            .await?;
        let weekly = self
            .store
            .sum_cash_delta_since(PortfolioScope::ExecGlobal, now - chrono::Duration::days(7))
            .await?;
        Ok((daily, weekly))
    }
}

/// Walk book levels consuming *remaining notional budget* — converting to
/// shares at each level's own price — until `target_notional` is spent or
/// the next level crosses `bound` (SPEC_FULL §4.7 step 6). The target is a
/// notional budget, not a share count frozen at the leader's stale
/// reference price: a level priced away from that reference still buys
/// fewer or more shares for the same notional.
fn simulate_fills(side: Side, levels: &[PriceLevel], bound: i64, target_notional: i64) -> Vec<FillLevel> {
    let mut fills = Vec::new();
    let mut remaining_notional = target_notional;
    for level in levels {
        if remaining_notional <= 0 {
            break;
        }
        let crosses = match side {
            Side::Buy => level.price_micros > bound,
            Side::Sell => level.price_micros < bound,
        };
        if crosses {
            break;
        }
        let level_notional = mul_div(level.size_micros, level.price_micros, ONE);
        let take_notional = remaining_notional.min(level_notional);
        let take_shares = shares_from_notional(take_notional, level.price_micros);
        if take_shares <= 0 {
            continue;
        }
        fills.push(FillLevel {
            price_micros: level.price_micros,
            share_micros: take_shares,
            notional_micros: take_notional,
        });
        remaining_notional -= take_notional;
    }
    fills
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulate_fills_stops_at_price_bound() {
        let levels = vec![
            PriceLevel { price_micros: 500_000, size_micros: 1_000_000 },
            PriceLevel { price_micros: 600_000, size_micros: 1_000_000 },
        ];
        let fills = simulate_fills(Side::Buy, &levels, 550_000, 2_000_000);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].share_micros, 1_000_000);
    }

    #[test]
    fn simulate_fills_clamps_ratio_never_over_one() {
        let levels = vec![PriceLevel { price_micros: 500_000, size_micros: 10_000_000 }];
        let fills = simulate_fills(Side::Buy, &levels, 600_000, 500_000);
        let filled: i64 = fills.iter().map(|f| f.share_micros).sum();
        assert_eq!(filled, 1_000_000);
        assert_eq!(ratio_bps(filled, 1_000_000), 10_000);
    }

    /// SPEC_FULL §8 scenario 1 ("Straight copy"): a $1 notional budget
    /// against a single ask level priced away from the leader's stale
    /// reference price fills by notional, not by a share count frozen at
    /// that reference.
    #[test]
    fn simulate_fills_spends_notional_budget_at_live_price() {
        let levels = vec![PriceLevel { price_micros: 510_000, size_micros: 1_000_000_000 }];
        let fills = simulate_fills(Side::Buy, &levels, 510_000, 1_000_000);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].share_micros, 1_960_784);
        let filled_notional: i64 = fills.iter().map(|f| f.notional_micros).sum();
        assert_eq!(filled_notional, 1_000_000);
    }
}
