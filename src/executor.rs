// ===============================
// src/executor.rs (final decision -> at most one order)
// ===============================
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::ExecutorLimits;
use crate::domain::{
    Action, AdjustCause, Decision, ExecReport, ExecStatus, MarketSnapshot, QtyAdjustment, Side, SkipReason,
};
use crate::engine::StopFlag;
use crate::metrics::{EXECS, ORDERS};
use crate::portfolio::{portfolio_value, PortfolioState};
use crate::rate_limiter::RateLimiter;

pub const SUBMIT_KEY: &str = "executor:submit_order";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    DryRun,
    Live,
}

impl ExecMode {
    pub fn from_flag(execute: bool) -> Self {
        if execute { ExecMode::Live } else { ExecMode::DryRun }
    }
    pub fn as_str(&self) -> &'static str {
        match self { ExecMode::DryRun => "dry_run", ExecMode::Live => "live" }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastBuy {
    at: DateTime<Utc>,
    price: f64,
}

pub struct TradeExecutor {
    mode: ExecMode,
    limiter: Arc<RateLimiter>,
    stop: StopFlag,
    last_buys: HashMap<String, LastBuy>,
}

/// Shares affordable under the per-symbol exposure cap, before clamping.
/// `max_position_percent` is a percent (20.0 == 20%).
pub fn position_cap_shares(snap: &MarketSnapshot, symbol: &str, price: f64, max_position_percent: f64) -> i64 {
    if price <= 0.0 {
        return 0;
    }
    let total = portfolio_value(snap);
    let allowed = max_position_percent / 100.0 * total;
    let current = snap.position(symbol) as f64 * price;
    ((allowed - current) / price).floor().max(0.0) as i64
}

impl TradeExecutor {
    pub fn new(mode: ExecMode, limiter: Arc<RateLimiter>, stop: StopFlag) -> Self {
        Self { mode, limiter, stop, last_buys: HashMap::new() }
    }

    pub fn mode(&self) -> ExecMode { self.mode }

    pub fn reset(&mut self) {
        self.last_buys.clear();
    }

    fn report(&self, snap: &MarketSnapshot, d: &Decision, qty: i64, status: ExecStatus) -> ExecReport {
        ExecReport {
            ts: snap.timestamp(),
            symbol: d.symbol.clone(),
            side: d.action.side(),
            qty,
            status,
            adjustments: Vec::new(),
            cooldown_bypassed: false,
        }
    }

    fn finish(&self, rep: ExecReport) -> ExecReport {
        EXECS.with_label_values(&[rep.label()]).inc();
        rep
    }

    fn skip(&self, mut rep: ExecReport, reason: SkipReason) -> ExecReport {
        info!("SKIP: {reason}");
        rep.status = ExecStatus::Skipped(reason);
        self.finish(rep)
    }

    /// Buy cooldown check. `Ok(bypassed)` when execution may continue.
    fn buy_cooldown(&self, symbol: &str, price: f64, now: DateTime<Utc>, limits: &ExecutorLimits) -> Result<bool, SkipReason> {
        let Some(last) = self.last_buys.get(symbol) else { return Ok(false) };
        let elapsed = (now - last.at).num_milliseconds() as f64 / 1000.0;
        if elapsed >= limits.buy_cooldown_seconds as f64 {
            return Ok(false);
        }
        let moved_pct = if last.price > 0.0 { (price - last.price).abs() / last.price * 100.0 } else { f64::INFINITY };
        if moved_pct >= limits.price_move_bypass_pct {
            info!("BYPASS: cooldown bypassed due to price move for {symbol}");
            Ok(true)
        } else {
            Err(SkipReason::BuyCooldown(symbol.to_string()))
        }
    }

    pub async fn execute<B: Broker>(
        &mut self,
        broker: &B,
        snap: &MarketSnapshot,
        decision: &Decision,
        limits: &ExecutorLimits,
        portfolio: &mut PortfolioState,
    ) -> ExecReport {
        let mut rep = self.report(snap, decision, decision.qty, ExecStatus::Hold);

        // 1) hold / malformed
        if decision.action == Action::Hold {
            info!(at = %snap.timestamp().to_rfc3339(), reason = %decision.reason, "HOLD");
            return self.finish(rep);
        }
        let (Some(symbol), Some(side)) = (decision.symbol.clone(), decision.action.side()) else {
            return self.skip(rep, SkipReason::InvalidPayload);
        };
        if symbol.is_empty() || decision.qty <= 0 {
            return self.skip(rep, SkipReason::InvalidPayload);
        }
        let mut qty = decision.qty;

        // 2) duplicate pending order; an unanswerable query does not block
        if limits.enable_open_order_guard {
            match broker.has_open_order(&symbol, side).await {
                Ok(true) => return self.skip(rep, SkipReason::DuplicatePendingOrder { symbol, side }),
                Ok(false) => {}
                Err(e) => warn!(symbol = %symbol, error = %e, "open-order lookup failed, guard skipped"),
            }
        }

        let price = snap.price(&symbol).unwrap_or(0.0);
        match side {
            // 3) nothing to sell
            Side::Sell => {
                if snap.position(&symbol) <= 0 {
                    return self.skip(rep, SkipReason::NoPosition(symbol));
                }
            }
            // 4) buy guards + sizing
            Side::Buy => {
                if price <= 0.0 {
                    return self.skip(rep, SkipReason::NonPositivePrice(symbol));
                }
                if let Some(mins) = portfolio.minutes_since_sell(&symbol, snap.timestamp()) {
                    if mins < limits.sell_cooldown_minutes as f64 {
                        return self.skip(rep, SkipReason::SellCooldown { symbol, minutes_since_sell: mins });
                    }
                }
                match self.buy_cooldown(&symbol, price, snap.timestamp(), limits) {
                    Ok(bypassed) => rep.cooldown_bypassed = bypassed,
                    Err(reason) => return self.skip(rep, reason),
                }

                let cap = position_cap_shares(snap, &symbol, price, limits.max_position_percent);
                if cap < 1 {
                    return self.skip(rep, SkipReason::PositionCap(symbol));
                }
                if qty > cap {
                    let adj = QtyAdjustment { from: qty, to: cap, cause: AdjustCause::PositionCap };
                    info!("{}", adj.log_line(&symbol));
                    rep.adjustments.push(adj);
                    qty = cap;
                }
            }
        }

        // 5) per-trade clamp
        if qty > limits.max_shares_per_trade {
            let to = limits.max_shares_per_trade;
            let adj = QtyAdjustment { from: qty, to, cause: AdjustCause::MaxSharesPerTrade };
            info!("{}", adj.log_line(&symbol));
            rep.adjustments.push(adj);
            qty = to;
        }
        rep.qty = qty;

        // 6) dry-run
        if self.mode == ExecMode::DryRun {
            info!("DRY-RUN: would {side} {qty} of {symbol} ({})", decision.reason);
            if side == Side::Buy {
                self.last_buys.insert(symbol, LastBuy { at: snap.timestamp(), price });
            }
            rep.status = ExecStatus::DryRun;
            return self.finish(rep);
        }

        // 7) live submit, never retried here
        if self.limiter.acquire(SUBMIT_KEY, &self.stop).await.is_err() {
            return self.skip(rep, SkipReason::Cancelled);
        }
        match broker.place_order(&symbol, side, qty).await {
            Ok(handle) => {
                info!("ORDER SENT: id={}, status={}", handle.id, handle.status);
                ORDERS.with_label_values(&[side.as_str()]).inc();
                match side {
                    Side::Buy => {
                        self.last_buys.insert(symbol, LastBuy { at: snap.timestamp(), price });
                    }
                    // 8) sell-cooldown bookkeeping
                    Side::Sell => {
                        portfolio.record_sell_fill(&symbol, handle.filled_at.unwrap_or_else(|| snap.timestamp()));
                    }
                }
                rep.status = ExecStatus::Submitted(handle);
            }
            Err(e) => {
                error!(symbol = %symbol, %side, qty, error = %e, "order submission failed");
                rep.status = ExecStatus::Rejected(e.to_string());
            }
        }
        self.finish(rep)
    }
}
