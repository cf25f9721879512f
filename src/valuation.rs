// ===============================
// src/valuation.rs
// ===============================
//
// Fair-value agent. Exits on held positions run first (take-profit / stop-loss
// against avg entry), then the cheapest symbol vs. its fair value is scored:
//     score = (fair - price) / price
//     score >= +threshold            -> BUY 1   (max score)
//     score <= -threshold and held   -> SELL 1  (min score)
// Stateless across ticks.
//
use std::collections::BTreeMap;

use tracing::info;

use crate::config::Policy;
use crate::domain::{Decision, MarketSnapshot};
use crate::portfolio::PositionInsight;

pub struct ValuationAgent {
    symbols: Vec<String>,
    fair_values: BTreeMap<String, f64>,
    max_shares_per_symbol: i64,
    policy: Policy,
}

/// `None` when the price is unusable.
pub fn fair_value_score(price: f64, fair: f64) -> Option<f64> {
    (price > 0.0).then(|| (fair - price) / price)
}

impl ValuationAgent {
    pub fn new(symbols: Vec<String>, fair_values: BTreeMap<String, f64>, max_shares_per_symbol: i64, policy: Policy) -> Self {
        Self { symbols, fair_values, max_shares_per_symbol, policy }
    }

    fn exit_signal(&self, snap: &MarketSnapshot) -> Option<Decision> {
        let p = &self.policy;
        for symbol in &self.symbols {
            let qty = snap.position(symbol);
            let price = match snap.price(symbol) {
                Some(px) if px > 0.0 && qty > 0 => px,
                _ => continue,
            };
            let insight = PositionInsight::compute(symbol, qty, snap.avg_entry(symbol), price);
            if insight.pnl_pct >= p.take_profit_pct {
                info!(symbol = %symbol, pnl_pct = insight.pnl_pct * 100.0, "take-profit triggered");
                return Some(Decision::sell(symbol, 1, "take profit hit").with_confidence(p.take_profit_conf));
            }
            if insight.pnl_pct <= p.stop_loss_pct {
                info!(symbol = %symbol, pnl_pct = insight.pnl_pct * 100.0, "stop-loss triggered");
                return Some(Decision::sell(symbol, 1, "stop loss hit").with_confidence(p.stop_loss_conf));
            }
        }
        None
    }

    pub fn decide(&self, snap: &MarketSnapshot) -> Decision {
        if let Some(exit) = self.exit_signal(snap) {
            return exit;
        }

        let p = &self.policy;
        // (symbol, score, price, fair)
        let mut best_buy: Option<(&str, f64, f64, f64)> = None;
        let mut best_sell: Option<(&str, f64, f64, f64)> = None;
        for symbol in &self.symbols {
            if snap.position(symbol) >= self.max_shares_per_symbol {
                continue;
            }
            let (Some(price), Some(&fair)) = (snap.price(symbol), self.fair_values.get(symbol)) else {
                continue;
            };
            let Some(score) = fair_value_score(price, fair) else { continue };
            if best_buy.map_or(true, |b| score > b.1) {
                best_buy = Some((symbol, score, price, fair));
            }
            if best_sell.map_or(true, |s| score < s.1) {
                best_sell = Some((symbol, score, price, fair));
            }
        }

        if let Some((symbol, score, price, fair)) = best_buy.filter(|b| b.1 >= p.valuation_threshold) {
            let conf = (p.valuation_buy_base + (score - p.valuation_threshold).max(0.0) * p.valuation_buy_slope)
                .min(p.valuation_buy_cap);
            return Decision::buy(symbol, 1, format!("valuation: score={score:.3}, fair={fair:.2}, price={price:.2}"))
                .with_confidence(conf);
        }
        if let Some((symbol, score, price, fair)) =
            best_sell.filter(|s| s.1 <= -p.valuation_threshold && snap.position(s.0) > 0)
        {
            let conf = (p.valuation_sell_base + (score.abs() - p.valuation_threshold).max(0.0) * p.valuation_sell_slope)
                .min(p.valuation_sell_cap);
            return Decision::sell(symbol, 1, format!("valuation: score={score:.3}, fair={fair:.2}, price={price:.2}"))
                .with_confidence(conf);
        }
        Decision::hold("valuation: no actionable signal").with_confidence(p.valuation_hold_conf)
    }
}
