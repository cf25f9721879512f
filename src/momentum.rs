// ===============================
// src/momentum.rs
// ===============================
//
// Tick-over-tick momentum across the snapshot's priced symbols.
// Idea: the symbol with the largest % move since the previous tick wins.
//        move >= +threshold           -> BUY 1
//        move <= -threshold and held  -> SELL 1
//        otherwise                    -> HOLD
// State: last seen price per symbol, owned by the agent and kept across ticks.
//
use ahash::AHashMap as HashMap;
use tracing::debug;

use crate::config::Policy;
use crate::domain::{Decision, MarketSnapshot};

pub struct MomentumState {
    last_price: HashMap<String, f64>,
    threshold: f64,
    base_conf: f64,
    conf_slope: f64,
    conf_cap: f64,
    neutral_floor: f64,
    neutral_ceiling: f64,
    no_signal_conf: f64,
}

impl MomentumState {
    pub fn new(policy: &Policy) -> Self {
        Self {
            last_price: HashMap::new(),
            threshold: policy.momentum_threshold,
            base_conf: policy.momentum_base_conf,
            conf_slope: policy.momentum_conf_slope,
            conf_cap: policy.momentum_conf_cap,
            neutral_floor: policy.momentum_neutral_floor,
            neutral_ceiling: policy.momentum_neutral_ceiling,
            no_signal_conf: policy.momentum_no_signal_conf,
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_price.get(symbol).copied()
    }

    pub fn reset(&mut self) {
        self.last_price.clear();
    }

    /// Prices iterate in symbol order, so the first symbol reaching the max wins ties.
    /// Non-positive prices are ignored and do not overwrite the stored price.
    pub fn on_tick(&mut self, snap: &MarketSnapshot) -> Decision {
        let mut best: Option<(&str, f64)> = None;
        for (symbol, &price) in snap.prices() {
            if price <= 0.0 {
                continue;
            }
            if let Some(prev) = self.last_price.get(symbol.as_str()).copied().filter(|p| *p > 0.0) {
                let change = (price - prev) / prev;
                if best.map_or(true, |(_, b)| change > b) {
                    best = Some((symbol.as_str(), change));
                }
            }
            self.last_price.insert(symbol.clone(), price);
        }

        let Some((symbol, change)) = best else {
            return Decision::hold("market: no momentum signal").with_confidence(self.no_signal_conf);
        };
        debug!(symbol, change, "momentum leader");

        let conf = (self.base_conf + change.abs() * self.conf_slope).min(self.conf_cap);
        if change >= self.threshold {
            return Decision::buy(symbol, 1, format!("market: momentum up {:.2}%", change * 100.0))
                .with_confidence(conf);
        }
        if change <= -self.threshold && snap.position(symbol) > 0 {
            return Decision::sell(symbol, 1, format!("market: momentum down {:.2}%", change.abs() * 100.0))
                .with_confidence(conf);
        }
        Decision::hold("market: momentum neutral")
            .with_confidence(conf.clamp(self.neutral_floor, self.neutral_ceiling))
    }
}
