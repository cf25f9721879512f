// ===============================
// src/portfolio.rs (sell-cooldown state, PnL helpers, paper book)
// ===============================
use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::domain::{normalize_symbol, MarketSnapshot, Side};

/// Process-wide state written only by confirmed SELL fills and read by the
/// re-entry guards before any BUY.
#[derive(Debug, Default, Clone)]
pub struct PortfolioState {
    last_sell_ts: HashMap<String, DateTime<Utc>>,
}

impl PortfolioState {
    pub fn new() -> Self { Self::default() }

    pub fn record_sell_fill(&mut self, symbol: &str, fill_ts: DateTime<Utc>) {
        self.last_sell_ts.insert(normalize_symbol(symbol), fill_ts);
    }

    pub fn last_sell_ts(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.last_sell_ts.get(&normalize_symbol(symbol)).copied()
    }

    pub fn minutes_since_sell(&self, symbol: &str, now: DateTime<Utc>) -> Option<f64> {
        self.last_sell_ts(symbol)
            .map(|ts| (now - ts).num_milliseconds() as f64 / 60_000.0)
    }

    /// True while fewer than `cooldown_min` minutes have passed since the last sell.
    pub fn in_sell_cooldown(&self, symbol: &str, now: DateTime<Utc>, cooldown_min: i64) -> bool {
        match self.minutes_since_sell(symbol, now) {
            Some(elapsed) => elapsed < cooldown_min as f64,
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.last_sell_ts.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionInsight {
    pub symbol: String,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub pnl_pct: f64,
}

impl PositionInsight {
    /// pnl_pct is 0 when flat or when the entry price is unknown.
    pub fn compute(symbol: &str, qty: i64, avg_entry_price: f64, current_price: f64) -> Self {
        let pnl_pct = if qty <= 0 || avg_entry_price <= 0.0 {
            0.0
        } else {
            (current_price - avg_entry_price) / avg_entry_price
        };
        Self {
            symbol: normalize_symbol(symbol),
            avg_entry_price: avg_entry_price.max(0.0),
            current_price,
            pnl_pct,
        }
    }
}

/// Cash plus every position marked at the snapshot price (unpriced positions count 0).
pub fn portfolio_value(snapshot: &MarketSnapshot) -> f64 {
    snapshot.cash()
        + snapshot
            .positions()
            .iter()
            .map(|(sym, qty)| *qty as f64 * snapshot.price(sym).unwrap_or(0.0))
            .sum::<f64>()
}

pub fn unrealized_pnl(snapshot: &MarketSnapshot) -> f64 {
    snapshot
        .positions()
        .iter()
        .filter(|(_, qty)| **qty > 0)
        .map(|(sym, qty)| {
            let avg = snapshot.avg_entry(sym);
            let px = snapshot.price(sym).unwrap_or(0.0);
            if avg > 0.0 { (px - avg) * *qty as f64 } else { 0.0 }
        })
        .sum()
}

#[derive(Debug, Error, PartialEq)]
pub enum BookError {
    #[error("qty must be > 0")]
    InvalidQty,
    #[error("insufficient cash (cash={cash:.2}, cost={cost:.2})")]
    InsufficientCash { cash: f64, cost: f64 },
    #[error("insufficient position (held={held}, qty={qty})")]
    InsufficientPosition { held: i64, qty: i64 },
}

/// Long-only simulated account used by the mock broker and the backtest.
#[derive(Debug, Clone, Default)]
pub struct PaperBook {
    pub cash: f64,
    pub positions: BTreeMap<String, i64>,
    pub avg_entry: BTreeMap<String, f64>,
    pub realized_pnl: f64,
}

impl PaperBook {
    pub fn new(cash: f64, symbols: &[String]) -> Self {
        Self {
            cash,
            positions: symbols.iter().map(|s| (normalize_symbol(s), 0)).collect(),
            avg_entry: symbols.iter().map(|s| (normalize_symbol(s), 0.0)).collect(),
            realized_pnl: 0.0,
        }
    }

    pub fn apply_fill(&mut self, symbol: &str, side: Side, qty: i64, price: f64) -> Result<(), BookError> {
        if qty <= 0 {
            return Err(BookError::InvalidQty);
        }
        let symbol = normalize_symbol(symbol);
        let held = self.positions.get(&symbol).copied().unwrap_or(0);
        let avg = self.avg_entry.get(&symbol).copied().unwrap_or(0.0);
        let notional = price * qty as f64;

        match side {
            Side::Buy => {
                if notional > self.cash {
                    return Err(BookError::InsufficientCash { cash: self.cash, cost: notional });
                }
                let new_qty = held + qty;
                self.cash -= notional;
                self.avg_entry.insert(symbol.clone(), (avg * held as f64 + notional) / new_qty as f64);
                self.positions.insert(symbol, new_qty);
            }
            Side::Sell => {
                if qty > held {
                    return Err(BookError::InsufficientPosition { held, qty });
                }
                let new_qty = held - qty;
                self.cash += notional;
                self.realized_pnl += (price - avg) * qty as f64;
                self.positions.insert(symbol.clone(), new_qty);
                if new_qty == 0 {
                    self.avg_entry.insert(symbol, 0.0);
                }
            }
        }
        Ok(())
    }

    pub fn equity(&self, prices: &BTreeMap<String, f64>) -> f64 {
        self.cash
            + self
                .positions
                .iter()
                .map(|(s, q)| *q as f64 * prices.get(s).copied().unwrap_or(0.0))
                .sum::<f64>()
    }
}
