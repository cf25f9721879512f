// ===============================
// src/domain.rs
// ===============================
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> i64 { match self { Side::Buy => 1, Side::Sell => -1 } }
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "BUY", Side::Sell => "SELL" } }
    /// Lower-case wire form used by broker APIs.
    pub fn wire(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
    pub fn parse(raw: &str) -> Option<Side> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }
}
impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action { Buy, Sell, Hold }
impl Action {
    pub fn side(&self) -> Option<Side> {
        match self { Action::Buy => Some(Side::Buy), Action::Sell => Some(Side::Sell), Action::Hold => None }
    }
    pub fn as_str(&self) -> &'static str {
        match self { Action::Buy => "BUY", Action::Sell => "SELL", Action::Hold => "HOLD" }
    }
}
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() { return Decision::DEFAULT_CONFIDENCE; }
    value.clamp(0.0, 1.0)
}

/// One agent's (or the coordinator's) verdict for a tick.
///
/// `symbol` is set iff the action is BUY/SELL and `qty` is 0 iff HOLD; the
/// constructors are the only way the pipeline builds one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub symbol: Option<String>,
    pub qty: i64,
    pub reason: String,
    pub confidence: f64,
}

impl Decision {
    pub const DEFAULT_CONFIDENCE: f64 = 0.5;

    pub fn hold(reason: impl Into<String>) -> Self {
        Self { action: Action::Hold, symbol: None, qty: 0, reason: reason.into(), confidence: Self::DEFAULT_CONFIDENCE }
    }
    pub fn buy(symbol: &str, qty: i64, reason: impl Into<String>) -> Self {
        Self { action: Action::Buy, symbol: Some(normalize_symbol(symbol)), qty, reason: reason.into(), confidence: Self::DEFAULT_CONFIDENCE }
    }
    pub fn sell(symbol: &str, qty: i64, reason: impl Into<String>) -> Self {
        Self { action: Action::Sell, symbol: Some(normalize_symbol(symbol)), qty, reason: reason.into(), confidence: Self::DEFAULT_CONFIDENCE }
    }
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }
    pub fn is_actionable(&self) -> bool {
        matches!(self.action, Action::Buy | Action::Sell)
    }
    /// `ACTION:reason`, the form embedded verbatim in coordinator audit trails.
    pub fn audit(&self) -> String {
        format!("{}:{}", self.action, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskStatus { Approve, Veto }
impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { RiskStatus::Approve => "APPROVE", RiskStatus::Veto => "VETO" })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskResult {
    pub status: RiskStatus,
    pub reason: String,
    pub confidence: f64,
}

impl RiskResult {
    pub fn approve(confidence: f64) -> Self {
        Self { status: RiskStatus::Approve, reason: "checks passed".to_string(), confidence: clamp_confidence(confidence) }
    }
    pub fn veto(reason: impl Into<String>) -> Self {
        Self { status: RiskStatus::Veto, reason: reason.into(), confidence: 1.0 }
    }
    pub fn is_veto(&self) -> bool { self.status == RiskStatus::Veto }
}

/// Immutable per-tick view of the account and market. Built once, then only
/// lent out by reference for the rest of the tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSnapshot {
    timestamp: DateTime<Utc>,
    prices: BTreeMap<String, f64>,
    cash: f64,
    positions: BTreeMap<String, i64>,
    avg_entry_prices: BTreeMap<String, f64>,
}

impl MarketSnapshot {
    pub fn new(
        timestamp: DateTime<Utc>,
        prices: BTreeMap<String, f64>,
        cash: f64,
        positions: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            timestamp,
            prices: prices.into_iter().map(|(k, v)| (normalize_symbol(&k), v)).collect(),
            cash,
            positions: positions.into_iter().map(|(k, v)| (normalize_symbol(&k), v)).collect(),
            avg_entry_prices: BTreeMap::new(),
        }
    }

    pub fn with_avg_entry_prices(mut self, avg: BTreeMap<String, f64>) -> Self {
        self.avg_entry_prices = avg.into_iter().map(|(k, v)| (normalize_symbol(&k), v)).collect();
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> { self.timestamp }
    pub fn cash(&self) -> f64 { self.cash }
    pub fn prices(&self) -> &BTreeMap<String, f64> { &self.prices }
    pub fn positions(&self) -> &BTreeMap<String, i64> { &self.positions }
    pub fn avg_entry_prices(&self) -> &BTreeMap<String, f64> { &self.avg_entry_prices }

    pub fn price(&self, symbol: &str) -> Option<f64> { self.prices.get(symbol).copied() }
    pub fn position(&self, symbol: &str) -> i64 { self.positions.get(symbol).copied().unwrap_or(0) }
    /// 0.0 when flat or unknown.
    pub fn avg_entry(&self, symbol: &str) -> f64 { self.avg_entry_prices.get(symbol).copied().unwrap_or(0.0) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder { pub symbol: String, pub side: Side }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHandle {
    pub id: String,
    pub status: String,
    pub filled_at: Option<DateTime<Utc>>,
}

// Executor outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum SkipReason {
    #[error("invalid action payload")]
    InvalidPayload,
    #[error("open order exists for {symbol} {side}")]
    DuplicatePendingOrder { symbol: String, side: Side },
    #[error("no position available to SELL for {0}")]
    NoPosition(String),
    #[error("non-positive price for {0}")]
    NonPositivePrice(String),
    #[error("COOLDOWN BUY blocked symbol={symbol} minutes_since_sell={minutes_since_sell:.1}")]
    SellCooldown { symbol: String, minutes_since_sell: f64 },
    #[error("BUY cooldown active for {0} (no significant price move)")]
    BuyCooldown(String),
    #[error("position cap reached for {0}")]
    PositionCap(String),
    #[error("stop requested before submission")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecStatus {
    Hold,
    Skipped(SkipReason),
    DryRun,
    Submitted(OrderHandle),
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustCause { PositionCap, MaxSharesPerTrade }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QtyAdjustment { pub from: i64, pub to: i64, pub cause: AdjustCause }

impl fmt::Display for AdjustCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdjustCause::PositionCap => "position cap",
            AdjustCause::MaxSharesPerTrade => "max shares per trade",
        })
    }
}

impl QtyAdjustment {
    /// The executor's ADJUST log line.
    pub fn log_line(&self, symbol: &str) -> String {
        format!("ADJUST: qty reduced from {} to {} for {symbol} due to {}", self.from, self.to, self.cause)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecReport {
    pub ts: DateTime<Utc>,
    pub symbol: Option<String>,
    pub side: Option<Side>,
    pub qty: i64,
    pub status: ExecStatus,
    pub adjustments: Vec<QtyAdjustment>,
    pub cooldown_bypassed: bool,
}

impl ExecReport {
    pub fn label(&self) -> &'static str {
        match &self.status {
            ExecStatus::Hold => "hold",
            ExecStatus::Skipped(_) => "skipped",
            ExecStatus::DryRun => "dry_run",
            ExecStatus::Submitted(_) => "submitted",
            ExecStatus::Rejected(_) => "rejected",
        }
    }
}

// Journal records
#[derive(Debug, Clone, Serialize)]
pub struct TickRecord {
    pub ts: DateTime<Utc>,
    pub iteration: u64,
    pub market: Decision,
    pub valuation: Decision,
    pub risk: RiskResult,
    pub final_decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioMark {
    pub ts: DateTime<Utc>,
    pub cash: f64,
    pub equity: f64,
    pub unrealized_pnl: f64,
    pub positions: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub start_cash: f64,
    pub end_value: f64,
    pub pnl: f64,
    pub num_buys: u64,
    pub num_sells: u64,
    pub final_positions: BTreeMap<String, i64>,
    pub steps: usize,
}

#[derive(Debug, Clone, Serialize)]
pub enum Event { Tick(TickRecord), Exec(ExecReport), Portfolio(PortfolioMark), Backtest(BacktestSummary), Note(String) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_log_line_wording() {
        let cap = QtyAdjustment { from: 5, to: 2, cause: AdjustCause::PositionCap };
        assert_eq!(cap.log_line("PLTR"), "ADJUST: qty reduced from 5 to 2 for PLTR due to position cap");
        let clamp = QtyAdjustment { from: 9, to: 3, cause: AdjustCause::MaxSharesPerTrade };
        assert_eq!(clamp.log_line("PLTR"), "ADJUST: qty reduced from 9 to 3 for PLTR due to max shares per trade");
    }

    #[test]
    fn snapshot_normalizes_symbols_and_defaults_missing_entries() {
        let snap = MarketSnapshot::new(
            Utc::now(),
            BTreeMap::from([("pltr".to_string(), 50.0)]),
            1000.0,
            BTreeMap::from([(" pltr ".to_string(), 2)]),
        );
        assert_eq!(snap.price("PLTR"), Some(50.0));
        assert_eq!(snap.position("PLTR"), 2);
        assert_eq!(snap.position("NFLX"), 0);
        assert_eq!(snap.avg_entry("PLTR"), 0.0);
    }

    #[test]
    fn decisions_default_to_half_confidence_and_clamp() {
        let d = Decision::hold("nothing");
        assert_eq!(d.confidence, 0.5);
        assert_eq!(d.qty, 0);
        assert!(d.symbol.is_none());
        let b = Decision::buy("pltr", 1, "cheap").with_confidence(1.7);
        assert_eq!(b.symbol.as_deref(), Some("PLTR"));
        assert_eq!(b.confidence, 1.0);
        assert_eq!(b.audit(), "BUY:cheap");
    }

    #[test]
    fn veto_carries_full_confidence() {
        let r = RiskResult::veto("market closed");
        assert!(r.is_veto());
        assert_eq!(r.confidence, 1.0);
        assert_eq!(RiskResult::approve(0.7).reason, "checks passed");
    }

    #[test]
    fn skip_reasons_render_log_messages() {
        let s = SkipReason::DuplicatePendingOrder { symbol: "PLTR".into(), side: Side::Buy };
        assert_eq!(s.to_string(), "open order exists for PLTR BUY");
        assert_eq!(
            SkipReason::NoPosition("PLTK".into()).to_string(),
            "no position available to SELL for PLTK"
        );
    }
}
