// ===============================
// src/risk.rs
// ===============================
use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{Action, Decision, MarketSnapshot, RiskResult};
use crate::metrics::RISK_VETOES;

/// Hard veto reasons. `Display` is the reason carried by the VETO result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RiskVeto {
    #[error("market closed")]
    MarketClosed,
    #[error("symbol not allowed")]
    SymbolNotAllowed,
    #[error("position limit reached")]
    PositionLimit,
    #[error("insufficient cash")]
    InsufficientCash,
}

impl RiskVeto {
    pub fn label(&self) -> &'static str {
        match self {
            RiskVeto::MarketClosed => "market_closed",
            RiskVeto::SymbolNotAllowed => "symbol_not_allowed",
            RiskVeto::PositionLimit => "position_limit",
            RiskVeto::InsufficientCash => "insufficient_cash",
        }
    }

    /// Values accepted by RISK_FORCE_VETO; anything else is ignored.
    pub fn parse_forced(raw: &str) -> Option<RiskVeto> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "market_closed" => Some(RiskVeto::MarketClosed),
            "symbol_not_allowed" => Some(RiskVeto::SymbolNotAllowed),
            "insufficient_cash" => Some(RiskVeto::InsufficientCash),
            other => {
                if !other.is_empty() {
                    warn!(value = other, "unknown RISK_FORCE_VETO, ignored");
                }
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskGate {
    pub allowlist: BTreeSet<String>,
    pub max_shares_per_symbol: i64,
    pub forced_veto: Option<RiskVeto>,
    pub approve_confidence: f64,
}

impl RiskGate {
    pub fn new(allowlist: BTreeSet<String>, max_shares_per_symbol: i64, approve_confidence: f64) -> Self {
        Self { allowlist, max_shares_per_symbol, forced_veto: None, approve_confidence }
    }

    pub fn with_forced_veto(mut self, veto: Option<RiskVeto>) -> Self {
        self.forced_veto = veto;
        self
    }

    /// Ordered veto rules, first match wins. `market_open = None` means the
    /// broker could not tell, so the exchange calendar decides.
    pub fn check(
        &self,
        snapshot: &MarketSnapshot,
        market: &Decision,
        valuation: &Decision,
        market_open: Option<bool>,
    ) -> Result<(), RiskVeto> {
        if let Some(v) = &self.forced_veto {
            return Err(v.clone());
        }

        let open = market_open.unwrap_or_else(|| is_regular_session(snapshot.timestamp()));
        if !open {
            return Err(RiskVeto::MarketClosed);
        }

        let proposed = if valuation.is_actionable() { valuation } else { market };
        let Some(symbol) = proposed.symbol.as_deref() else {
            return Ok(());
        };
        if !self.allowlist.contains(symbol) {
            return Err(RiskVeto::SymbolNotAllowed);
        }

        if proposed.action == Action::Buy {
            if snapshot.position(symbol) >= self.max_shares_per_symbol {
                return Err(RiskVeto::PositionLimit);
            }
            match snapshot.price(symbol) {
                Some(px) if px > 0.0 && snapshot.cash() >= px => {}
                _ => return Err(RiskVeto::InsufficientCash),
            }
        }
        Ok(())
    }

    pub fn evaluate(
        &self,
        snapshot: &MarketSnapshot,
        market: &Decision,
        valuation: &Decision,
        market_open: Option<bool>,
    ) -> RiskResult {
        match self.check(snapshot, market, valuation, market_open) {
            Ok(()) => {
                debug!("risk approved");
                RiskResult::approve(self.approve_confidence)
            }
            Err(v) => {
                RISK_VETOES.with_label_values(&[v.label()]).inc();
                RiskResult::veto(v.to_string())
            }
        }
    }
}

// ---- exchange calendar (NYSE regular hours, US Eastern with DST) ----

fn nth_sunday_utc(year: i32, month: u32, n: u8, utc_hour: u32) -> Option<DateTime<Utc>> {
    let day = NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Sun, n)?;
    Some(Utc.from_utc_datetime(&day.and_hms_opt(utc_hour, 0, 0)?))
}

/// Seconds New York lags UTC at `ts`. DST runs from the 2nd Sunday of March
/// 02:00 EST to the 1st Sunday of November 02:00 EDT.
pub fn new_york_lag_secs(ts: DateTime<Utc>) -> i64 {
    let year = ts.year();
    match (nth_sunday_utc(year, 3, 2, 7), nth_sunday_utc(year, 11, 1, 6)) {
        (Some(start), Some(end)) if ts >= start && ts < end => 4 * 3600,
        _ => 5 * 3600,
    }
}

pub fn new_york_local(ts: DateTime<Utc>) -> NaiveDateTime {
    ts.naive_utc() - Duration::seconds(new_york_lag_secs(ts))
}

/// Mon-Fri 09:30-16:00 New York time, both ends inclusive. Holidays are not modelled.
pub fn is_regular_session(ts: DateTime<Utc>) -> bool {
    let local = new_york_local(ts);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let t = local.time();
    match (NaiveTime::from_hms_opt(9, 30, 0), NaiveTime::from_hms_opt(16, 0, 0)) {
        (Some(open), Some(close)) => open <= t && t <= close,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    // 2025-06-11 is a Wednesday; 15:00 UTC is 11:00 EDT.
    fn open_ts() -> DateTime<Utc> { Utc.with_ymd_and_hms(2025, 6, 11, 15, 0, 0).unwrap() }

    fn snap(cash: f64, price: f64, qty: i64) -> MarketSnapshot {
        MarketSnapshot::new(
            open_ts(),
            BTreeMap::from([("PLTR".to_string(), price)]),
            cash,
            BTreeMap::from([("PLTR".to_string(), qty)]),
        )
    }

    fn gate() -> RiskGate {
        RiskGate::new(BTreeSet::from(["PLTR".to_string()]), 5, 0.7)
    }

    #[test]
    fn approves_affordable_buy() {
        let r = gate().evaluate(&snap(1000.0, 50.0, 0), &Decision::hold("x"), &Decision::buy("PLTR", 1, "v"), Some(true));
        assert!(!r.is_veto());
        assert_eq!(r.reason, "checks passed");
        assert!((r.confidence - 0.7).abs() < 1e-12);
    }

    #[test]
    fn market_closed_wins_over_everything_else() {
        let g = gate();
        let s = snap(0.0, 50.0, 9);
        let v = g.check(&s, &Decision::hold("x"), &Decision::buy("NOPE", 1, "v"), Some(false));
        assert_eq!(v, Err(RiskVeto::MarketClosed));
    }

    #[test]
    fn unknown_flag_falls_back_to_calendar() {
        let g = gate();
        let weekend = MarketSnapshot::new(
            Utc.with_ymd_and_hms(2025, 6, 14, 15, 0, 0).unwrap(),
            BTreeMap::new(),
            1000.0,
            BTreeMap::new(),
        );
        assert_eq!(g.check(&weekend, &Decision::hold("x"), &Decision::hold("y"), None), Err(RiskVeto::MarketClosed));
        assert_eq!(g.check(&snap(1000.0, 50.0, 0), &Decision::hold("x"), &Decision::hold("y"), None), Ok(()));
    }

    #[test]
    fn valuation_symbol_preferred_over_market() {
        let g = gate();
        let s = snap(1000.0, 50.0, 0);
        let market = Decision::buy("PLTR", 1, "m");
        let val = Decision::sell("NFLX", 1, "v");
        assert_eq!(g.check(&s, &market, &val, Some(true)), Err(RiskVeto::SymbolNotAllowed));
        // non-actionable valuation falls through to the market proposal
        assert_eq!(g.check(&s, &market, &Decision::hold("v"), Some(true)), Ok(()));
    }

    #[test]
    fn buy_caps_and_cash() {
        let g = gate();
        let buy = Decision::buy("PLTR", 1, "v");
        let h = Decision::hold("m");
        assert_eq!(g.check(&snap(1000.0, 50.0, 5), &h, &buy, Some(true)), Err(RiskVeto::PositionLimit));
        assert_eq!(g.check(&snap(10.0, 50.0, 0), &h, &buy, Some(true)), Err(RiskVeto::InsufficientCash));
        assert_eq!(g.check(&snap(1000.0, 0.0, 0), &h, &buy, Some(true)), Err(RiskVeto::InsufficientCash));
        // sells are not cash-checked
        assert_eq!(g.check(&snap(0.0, 50.0, 5), &h, &Decision::sell("PLTR", 1, "v"), Some(true)), Ok(()));
    }

    #[test]
    fn forced_veto_short_circuits() {
        let g = gate().with_forced_veto(Some(RiskVeto::InsufficientCash));
        let r = g.evaluate(&snap(1000.0, 50.0, 0), &Decision::hold("m"), &Decision::hold("v"), Some(true));
        assert!(r.is_veto());
        assert_eq!(r.reason, "insufficient cash");
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn parse_forced_accepts_known_values_only() {
        assert_eq!(RiskVeto::parse_forced(" Market_Closed "), Some(RiskVeto::MarketClosed));
        assert_eq!(RiskVeto::parse_forced("position_limit"), None);
        assert_eq!(RiskVeto::parse_forced(""), None);
    }

    #[test]
    fn session_bounds_respect_dst() {
        // winter: 14:30 UTC == 09:30 EST
        assert!(is_regular_session(Utc.with_ymd_and_hms(2025, 1, 15, 14, 30, 0).unwrap()));
        assert!(!is_regular_session(Utc.with_ymd_and_hms(2025, 1, 15, 14, 29, 0).unwrap()));
        assert!(is_regular_session(Utc.with_ymd_and_hms(2025, 1, 15, 21, 0, 0).unwrap()));
        // summer: 13:30 UTC == 09:30 EDT, 20:01 UTC is after close
        assert!(is_regular_session(Utc.with_ymd_and_hms(2025, 7, 15, 13, 30, 0).unwrap()));
        assert!(!is_regular_session(Utc.with_ymd_and_hms(2025, 7, 15, 20, 1, 0).unwrap()));
        // 2025-03-09 is the switch day
        assert_eq!(new_york_lag_secs(Utc.with_ymd_and_hms(2025, 3, 9, 6, 59, 0).unwrap()), 5 * 3600);
        assert_eq!(new_york_lag_secs(Utc.with_ymd_and_hms(2025, 3, 9, 7, 0, 0).unwrap()), 4 * 3600);
    }
}
