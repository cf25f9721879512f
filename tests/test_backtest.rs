// ===============================
// tests/test_backtest.rs
// ===============================
mod common;

use std::collections::HashMap;

use agent_trader::backtest::run_backtest;
use agent_trader::broker_mock::MockBroker;
use agent_trader::config::{BacktestCfg, Settings};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use common::RecordingBroker;

fn settings(pairs: &[(&str, &str)]) -> Settings {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Settings::from_vars(&|k: &str| vars.get(k).cloned())
}

fn cfg(days: u32) -> BacktestCfg {
    BacktestCfg {
        // Monday
        start: NaiveDate::from_ymd_opt(2024, 1, 8).unwrap(),
        days,
        step_min: 60,
        initial_cash: 100_000.0,
    }
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 8, hour, 30, 0).unwrap()
}

#[tokio::test]
async fn cheap_symbol_accumulates_up_to_share_cap() {
    let s = settings(&[("FAIR_VALUES", "PLTR:120")]);
    let broker = MockBroker::new(&s.mock);

    let sum = run_backtest(&broker, &s, &cfg(2)).await.unwrap();

    assert_eq!(sum.steps, 14);
    assert_eq!(sum.num_buys, 5);
    assert_eq!(sum.num_sells, 0);
    assert_eq!(sum.final_positions.get("PLTR"), Some(&5));
    assert_eq!(sum.final_positions.get("NFLX").copied().unwrap_or(0), 0);
    assert_eq!(sum.start_cash, 100_000.0);
    assert!((sum.pnl - (sum.end_value - sum.start_cash)).abs() < 1e-9);
}

#[tokio::test]
async fn share_cap_setting_bounds_backtest_buys() {
    let s = settings(&[("FAIR_VALUES", "PLTR:120"), ("RISK_MAX_SHARES", "2")]);
    let broker = MockBroker::new(&s.mock);

    let sum = run_backtest(&broker, &s, &cfg(2)).await.unwrap();

    assert_eq!(sum.num_buys, 2);
    assert_eq!(sum.final_positions.get("PLTR"), Some(&2));
}

#[tokio::test]
async fn take_profit_sells_then_reentry_is_demoted() {
    let s = settings(&[("SYMBOLS", "PLTR"), ("FAIR_VALUES", "PLTR:130"), ("RISK_MAX_SHARES", "1")]);
    // 14:30 buy at 100, 15:30 take profit at 106, 16:30 still cheap but
    // inside the sell cooldown, then rich for the rest of the session
    let broker = RecordingBroker::new(0.0, &[]).with_history(
        "PLTR",
        &[(at(14), 100.0), (at(15), 106.0), (at(16), 106.0), (at(17), 140.0)],
    );

    let sum = run_backtest(&broker, &s, &cfg(1)).await.unwrap();

    assert_eq!(sum.steps, 7);
    assert_eq!(sum.num_buys, 1);
    assert_eq!(sum.num_sells, 1);
    assert_eq!(sum.final_positions.get("PLTR"), Some(&0));
    assert!((sum.end_value - 100_006.0).abs() < 1e-9);
    assert!((sum.pnl - 6.0).abs() < 1e-9);
    // the backtest never routes orders through the broker
    assert!(broker.orders().is_empty());
}
