// ===============================
// tests/test_trading_loop.rs
// ===============================
mod common;

use std::collections::HashMap;
use std::sync::Arc;

use agent_trader::broker::BrokerError;
use agent_trader::broker_mock::MockBroker;
use agent_trader::config::{ExecutorLimits, Settings};
use agent_trader::domain::{Action, Event, ExecStatus};
use agent_trader::engine::{StopFlag, TradingLoop};
use agent_trader::metrics::JOURNAL_DROPS;
use agent_trader::rate_limiter::RateLimiter;
use common::RecordingBroker;
use tokio::sync::mpsc;

fn settings(pairs: &[(&str, &str)]) -> Settings {
    let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Settings::from_vars(&|k: &str| vars.get(k).cloned())
}

fn trading_loop<B: agent_trader::broker::Broker>(broker: B, s: &Settings, stop: StopFlag) -> TradingLoop<B> {
    let limiter = Arc::new(RateLimiter::new(s.rates.clone()));
    TradingLoop::new(broker, s, limiter, stop).with_limits(ExecutorLimits::default)
}

#[tokio::test]
async fn one_iteration_against_mock_dry_run() {
    let s = settings(&[("MOCK_MARKET_OPEN", "1"), ("RATE_PER_SECOND", "100")]);
    let broker = MockBroker::new(&s.mock);
    broker.set_price("PLTR", 50.0).unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let mut tl = trading_loop(broker, &s, StopFlag::new()).with_recorder(tx);

    let out = tl.run_iteration(1).await.unwrap();
    assert!(out.tick.single_snapshot);
    assert_eq!(out.tick.final_decision.action, Action::Buy);
    assert_eq!(out.exec.status, ExecStatus::DryRun);

    let mark = out.mark.unwrap();
    assert_eq!(mark.cash, 100_000.0);
    assert_eq!(mark.positions["PLTR"], 0);

    assert!(matches!(rx.recv().await, Some(Event::Tick(_))));
    assert!(matches!(rx.recv().await, Some(Event::Exec(_))));
    assert!(matches!(rx.recv().await, Some(Event::Portfolio(_))));
}

#[tokio::test]
async fn full_journal_channel_drops_events_without_failing_the_tick() {
    let s = settings(&[("MOCK_MARKET_OPEN", "1"), ("RATE_PER_SECOND", "100")]);
    let broker = MockBroker::new(&s.mock);
    let (tx, mut rx) = mpsc::channel(1);
    let mut tl = trading_loop(broker, &s, StopFlag::new()).with_recorder(tx);
    let before = JOURNAL_DROPS.get();

    assert!(tl.run_iteration(1).await.is_ok());
    assert!(JOURNAL_DROPS.get() >= before + 2);
    assert!(matches!(rx.recv().await, Some(Event::Tick(_))));
}

#[tokio::test]
async fn live_iteration_fills_on_mock() {
    let s = settings(&[("MOCK_MARKET_OPEN", "1"), ("EXECUTE", "1"), ("RATE_PER_SECOND", "100")]);
    let broker = MockBroker::new(&s.mock);
    broker.set_price("PLTR", 50.0).unwrap();
    let mut tl = trading_loop(broker, &s, StopFlag::new());

    let out = tl.run_iteration(1).await.unwrap();
    assert!(matches!(out.exec.status, ExecStatus::Submitted(ref h) if h.status == "filled"));
    let mark = out.mark.unwrap();
    assert_eq!(mark.positions["PLTR"], 1);
    assert_eq!(mark.cash, 99_950.0);
    assert_eq!(mark.unrealized_pnl, 0.0);
}

#[tokio::test]
async fn closed_market_holds() {
    let s = settings(&[("MOCK_MARKET_OPEN", "0"), ("RATE_PER_SECOND", "100")]);
    let broker = MockBroker::new(&s.mock);
    broker.set_price("PLTR", 50.0).unwrap();
    let mut tl = trading_loop(broker, &s, StopFlag::new());

    let out = tl.run_iteration(1).await.unwrap();
    assert_eq!(out.tick.risk.reason, "market closed");
    assert_eq!(out.exec.status, ExecStatus::Hold);
}

#[tokio::test]
async fn price_failure_fails_only_the_iteration() {
    let s = settings(&[("SYMBOLS", "PLTR,NFLX"), ("RATE_PER_SECOND", "100")]);
    let broker = RecordingBroker::new(1000.0, &[("PLTR", 50.0)]);
    let mut tl = trading_loop(broker, &s, StopFlag::new());

    let err = tl.run_iteration(1).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnsupportedSymbol(ref s) if s == "NFLX"));
    assert!(tl.broker().orders().is_empty());
}

#[tokio::test]
async fn run_stops_after_max_iterations() {
    let s = settings(&[
        ("MOCK_MARKET_OPEN", "1"),
        ("MAX_ITERATIONS", "3"),
        ("LOOP_INTERVAL_SEC", "0"),
        ("RATE_PER_SECOND", "1000"),
    ]);
    let mut tl = trading_loop(MockBroker::new(&s.mock), &s, StopFlag::new());
    assert_eq!(tl.run().await, 3);
}

#[tokio::test]
async fn run_keeps_going_after_failed_iterations() {
    let s = settings(&[
        ("SYMBOLS", "TSLA"),
        ("MAX_ITERATIONS", "2"),
        ("LOOP_INTERVAL_SEC", "0"),
        ("RATE_PER_SECOND", "1000"),
    ]);
    let mut tl = trading_loop(RecordingBroker::new(1000.0, &[]), &s, StopFlag::new());
    assert_eq!(tl.run().await, 2);
}

#[tokio::test]
async fn triggered_stop_prevents_any_iteration() {
    let s = settings(&[("MOCK_MARKET_OPEN", "1")]);
    let stop = StopFlag::new();
    stop.trigger();
    let mut tl = trading_loop(MockBroker::new(&s.mock), &s, stop);
    assert_eq!(tl.run().await, 0);
}

#[tokio::test]
async fn stop_during_wait_ends_the_loop() {
    let s = settings(&[("MOCK_MARKET_OPEN", "1"), ("LOOP_INTERVAL_SEC", "60"), ("RATE_PER_SECOND", "100")]);
    let stop = StopFlag::new();
    let mut tl = trading_loop(MockBroker::new(&s.mock), &s, stop.clone());

    let trigger = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        stop.trigger();
    });
    let n = tokio::time::timeout(std::time::Duration::from_secs(5), tl.run()).await.unwrap();
    assert_eq!(n, 1);
    trigger.await.unwrap();
}
