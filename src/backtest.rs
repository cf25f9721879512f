// ===============================
// src/backtest.rs
// ===============================
//
// Replays session timestamps through the decision pipeline against a local
// paper book. Orders never reach the broker; it is only asked for history.
//
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use tracing::info;

use crate::broker::{Broker, BrokerError};
use crate::config::{BacktestCfg, Settings};
use crate::domain::{Action, BacktestSummary, MarketSnapshot, Side};
use crate::pipeline::DecisionPipeline;
use crate::portfolio::{PaperBook, PortfolioState};

fn base_price(symbol: &str) -> f64 {
    match symbol {
        "PLTR" => 95.0,
        "NFLX" => 190.0,
        "PLTK" => 18.0,
        _ => 50.0,
    }
}

/// Deterministic wave: a daily and a five-day cycle around the base price.
pub fn synthetic_price(symbol: &str, ts: DateTime<Utc>) -> f64 {
    let bucket = ts.timestamp().div_euclid(60);
    let intraday = (bucket.rem_euclid(1440)) as f64 / 1440.0 - 0.5;
    let weekly = (bucket.rem_euclid(7200)) as f64 / 7200.0 - 0.5;
    let px = base_price(symbol) * (1.0 + 0.03 * intraday + 0.02 * weekly);
    (px.max(1.0) * 100.0).round() / 100.0
}

fn trading_days(start: NaiveDate, days: u32) -> Vec<NaiveDate> {
    let mut out = Vec::with_capacity(days as usize);
    let mut d = start;
    while out.len() < days as usize {
        if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            out.push(d);
        }
        d += Duration::days(1);
    }
    out
}

/// 14:30..=21:00 UTC at `step_min` spacing for each trading day.
pub fn session_timestamps(start: NaiveDate, days: u32, step_min: u32) -> Vec<DateTime<Utc>> {
    let open = NaiveTime::from_hms_opt(14, 30, 0).unwrap_or_default();
    let close = NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default();
    let step = Duration::minutes(step_min.max(1) as i64);

    let mut out = Vec::new();
    for day in trading_days(start, days.max(1)) {
        let end = Utc.from_utc_datetime(&day.and_time(close));
        let mut ts = Utc.from_utc_datetime(&day.and_time(open));
        while ts <= end {
            out.push(ts);
            ts += step;
        }
    }
    out
}

pub async fn run_backtest<B: Broker>(
    broker: &B,
    settings: &Settings,
    cfg: &BacktestCfg,
) -> Result<BacktestSummary, BrokerError> {
    let symbols = &settings.symbols;
    let mut pipeline = DecisionPipeline::from_settings(settings);
    let mut portfolio = PortfolioState::new();
    let mut book = PaperBook::new(cfg.initial_cash, symbols);
    let (mut buys, mut sells) = (0u64, 0u64);
    let mut last_prices = BTreeMap::new();

    let stamps = session_timestamps(cfg.start, cfg.days, cfg.step_min);
    info!(
        start = %cfg.start,
        days = cfg.days,
        step_min = cfg.step_min,
        symbols = ?symbols,
        initial_cash = cfg.initial_cash,
        "[backtest] starting simulation"
    );

    for ts in &stamps {
        let mut prices = BTreeMap::new();
        for sym in symbols {
            let px = match broker.historical_close(sym, *ts).await? {
                Some(px) => px,
                None => synthetic_price(sym, *ts),
            };
            prices.insert(sym.clone(), px);
        }
        last_prices = prices.clone();

        let snap = MarketSnapshot::new(*ts, prices, book.cash, book.positions.clone())
            .with_avg_entry_prices(book.avg_entry.clone());
        let out = pipeline.run(&snap, Some(true), &portfolio);
        let d = &out.final_decision;

        match (d.action, d.symbol.as_deref()) {
            (Action::Hold, _) => info!("[backtest] HOLD"),
            (_, None) => info!(action = %d.action, "[backtest] SKIP: no symbol"),
            (action, Some(sym)) => {
                let side = if action == Action::Buy { Side::Buy } else { Side::Sell };
                let px = snap.price(sym).unwrap_or(0.0);
                match book.apply_fill(sym, side, 1, px) {
                    Ok(()) => {
                        match side {
                            Side::Buy => buys += 1,
                            Side::Sell => {
                                sells += 1;
                                portfolio.record_sell_fill(sym, *ts);
                            }
                        }
                        info!("[backtest] FILL {side} {sym} qty=1 at {px:.2}; cash={:.2}", book.cash);
                    }
                    Err(e) => info!("[backtest] SKIP {side} {sym}: {e}"),
                }
            }
        }
        info!(
            ts = %ts.to_rfc3339(),
            value = book.equity(snap.prices()),
            cash = book.cash,
            "[backtest] mark"
        );
    }

    let end_value = book.equity(&last_prices);
    let summary = BacktestSummary {
        start_cash: cfg.initial_cash,
        end_value,
        pnl: end_value - cfg.initial_cash,
        num_buys: buys,
        num_sells: sells,
        final_positions: book.positions.clone(),
        steps: stamps.len(),
    };
    info!(
        start_cash = summary.start_cash,
        end_value = summary.end_value,
        pnl = summary.pnl,
        buys,
        sells,
        positions = ?summary.final_positions,
        steps = summary.steps,
        "[backtest] summary"
    );
    Ok(summary)
}
