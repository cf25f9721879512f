// ===============================
// src/main.rs
// ===============================
/*
 # one dry-run tick against the mock broker
 cargo run -- --once

 # what the process is configured for
 curl -s localhost:9898/metrics | egrep '^config_(run_mode|execute|symbol)'

 # decisions and executor outcomes
 curl -s localhost:9898/metrics | egrep '^(final_decisions|exec_reports|risk_vetoes)_total'
*/
/*
=============================================================================
Project : agent_trader — risk-gated multi-agent trading loop in Rust
Module  : main.rs
Version : 0.3.0
License : MIT (see LICENSE)

Summary : Polls a broker (mock or Alpaca paper) once per tick, merges a
          momentum and a fair-value signal under a hard risk veto, and
          executes at most one rate-limited order per tick with position
          caps, cooldowns and duplicate-order guards.
=============================================================================
*/
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use agent_trader::backtest::run_backtest;
use agent_trader::broker::Broker;
use agent_trader::broker_alpaca::AlpacaBroker;
use agent_trader::broker_mock::MockBroker;
use agent_trader::config::{self, Cli, RunMode, Settings};
use agent_trader::domain::Event;
use agent_trader::engine::{StopFlag, TradingLoop};
use agent_trader::executor::ExecMode;
use agent_trader::metrics;
use agent_trader::rate_limiter::RateLimiter;
use agent_trader::recorder;

async fn drive<B: Broker>(
    broker: B,
    settings: &Settings,
    limiter: Arc<RateLimiter>,
    stop: StopFlag,
    rec_tx: Option<mpsc::Sender<Event>>,
) -> ExitCode {
    if let Some(bt) = settings.backtest.clone() {
        return match run_backtest(&broker, settings, &bt).await {
            Ok(summary) => {
                if let Some(tx) = &rec_tx {
                    let _ = tx.send(Event::Backtest(summary)).await;
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "backtest aborted");
                ExitCode::FAILURE
            }
        };
    }

    let mut tl = TradingLoop::new(broker, settings, limiter, stop);
    if let Some(tx) = rec_tx {
        tl = tl.with_recorder(tx);
    }
    let n = tl.run().await;
    info!(iterations = n, "trading loop finished");
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // ---- Config ----
    let cli = Cli::parse();
    let mut settings = config::load();
    settings.apply_cli(&cli);

    // ---- Metrics ----
    metrics::init();
    if settings.metrics_port != 0 {
        metrics::serve_metrics(settings.metrics_port);
    }

    let exec_mode = ExecMode::from_flag(settings.execute);
    info!(
        run_mode = settings.run_mode.as_str(),
        execute = exec_mode.as_str(),
        symbols = ?settings.symbols,
        allowlist = ?settings.allowlist,
        interval_s = settings.loop_interval.as_secs_f64(),
        max_iterations = ?settings.max_iterations,
        backtest = settings.backtest.is_some(),
        "startup config"
    );
    metrics::CONFIG_RUN_MODE.with_label_values(&[settings.run_mode.as_str()]).set(1);
    metrics::CONFIG_EXECUTE.with_label_values(&[exec_mode.as_str()]).set(1);
    for s in &settings.symbols {
        metrics::CONFIG_SYMBOL.with_label_values(&[s]).set(1);
    }

    // ---- Recorder (optional) ----
    let mut rec_task = None;
    let rec_tx = match settings.record_file.clone() {
        Some(path) => match recorder::open_writer(&path).await {
            Ok(writer) => {
                let (tx, rx) = mpsc::channel::<Event>(8192);
                rec_task = Some(tokio::spawn(recorder::run(rx, path, writer)));
                Some(tx)
            }
            Err(e) => {
                warn!(error = %e, "recorder disabled");
                None
            }
        },
        None => None,
    };

    // ---- Stop on Ctrl-C ----
    let stop = StopFlag::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping after the current step");
                stop.trigger();
            }
        });
    }

    let limiter = Arc::new(RateLimiter::new(settings.rates.clone()));

    let code = match settings.run_mode {
        RunMode::Mock => drive(MockBroker::new(&settings.mock), &settings, limiter, stop, rec_tx).await,
        RunMode::Alpaca => match AlpacaBroker::new(&settings.alpaca, limiter.clone(), stop.clone()) {
            Ok(b) => {
                let b = match &settings.backtest {
                    Some(bt) => b.with_bar_step(bt.step_min),
                    None => b,
                };
                drive(b, &settings, limiter, stop, rec_tx).await
            }
            Err(e) => {
                error!(error = %e, "alpaca broker unavailable");
                drop(rec_tx);
                ExitCode::FAILURE
            }
        },
    };

    // senders are gone once drive returns; let the recorder drain
    if let Some(h) = rec_task {
        let _ = h.await;
    }
    code
}
