// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Loop --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "trading loop iterations").unwrap());

pub static TICK_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("tick_failures_total", "iterations aborted by a collaborator error").unwrap()
});

pub static RATE_LIMIT_WAITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rate_limit_waits_total", "backoff sleeps while waiting for the rate limiter"),
        &["key"],
    )
    .unwrap()
});

pub static JOURNAL_DROPS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("journal_drops_total", "events dropped because the recorder channel was full or closed").unwrap()
});

// -------- Decisions --------
pub static AGENT_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("agent_decisions_total", "agent outputs (labels: agent, action)"),
        &["agent", "action"],
    )
    .unwrap()
});

pub static RISK_VETOES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("risk_vetoes_total", "risk vetoes by reason"), &["reason"]).unwrap()
});

pub static FINAL_DECISIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("final_decisions_total", "coordinator output by action"), &["action"]).unwrap()
});

// -------- Execution --------
pub static EXECS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("exec_reports_total", "executor outcomes"), &["status"]).unwrap()
});

pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("orders_total", "orders accepted by the broker"), &["side"]).unwrap()
});

// -------- Portfolio --------
pub static EQUITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_equity", "cash + marked positions").unwrap());

pub static CASH: Lazy<Gauge> = Lazy::new(|| Gauge::new("portfolio_cash", "account cash").unwrap());

pub static UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_unrealized_pnl", "unrealized PnL vs avg entry").unwrap());

// ---- Config visibility ----
pub static CONFIG_RUN_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_run_mode", "broker backend (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_EXECUTE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_execute", "execution mode (label: mode)"), &["mode"]).unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_symbol", "configured symbols (label: symbol)"), &["symbol"]).unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(TICK_FAILURES.clone())),
        REGISTRY.register(Box::new(RATE_LIMIT_WAITS.clone())),
        REGISTRY.register(Box::new(JOURNAL_DROPS.clone())),
        REGISTRY.register(Box::new(AGENT_DECISIONS.clone())),
        REGISTRY.register(Box::new(RISK_VETOES.clone())),
        REGISTRY.register(Box::new(FINAL_DECISIONS.clone())),
        REGISTRY.register(Box::new(EXECS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(CASH.clone())),
        REGISTRY.register(Box::new(UNREALIZED.clone())),
        REGISTRY.register(Box::new(CONFIG_RUN_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_EXECUTE.clone())),
        REGISTRY.register(Box::new(CONFIG_SYMBOL.clone())),
    ] {
        // double registration only happens in tests
        let _ = m;
    }
}

fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

fn handle_client(mut stream: TcpStream) {
    // headers are not parsed; every path gets the exposition
    let mut req_buf = [0u8; 1024];
    let _ = stream.read(&mut req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

/// Serve the registry on a dedicated OS thread. A bind failure is logged, not fatal.
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, error = %e, "metrics bind failed, metrics disabled");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/metrics");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(error = %e, "metrics accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_families() {
        init();
        TICKS.inc();
        EXECS.with_label_values(&["dry_run"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ticks_total"));
        assert!(text.contains("exec_reports_total"));
    }
}
