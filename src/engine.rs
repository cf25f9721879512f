// ===============================
// src/engine.rs
// ===============================
//
// Sequential trading loop: snapshot -> pipeline -> executor -> report.
// No tick starts before the previous one is fully acted on. Suspension only
// happens inside rate-limit backoff and the inter-tick wait, both of which
// observe the StopFlag.
//
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::config::{ExecutorLimits, Settings};
use crate::domain::{Event, ExecReport, MarketSnapshot, PortfolioMark, TickRecord};
use crate::executor::{ExecMode, TradeExecutor};
use crate::metrics::{CASH, EQUITY, JOURNAL_DROPS, TICKS, TICK_FAILURES, UNREALIZED};
use crate::pipeline::{DecisionPipeline, TickOutcome};
use crate::portfolio::{portfolio_value, unrealized_pnl, PortfolioState, PositionInsight};
use crate::rate_limiter::{Clock, RateLimiter, SystemClock};

/// Cooperative cancellation shared by the loop, the limiter and Ctrl-C.
#[derive(Clone, Default)]
pub struct StopFlag {
    set: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopFlag {
    pub fn new() -> Self { Self::default() }

    pub fn trigger(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool { self.set.load(Ordering::SeqCst) }

    /// Sleep for `dur` or until triggered. Returns true when stopped.
    pub async fn sleep(&self, dur: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before re-checking so a trigger in between is not lost
        notified.as_mut().enable();
        if self.is_set() {
            return true;
        }
        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(dur) => self.is_set(),
        }
    }
}

/// Everything one iteration produced.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    pub tick: TickOutcome,
    pub exec: ExecReport,
    pub mark: Option<PortfolioMark>,
}

type LimitsSource = Box<dyn Fn() -> ExecutorLimits + Send + Sync>;

pub struct TradingLoop<B: Broker> {
    broker: B,
    symbols: Vec<String>,
    loop_interval: Duration,
    max_iterations: Option<u64>,
    pipeline: DecisionPipeline,
    executor: TradeExecutor,
    portfolio: PortfolioState,
    limiter: Arc<RateLimiter>,
    stop: StopFlag,
    clock: Arc<dyn Clock>,
    limits: LimitsSource,
    recorder: Option<mpsc::Sender<Event>>,
}

impl<B: Broker> TradingLoop<B> {
    pub fn new(broker: B, settings: &Settings, limiter: Arc<RateLimiter>, stop: StopFlag) -> Self {
        Self {
            broker,
            symbols: settings.symbols.clone(),
            loop_interval: settings.loop_interval,
            max_iterations: settings.max_iterations,
            pipeline: DecisionPipeline::from_settings(settings),
            executor: TradeExecutor::new(ExecMode::from_flag(settings.execute), limiter.clone(), stop.clone()),
            portfolio: PortfolioState::new(),
            limiter,
            stop,
            clock: Arc::new(SystemClock),
            limits: Box::new(ExecutorLimits::from_env),
            recorder: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the per-call limits source (env by default).
    pub fn with_limits(mut self, f: impl Fn() -> ExecutorLimits + Send + Sync + 'static) -> Self {
        self.limits = Box::new(f);
        self
    }

    pub fn with_recorder(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.recorder = Some(tx);
        self
    }

    pub fn broker(&self) -> &B { &self.broker }
    pub fn portfolio(&self) -> &PortfolioState { &self.portfolio }

    /// Drops all cross-tick state: momentum prices, buy cooldowns, sell fills, limiter windows.
    pub fn reset(&mut self) {
        self.pipeline.reset();
        self.executor.reset();
        self.portfolio.reset();
        self.limiter.reset();
    }

    fn record(&self, ev: Event) {
        if let Some(tx) = &self.recorder {
            if let Err(e) = tx.try_send(ev) {
                JOURNAL_DROPS.inc();
                warn!(error = %e, "recorder channel unavailable, journal event dropped");
            }
        }
    }

    async fn limited(&self, key: &str) -> Result<(), BrokerError> {
        self.limiter.acquire(key, &self.stop).await?;
        Ok(())
    }

    /// One read of the account per tick. Optional capabilities degrade to unknown.
    async fn build_snapshot(&self) -> Result<(MarketSnapshot, Option<bool>), BrokerError> {
        self.limited("broker:get_cash").await?;
        let cash = self.broker.cash().await?;

        self.limited("broker:get_positions").await?;
        let positions = self.broker.positions().await?;

        self.limited("broker:get_avg_entry_prices").await?;
        let avg = self.broker.avg_entry_prices().await.unwrap_or_else(|e| {
            warn!(error = %e, "avg entry prices unavailable, exits disabled this tick");
            BTreeMap::new()
        });

        let market_open = self.broker.is_market_open().await.unwrap_or_else(|e| {
            warn!(error = %e, "market clock unavailable, using session calendar");
            None
        });

        let mut prices = BTreeMap::new();
        for sym in &self.symbols {
            self.limited(&format!("price:{sym}")).await?;
            let px = self.broker.latest_price(sym).await?;
            prices.insert(sym.clone(), px);
        }
        debug!(?prices, cash, "snapshot");

        let snap = MarketSnapshot::new(self.clock.now(), prices, cash, positions).with_avg_entry_prices(avg);
        Ok((snap, market_open))
    }

    /// Post-trade view of the account, re-read so fills from this tick show up.
    async fn portfolio_report(&self, snap: &MarketSnapshot) -> Result<PortfolioMark, BrokerError> {
        self.limited("broker:get_cash:dashboard").await?;
        let cash = self.broker.cash().await?;
        self.limited("broker:get_positions:dashboard").await?;
        let positions = self.broker.positions().await?;
        let avg = self.broker.avg_entry_prices().await.unwrap_or_default();

        let mut prices = snap.prices().clone();
        for sym in positions.keys() {
            if prices.get(sym).copied().unwrap_or(0.0) > 0.0 {
                continue;
            }
            self.limited(&format!("price:dashboard:{sym}")).await?;
            match self.broker.latest_price(sym).await {
                Ok(px) => {
                    prices.insert(sym.clone(), px);
                }
                Err(e) => warn!(symbol = %sym, error = %e, "dashboard price unavailable"),
            }
        }

        let mark_snap = MarketSnapshot::new(snap.timestamp(), prices, cash, positions).with_avg_entry_prices(avg);
        let equity = portfolio_value(&mark_snap);
        let unrealized = unrealized_pnl(&mark_snap);

        let held: Vec<String> = mark_snap
            .positions()
            .iter()
            .filter(|(_, q)| **q > 0)
            .map(|(sym, q)| {
                let px = mark_snap.price(sym).unwrap_or(0.0);
                let ins = PositionInsight::compute(sym, *q, mark_snap.avg_entry(sym), px);
                let upnl = if ins.avg_entry_price > 0.0 { (px - ins.avg_entry_price) * *q as f64 } else { 0.0 };
                format!("{sym}:qty={q},avg={:.2},px={px:.2},upnl={upnl:.2}", ins.avg_entry_price)
            })
            .collect();
        let held = if held.is_empty() { "none".to_string() } else { held.join("; ") };
        info!(
            "[portfolio] {} cash={:.2} equity={:.2} unrealized={:.2} positions={}",
            mark_snap.timestamp().to_rfc3339(),
            cash,
            equity,
            unrealized,
            held
        );

        EQUITY.set(equity);
        CASH.set(cash);
        UNREALIZED.set(unrealized);

        Ok(PortfolioMark {
            ts: mark_snap.timestamp(),
            cash,
            equity,
            unrealized_pnl: unrealized,
            positions: mark_snap.positions().clone(),
        })
    }

    pub async fn run_iteration(&mut self, iteration: u64) -> Result<IterationOutcome, BrokerError> {
        let (snap, market_open) = self.build_snapshot().await?;
        let tick = self.pipeline.run(&snap, market_open, &self.portfolio);

        let limits = (self.limits)();
        let exec = self
            .executor
            .execute(&self.broker, &snap, &tick.final_decision, &limits, &mut self.portfolio)
            .await;

        self.record(Event::Tick(TickRecord {
            ts: snap.timestamp(),
            iteration,
            market: tick.market.clone(),
            valuation: tick.valuation.clone(),
            risk: tick.risk.clone(),
            final_decision: tick.final_decision.clone(),
        }));
        self.record(Event::Exec(exec.clone()));

        let mark = match self.portfolio_report(&snap).await {
            Ok(m) => {
                self.record(Event::Portfolio(m.clone()));
                Some(m)
            }
            Err(e) => {
                warn!(error = %e, "portfolio report failed");
                None
            }
        };

        Ok(IterationOutcome { tick, exec, mark })
    }

    /// Runs until stopped or `max_iterations` is reached. Returns iterations run.
    pub async fn run(&mut self) -> u64 {
        info!(
            symbols = ?self.symbols,
            mode = self.executor.mode().as_str(),
            interval_ms = self.loop_interval.as_millis() as u64,
            max_iterations = ?self.max_iterations,
            "trading loop started"
        );
        let mut iteration: u64 = 0;
        loop {
            if self.stop.is_set() {
                info!("stop requested, leaving trading loop");
                break;
            }
            iteration += 1;
            TICKS.inc();
            info!(iteration, "tick");
            if let Err(e) = self.run_iteration(iteration).await {
                TICK_FAILURES.inc();
                error!(iteration, error = %e, "Loop iteration failed");
            }
            if self.max_iterations.is_some_and(|max| iteration >= max) {
                info!(iteration, "max iterations reached");
                break;
            }
            if self.stop.sleep(self.loop_interval).await {
                info!("stop requested during wait");
                break;
            }
        }
        self.record(Event::Note(format!("trading loop stopped after {iteration} iterations")));
        iteration
    }
}
