// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : agent_trader — risk-gated multi-agent trading loop in Rust
Module  : config.rs
Version : 0.3.0
License : MIT (see LICENSE)

Summary : Polls a broker (mock or Alpaca paper) once per tick, merges a
          momentum and a fair-value signal under a hard risk veto, and
          executes at most one rate-limited order per tick with position
          caps, cooldowns and duplicate-order guards.
=============================================================================
*/
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use ahash::AHashSet;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use dotenvy::dotenv;
use thiserror::Error;
use tracing::warn;

use crate::domain::normalize_symbol;
use crate::risk::RiskVeto;

/// Env-style lookup. Production passes `env::var`, tests pass a map.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn raw(get: Lookup, key: &str) -> Option<String> {
    get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse `key`, falling back to `default` on absence or garbage.
fn parse_or<T: FromStr>(get: Lookup, key: &str, default: T) -> T {
    match raw(get, key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "unparseable config value, using default");
            default
        }),
        None => default,
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Tri-state flag: unset or unrecognised is `None`.
fn opt_flag(get: Lookup, key: &str) -> Option<bool> {
    let v = raw(get, key)?;
    let parsed = parse_bool(&v);
    if parsed.is_none() {
        warn!(key, value = %v, "unrecognised boolean, ignoring");
    }
    parsed
}

fn flag(get: Lookup, key: &str, default: bool) -> bool {
    opt_flag(get, key).unwrap_or(default)
}

/// Comma list, normalised, first occurrence wins.
fn symbol_list(get: Lookup, key: &str) -> Option<Vec<String>> {
    raw(get, key)
        .map(|s| {
            let mut seen = AHashSet::new();
            s.split(',')
                .map(normalize_symbol)
                .filter(|x| !x.is_empty() && seen.insert(x.clone()))
                .collect::<Vec<String>>()
        })
        .filter(|v| !v.is_empty())
}

/// Broker backend for the live loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    Mock,
    Alpaca,
}

impl RunMode {
    pub fn parse(raw: Option<String>) -> RunMode {
        match raw.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "alpaca" => RunMode::Alpaca,
            _ => RunMode::Mock,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Mock => "mock",
            RunMode::Alpaca => "alpaca",
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "agent_trader", about = "Risk-gated momentum/valuation trading loop")]
pub struct Cli {
    /// Stop after N iterations (overrides MAX_ITERATIONS)
    #[arg(long)]
    pub max_iterations: Option<u64>,
    /// Run exactly one iteration
    #[arg(long)]
    pub once: bool,
    /// Replay a backtest instead of the live loop (same as BACKTEST=1)
    #[arg(long)]
    pub backtest: bool,
    /// Send real (paper) orders (same as EXECUTE=1)
    #[arg(long)]
    pub execute: bool,
}

/// Policy thresholds and weights. Defaults are the production values.
#[derive(Clone, Debug, PartialEq)]
pub struct Policy {
    pub momentum_threshold: f64,
    pub momentum_base_conf: f64,
    pub momentum_conf_slope: f64,
    pub momentum_conf_cap: f64,
    pub momentum_neutral_floor: f64,
    pub momentum_neutral_ceiling: f64,
    pub momentum_no_signal_conf: f64,

    pub valuation_threshold: f64,
    pub valuation_buy_base: f64,
    pub valuation_buy_slope: f64,
    pub valuation_buy_cap: f64,
    pub valuation_sell_base: f64,
    pub valuation_sell_slope: f64,
    pub valuation_sell_cap: f64,
    pub valuation_hold_conf: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_conf: f64,
    pub stop_loss_conf: f64,

    pub risk_approve_conf: f64,

    pub min_valuation_conf: f64,
    pub min_final_conf: f64,
    pub cooldown_conf_ceiling: f64,
    pub weight_market: f64,
    pub weight_valuation: f64,
    pub weight_risk: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            momentum_threshold: 0.01,
            momentum_base_conf: 0.4,
            momentum_conf_slope: 20.0,
            momentum_conf_cap: 0.85,
            momentum_neutral_floor: 0.4,
            momentum_neutral_ceiling: 0.55,
            momentum_no_signal_conf: 0.45,

            valuation_threshold: 0.03,
            valuation_buy_base: 0.5,
            valuation_buy_slope: 5.0,
            valuation_buy_cap: 0.9,
            valuation_sell_base: 0.6,
            valuation_sell_slope: 3.0,
            valuation_sell_cap: 0.85,
            valuation_hold_conf: 0.5,
            take_profit_pct: 0.05,
            stop_loss_pct: -0.03,
            take_profit_conf: 0.9,
            stop_loss_conf: 0.85,

            risk_approve_conf: 0.7,

            min_valuation_conf: 0.6,
            min_final_conf: 0.65,
            cooldown_conf_ceiling: 0.4,
            weight_market: 0.30,
            weight_valuation: 0.45,
            weight_risk: 0.25,
        }
    }
}

impl Policy {
    pub fn from_vars(get: Lookup) -> Self {
        let d = Policy::default();
        Self {
            momentum_threshold: parse_or(get, "POLICY_MOMENTUM_THRESHOLD", d.momentum_threshold),
            valuation_threshold: parse_or(get, "POLICY_VALUATION_THRESHOLD", d.valuation_threshold),
            take_profit_pct: parse_or(get, "TAKE_PROFIT_PCT", d.take_profit_pct),
            stop_loss_pct: parse_or(get, "STOP_LOSS_PCT", d.stop_loss_pct),
            risk_approve_conf: parse_or(get, "POLICY_RISK_APPROVE_CONF", d.risk_approve_conf),
            min_valuation_conf: parse_or(get, "POLICY_MIN_VALUATION_CONF", d.min_valuation_conf),
            min_final_conf: parse_or(get, "POLICY_MIN_FINAL_CONF", d.min_final_conf),
            cooldown_conf_ceiling: parse_or(get, "POLICY_COOLDOWN_CONF_CEILING", d.cooldown_conf_ceiling),
            weight_market: parse_or(get, "POLICY_WEIGHT_MARKET", d.weight_market),
            weight_valuation: parse_or(get, "POLICY_WEIGHT_VALUATION", d.weight_valuation),
            weight_risk: parse_or(get, "POLICY_WEIGHT_RISK", d.weight_risk),
            ..d
        }
    }
}

/// Executor limits. Re-read on every executor call.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutorLimits {
    /// Percent of total portfolio value (20.0 == 20%).
    pub max_position_percent: f64,
    pub max_shares_per_trade: i64,
    pub buy_cooldown_seconds: i64,
    /// Percent move since the last BUY that lifts the cooldown (1.0 == 1%).
    pub price_move_bypass_pct: f64,
    pub enable_open_order_guard: bool,
    pub sell_cooldown_minutes: i64,
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self {
            max_position_percent: 20.0,
            max_shares_per_trade: 5,
            buy_cooldown_seconds: 300,
            price_move_bypass_pct: 1.0,
            enable_open_order_guard: true,
            sell_cooldown_minutes: 120,
        }
    }
}

impl ExecutorLimits {
    pub fn from_env() -> Self {
        Self::from_vars(&|k: &str| env::var(k).ok())
    }

    pub fn from_vars(get: Lookup) -> Self {
        let d = ExecutorLimits::default();

        let mut max_position_percent = parse_or(get, "MAX_POSITION_PERCENT", d.max_position_percent);
        if !(max_position_percent > 0.0 && max_position_percent <= 100.0) {
            max_position_percent = d.max_position_percent;
        }
        let mut max_shares_per_trade = parse_or(get, "MAX_SHARES_PER_TRADE", d.max_shares_per_trade);
        if max_shares_per_trade < 1 {
            max_shares_per_trade = d.max_shares_per_trade;
        }
        let buy_cooldown_seconds = parse_or(get, "BUY_COOLDOWN_SECONDS", d.buy_cooldown_seconds).max(0);
        let mut price_move_bypass_pct = parse_or(get, "PRICE_MOVE_BYPASS_PCT", d.price_move_bypass_pct);
        if !(price_move_bypass_pct >= 0.0) {
            price_move_bypass_pct = d.price_move_bypass_pct;
        }

        Self {
            max_position_percent,
            max_shares_per_trade,
            buy_cooldown_seconds,
            price_move_bypass_pct,
            enable_open_order_guard: flag(get, "ENABLE_OPEN_ORDER_GUARD", d.enable_open_order_guard),
            sell_cooldown_minutes: parse_or(get, "SELL_COOLDOWN_MIN", d.sell_cooldown_minutes).max(0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateCfg {
    pub per_second: usize,
    pub per_hour: usize,
    pub per_day: usize,
}

impl Default for RateCfg {
    fn default() -> Self {
        Self { per_second: 3, per_hour: 1000, per_day: 5000 }
    }
}

#[derive(Clone, Debug)]
pub struct MockCfg {
    pub starting_cash: f64,
    pub market_open: Option<bool>,
    pub price_walk_bps: f64,
}

#[derive(Clone, Debug)]
pub struct AlpacaCfg {
    pub base_url: String,
    pub data_url: String,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
    pub price_cache_ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct BacktestCfg {
    pub start: NaiveDate,
    pub days: u32,
    pub step_min: u32,
    pub initial_cash: f64,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub run_mode: RunMode,
    pub execute: bool,
    pub loop_interval: Duration,
    pub max_iterations: Option<u64>,

    pub symbols: Vec<String>,
    pub allowlist: BTreeSet<String>,
    pub fair_values: BTreeMap<String, f64>,
    pub max_shares_per_symbol: i64,
    pub sell_cooldown_min: i64,
    pub forced_veto: Option<RiskVeto>,
    pub policy: Policy,
    pub rates: RateCfg,

    pub record_file: Option<String>,
    pub metrics_port: u16,

    pub mock: MockCfg,
    pub alpaca: AlpacaCfg,
    pub backtest: Option<BacktestCfg>,
}

pub const DEFAULT_SYMBOLS: [&str; 3] = ["PLTR", "NFLX", "PLTK"];

pub fn default_fair_values() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("PLTR".to_string(), 95.0),
        ("NFLX".to_string(), 190.0),
        ("PLTK".to_string(), 18.0),
    ])
}

/// `SYM:price,SYM:price`; malformed pairs are dropped.
fn parse_fair_values(raw: &str) -> BTreeMap<String, f64> {
    raw.split(',')
        .filter_map(|pair| {
            let (sym, px) = pair.split_once(':')?;
            let px: f64 = px.trim().parse().ok()?;
            let sym = normalize_symbol(sym);
            (!sym.is_empty() && px > 0.0).then_some((sym, px))
        })
        .collect()
}

impl Settings {
    pub fn from_vars(get: Lookup) -> Self {
        let run_mode = RunMode::parse(get("RUN_MODE"));

        // LOOP_INTERVAL_SEC wins, LOOP_INTERVAL_SECONDS is the older spelling
        let loop_key = if raw(get, "LOOP_INTERVAL_SEC").is_some() { "LOOP_INTERVAL_SEC" } else { "LOOP_INTERVAL_SECONDS" };
        let loop_secs: f64 = parse_or(get, loop_key, 5.0);
        let loop_interval = Duration::from_secs_f64(if loop_secs.is_finite() { loop_secs.max(0.0) } else { 5.0 });

        let symbols = symbol_list(get, "SYMBOLS")
            .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect());
        let allowlist: BTreeSet<String> = symbol_list(get, "ALLOWED_SYMBOLS")
            .unwrap_or_else(|| symbols.clone())
            .into_iter()
            .collect();

        let mut fair_values = default_fair_values();
        if let Some(v) = raw(get, "FAIR_VALUES") {
            fair_values.extend(parse_fair_values(&v));
        }

        // forced vetoes exist only to exercise the veto path against the mock
        let forced_veto = match run_mode {
            RunMode::Mock => raw(get, "RISK_FORCE_VETO").and_then(|v| RiskVeto::parse_forced(&v)),
            RunMode::Alpaca => None,
        };

        let rd = RateCfg::default();
        let rates = RateCfg {
            per_second: parse_or(get, "RATE_PER_SECOND", rd.per_second).max(1),
            per_hour: parse_or(get, "RATE_PER_HOUR", rd.per_hour).max(1),
            per_day: parse_or(get, "RATE_PER_DAY", rd.per_day).max(1),
        };

        let mock = MockCfg {
            starting_cash: parse_or(get, "MOCK_STARTING_CASH", 100_000.0_f64).max(0.0),
            market_open: opt_flag(get, "MOCK_MARKET_OPEN"),
            price_walk_bps: parse_or(get, "MOCK_PRICE_WALK_BPS", 0.0_f64).max(0.0),
        };

        let alpaca = AlpacaCfg {
            base_url: raw(get, "APCA_API_BASE_URL").unwrap_or_else(|| "https://paper-api.alpaca.markets".to_string()),
            data_url: raw(get, "APCA_DATA_URL").unwrap_or_else(|| "https://data.alpaca.markets".to_string()),
            api_key: raw(get, "ALPACA_API_KEY"),
            secret_key: raw(get, "ALPACA_SECRET_KEY"),
            price_cache_ttl: Duration::from_secs_f64(parse_or(get, "PRICE_CACHE_TTL_SEC", 5.0_f64).max(0.0)),
        };

        let backtest = flag(get, "BACKTEST", false).then(|| backtest_from_vars(get));

        Self {
            run_mode,
            execute: flag(get, "EXECUTE", false),
            loop_interval,
            max_iterations: raw(get, "MAX_ITERATIONS").and_then(|v| v.parse().ok()),
            symbols,
            allowlist,
            fair_values,
            max_shares_per_symbol: parse_or(get, "RISK_MAX_SHARES", 5_i64).max(1),
            sell_cooldown_min: parse_or(get, "SELL_COOLDOWN_MIN", 120_i64).max(0),
            forced_veto,
            policy: Policy::from_vars(get),
            rates,
            record_file: raw(get, "RECORD_FILE"),
            metrics_port: parse_or(get, "METRICS_PORT", 9898),
            mock,
            alpaca,
            backtest,
        }
    }

    /// CLI flags override env.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if cli.execute {
            self.execute = true;
        }
        if let Some(n) = cli.max_iterations {
            self.max_iterations = Some(n);
        }
        if cli.once {
            self.max_iterations = Some(1);
        }
        if cli.backtest && self.backtest.is_none() {
            self.backtest = Some(backtest_from_vars(&|k: &str| env::var(k).ok()));
        }
    }
}

fn backtest_from_vars(get: Lookup) -> BacktestCfg {
    let start = match raw(get, "BACKTEST_START") {
        Some(v) => NaiveDate::parse_from_str(&v, "%Y-%m-%d").unwrap_or_else(|_| {
            warn!(value = %v, "invalid BACKTEST_START (expected YYYY-MM-DD), using last week");
            last_week()
        }),
        None => {
            warn!("BACKTEST_START not set, using last week");
            last_week()
        }
    };
    BacktestCfg {
        start,
        days: parse_or(get, "BACKTEST_DAYS", 5_u32).max(1),
        step_min: parse_or(get, "BACKTEST_STEP_MIN", 60_u32).max(1),
        initial_cash: parse_or(get, "BACKTEST_INITIAL_CASH", 100_000.0_f64).max(0.0),
    }
}

fn last_week() -> NaiveDate {
    Utc::now().date_naive() - chrono::Duration::days(7)
}

/// Fatal at startup only; everything after startup degrades instead of exiting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("missing {0}")]
    MissingCredential(&'static str),
    #[error("refusing non-paper Alpaca base URL: {0}")]
    NonPaperUrl(String),
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("recorder {path}: {source}")]
    Recorder { path: String, source: std::io::Error },
}

pub fn load() -> Settings {
    // .env is optional
    let _ = dotenv();
    Settings::from_vars(&|k: &str| env::var(k).ok())
}
