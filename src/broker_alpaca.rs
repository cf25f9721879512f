// ===============================
// src/broker_alpaca.rs
// ===============================
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::broker::{Broker, BrokerError};
use crate::config::{AlpacaCfg, StartupError};
use crate::domain::{normalize_symbol, OpenOrder, OrderHandle, Side};
use crate::engine::StopFlag;
use crate::rate_limiter::RateLimiter;

const PAPER_HOST: &str = "paper-api.alpaca.markets";

// ---- REST models (only the fields we read) ----
#[derive(Debug, Deserialize)]
struct Account {
    cash: String,
}

#[derive(Debug, Deserialize)]
struct Position {
    symbol: String,
    qty: String,
    #[serde(default)]
    avg_entry_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Trade {
    p: f64,
}
#[derive(Debug, Deserialize)]
struct LatestTrade {
    trade: Trade,
}

#[derive(Debug, Deserialize)]
struct Bar {
    t: DateTime<Utc>,
    c: f64,
}
#[derive(Debug, Deserialize)]
struct LatestBar {
    bar: Bar,
}
#[derive(Debug, Deserialize)]
struct Bars {
    #[serde(default)]
    bars: Option<Vec<Bar>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Clock {
    is_open: bool,
}

#[derive(Debug, Deserialize)]
struct OrderRow {
    symbol: String,
    side: String,
}

#[derive(Debug, Serialize)]
struct NewOrder<'a> {
    symbol: &'a str,
    qty: String,
    side: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    time_in_force: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    id: String,
    status: String,
    #[serde(default)]
    filled_at: Option<DateTime<Utc>>,
}

/// Bar size for a backtest step: the largest standard timeframe not above it.
pub fn timeframe_for_step(step_min: u32) -> &'static str {
    match step_min {
        0..=1 => "1Min",
        2..=5 => "5Min",
        6..=15 => "15Min",
        16..=30 => "30Min",
        31..=60 => "1Hour",
        _ => "1Day",
    }
}

fn parse_num(raw: &str, what: &str) -> Result<f64, BrokerError> {
    raw.trim().parse::<f64>().map_err(|_| BrokerError::Decode(format!("{what}={raw}")))
}

/// Alpaca paper trading (REST). Every outbound call passes the shared limiter.
pub struct AlpacaBroker {
    http: reqwest::Client,
    base: Url,
    data: Url,
    key: String,
    secret: String,
    limiter: Arc<RateLimiter>,
    stop: StopFlag,
    price_ttl: Duration,
    price_cache: Mutex<HashMap<String, (Instant, f64)>>,
    bars_cache: Mutex<HashMap<String, Vec<(DateTime<Utc>, f64)>>>,
    timeframe: &'static str,
}

impl AlpacaBroker {
    pub fn new(cfg: &AlpacaCfg, limiter: Arc<RateLimiter>, stop: StopFlag) -> Result<Self, StartupError> {
        let key = cfg.api_key.clone().ok_or(StartupError::MissingCredential("ALPACA_API_KEY"))?;
        let secret = cfg.secret_key.clone().ok_or(StartupError::MissingCredential("ALPACA_SECRET_KEY"))?;

        let base = Url::parse(&cfg.base_url).map_err(|_| StartupError::NonPaperUrl(cfg.base_url.clone()))?;
        if base.host_str() != Some(PAPER_HOST) {
            return Err(StartupError::NonPaperUrl(cfg.base_url.clone()));
        }
        let data = Url::parse(&cfg.data_url).map_err(|_| StartupError::NonPaperUrl(cfg.data_url.clone()))?;

        let http = reqwest::Client::builder().timeout(Duration::from_secs(15)).build()?;
        info!(base = %base, data = %data, "alpaca paper broker configured");
        Ok(Self {
            http,
            base,
            data,
            key,
            secret,
            limiter,
            stop,
            price_ttl: cfg.price_cache_ttl,
            price_cache: Mutex::new(HashMap::new()),
            bars_cache: Mutex::new(HashMap::new()),
            timeframe: "1Hour",
        })
    }

    pub fn with_bar_step(mut self, step_min: u32) -> Self {
        self.timeframe = timeframe_for_step(step_min);
        self
    }

    fn endpoint(root: &Url, path: &str) -> Result<Url, BrokerError> {
        root.join(path).map_err(|e| BrokerError::Decode(format!("bad url {path}: {e}")))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        limit_key: &str,
        body: Option<&NewOrder<'_>>,
    ) -> Result<T, BrokerError> {
        self.limiter.acquire(limit_key, &self.stop).await?;

        let mut req = self
            .http
            .request(method, url.clone())
            .header("APCA-API-KEY-ID", &self.key)
            .header("APCA-API-SECRET-KEY", &self.secret);
        if let Some(b) = body {
            req = req.json(b);
        }
        let rsp = req.send().await?;
        let status = rsp.status();
        let text = rsp.text().await?;
        if !status.is_success() {
            warn!(%url, %status, body = %text, "alpaca request failed");
            return Err(BrokerError::Status { status: status.as_u16(), body: text });
        }
        serde_json::from_str(&text).map_err(|e| BrokerError::Decode(format!("{url}: {e}")))
    }

    fn cached_price(&self, symbol: &str) -> Option<f64> {
        let cache = self.price_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(symbol).filter(|(at, _)| at.elapsed() < self.price_ttl).map(|(_, px)| *px)
    }

    fn store_price(&self, symbol: &str, px: f64) {
        let mut cache = self.price_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(symbol.to_string(), (Instant::now(), px));
    }

    async fn bars(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<(DateTime<Utc>, f64)>, BrokerError> {
        let cache_key = format!("{symbol}|{}|{}|{}", self.timeframe, start.to_rfc3339(), end.to_rfc3339());
        if let Some(hit) = self.bars_cache.lock().unwrap_or_else(|e| e.into_inner()).get(&cache_key) {
            return Ok(hit.clone());
        }

        let mut out = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let mut url = Self::endpoint(&self.data, &format!("v2/stocks/{symbol}/bars"))?;
            {
                let mut q = url.query_pairs_mut();
                q.append_pair("timeframe", self.timeframe)
                    .append_pair("start", &start.to_rfc3339())
                    .append_pair("end", &end.to_rfc3339())
                    .append_pair("limit", "10000")
                    .append_pair("adjustment", "raw");
                if let Some(tok) = &page {
                    q.append_pair("page_token", tok);
                }
            }
            let key = format!("market_data:historical:{symbol}:{}", self.timeframe);
            let chunk: Bars = self.call(Method::GET, url, &key, None).await?;
            out.extend(chunk.bars.unwrap_or_default().into_iter().map(|b| (b.t, b.c)));
            match chunk.next_page_token {
                Some(tok) if !tok.is_empty() => page = Some(tok),
                _ => break,
            }
        }
        out.sort_by_key(|(t, _)| *t);
        if out.is_empty() {
            warn!(symbol, timeframe = self.timeframe, "empty historical bars");
        }
        self.bars_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(cache_key, out.clone());
        Ok(out)
    }
}

impl Broker for AlpacaBroker {
    async fn cash(&self) -> Result<f64, BrokerError> {
        let url = Self::endpoint(&self.base, "v2/account")?;
        let acct: Account = self.call(Method::GET, url, "alpaca:account", None).await?;
        parse_num(&acct.cash, "cash")
    }

    async fn positions(&self) -> Result<BTreeMap<String, i64>, BrokerError> {
        let url = Self::endpoint(&self.base, "v2/positions")?;
        let rows: Vec<Position> = self.call(Method::GET, url, "alpaca:positions", None).await?;
        rows.iter()
            .map(|p| Ok((normalize_symbol(&p.symbol), parse_num(&p.qty, "qty")? as i64)))
            .collect()
    }

    async fn avg_entry_prices(&self) -> Result<BTreeMap<String, f64>, BrokerError> {
        let url = Self::endpoint(&self.base, "v2/positions")?;
        let rows: Vec<Position> = self.call(Method::GET, url, "alpaca:positions", None).await?;
        Ok(rows
            .iter()
            .map(|p| {
                let avg = p.avg_entry_price.as_deref().and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
                (normalize_symbol(&p.symbol), avg)
            })
            .collect())
    }

    /// Latest trade, falling back to the latest bar close. Cached for `PRICE_CACHE_TTL_SEC`.
    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let sym = normalize_symbol(symbol);
        if sym.is_empty() {
            return Err(BrokerError::UnsupportedSymbol(symbol.to_string()));
        }
        if let Some(px) = self.cached_price(&sym) {
            debug!(symbol = %sym, px, "price cache hit");
            return Ok(px);
        }

        let url = Self::endpoint(&self.data, &format!("v2/stocks/{sym}/trades/latest"))?;
        match self.call::<LatestTrade>(Method::GET, url, &format!("market_data:{sym}"), None).await {
            Ok(t) => {
                self.store_price(&sym, t.trade.p);
                return Ok(t.trade.p);
            }
            Err(BrokerError::Cancelled(c)) => return Err(BrokerError::Cancelled(c)),
            Err(e) => warn!(symbol = %sym, error = %e, "latest trade failed, trying latest bar"),
        }

        let url = Self::endpoint(&self.data, &format!("v2/stocks/{sym}/bars/latest"))?;
        let bar: LatestBar = self.call(Method::GET, url, &format!("market_data:{sym}:bar"), None).await?;
        self.store_price(&sym, bar.bar.c);
        Ok(bar.bar.c)
    }

    async fn place_order(&self, symbol: &str, side: Side, qty: i64) -> Result<OrderHandle, BrokerError> {
        if qty <= 0 {
            return Err(BrokerError::InvalidOrder("qty must be > 0".into()));
        }
        let sym = normalize_symbol(symbol);
        let order = NewOrder { symbol: &sym, qty: qty.to_string(), side: side.wire(), kind: "market", time_in_force: "day" };
        let url = Self::endpoint(&self.base, "v2/orders")?;
        let ack: OrderAck = self.call(Method::POST, url, "alpaca:orders", Some(&order)).await?;
        info!(id = %ack.id, status = %ack.status, symbol = %sym, %side, qty, "alpaca order accepted");
        Ok(OrderHandle { id: ack.id, status: ack.status, filled_at: ack.filled_at })
    }

    async fn is_market_open(&self) -> Result<Option<bool>, BrokerError> {
        let url = Self::endpoint(&self.base, "v2/clock")?;
        let clock: Clock = self.call(Method::GET, url, "alpaca:clock", None).await?;
        Ok(Some(clock.is_open))
    }

    async fn open_orders(&self) -> Result<Option<Vec<OpenOrder>>, BrokerError> {
        let mut url = Self::endpoint(&self.base, "v2/orders")?;
        url.query_pairs_mut().append_pair("status", "open").append_pair("limit", "500");
        let rows: Vec<OrderRow> = self.call(Method::GET, url, "alpaca:orders", None).await?;
        Ok(Some(
            rows.into_iter()
                .filter_map(|r| Some(OpenOrder { symbol: normalize_symbol(&r.symbol), side: Side::parse(&r.side)? }))
                .collect(),
        ))
    }

    /// Last close at or before `at`, from bars covering the preceding week.
    async fn historical_close(&self, symbol: &str, at: DateTime<Utc>) -> Result<Option<f64>, BrokerError> {
        let sym = normalize_symbol(symbol);
        // whole-day window so every step within a day shares one cached fetch
        let day = at.date_naive();
        let start = Utc.from_utc_datetime(&(day - ChronoDuration::days(7)).and_time(NaiveTime::default()));
        let end = Utc.from_utc_datetime(&day.and_time(NaiveTime::default())) + ChronoDuration::seconds(86_399);
        let bars = self.bars(&sym, start, end).await?;
        Ok(bars.iter().rev().find(|(t, _)| *t <= at).map(|(_, c)| *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateCfg;

    fn cfg(base: &str) -> AlpacaCfg {
        AlpacaCfg {
            base_url: base.to_string(),
            data_url: "https://data.alpaca.markets".to_string(),
            api_key: Some("k".into()),
            secret_key: Some("s".into()),
            price_cache_ttl: Duration::from_secs(5),
        }
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateCfg::default()))
    }

    #[test]
    fn refuses_live_endpoint() {
        let r = AlpacaBroker::new(&cfg("https://api.alpaca.markets"), limiter(), StopFlag::new());
        assert!(matches!(r, Err(StartupError::NonPaperUrl(_))));
    }

    #[test]
    fn requires_credentials() {
        let mut c = cfg("https://paper-api.alpaca.markets");
        c.secret_key = None;
        let r = AlpacaBroker::new(&c, limiter(), StopFlag::new());
        assert!(matches!(r, Err(StartupError::MissingCredential("ALPACA_SECRET_KEY"))));
    }

    #[test]
    fn joins_paths_under_base() {
        let b = AlpacaBroker::new(&cfg("https://paper-api.alpaca.markets"), limiter(), StopFlag::new()).unwrap();
        let u = AlpacaBroker::endpoint(&b.base, "v2/orders").unwrap();
        assert_eq!(u.as_str(), "https://paper-api.alpaca.markets/v2/orders");
    }

    #[test]
    fn timeframe_buckets() {
        assert_eq!(timeframe_for_step(1), "1Min");
        assert_eq!(timeframe_for_step(10), "15Min");
        assert_eq!(timeframe_for_step(60), "1Hour");
        assert_eq!(timeframe_for_step(240), "1Day");
    }

    #[test]
    fn order_body_shape() {
        let o = NewOrder { symbol: "PLTR", qty: "2".into(), side: Side::Buy.wire(), kind: "market", time_in_force: "day" };
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["type"], "market");
        assert_eq!(v["side"], "buy");
        assert_eq!(v["qty"], "2");
    }

    #[test]
    fn price_cache_respects_ttl() {
        let mut c = cfg("https://paper-api.alpaca.markets");
        c.price_cache_ttl = Duration::from_secs(60);
        let b = AlpacaBroker::new(&c, limiter(), StopFlag::new()).unwrap();
        assert!(b.cached_price("PLTR").is_none());
        b.store_price("PLTR", 42.0);
        assert_eq!(b.cached_price("PLTR"), Some(42.0));
    }
}
