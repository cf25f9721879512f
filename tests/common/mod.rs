// ===============================
// tests/common/mod.rs
// ===============================
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use agent_trader::broker::{Broker, BrokerError};
use chrono::{DateTime, Utc};
use agent_trader::domain::{OpenOrder, OrderHandle, Side};

/// In-memory broker that records every order it is asked to place.
pub struct RecordingBroker {
    pub cash: f64,
    pub positions: BTreeMap<String, i64>,
    pub prices: BTreeMap<String, f64>,
    pub market_open: Option<bool>,
    /// `None` = the broker cannot answer open-order queries.
    pub open: Option<Vec<OpenOrder>>,
    pub fail_orders: bool,
    pub orders: Mutex<Vec<(String, Side, i64)>>,
    /// Historical closes per symbol, ascending by time.
    pub history: BTreeMap<String, Vec<(DateTime<Utc>, f64)>>,
}

impl RecordingBroker {
    pub fn new(cash: f64, prices: &[(&str, f64)]) -> Self {
        Self {
            cash,
            positions: BTreeMap::new(),
            prices: prices.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
            market_open: Some(true),
            open: Some(Vec::new()),
            fail_orders: false,
            orders: Mutex::new(Vec::new()),
            history: BTreeMap::new(),
        }
    }

    pub fn with_position(mut self, symbol: &str, qty: i64) -> Self {
        self.positions.insert(symbol.to_string(), qty);
        self
    }

    pub fn with_open_order(mut self, symbol: &str, side: Side) -> Self {
        self.open.get_or_insert_with(Vec::new).push(OpenOrder { symbol: symbol.to_string(), side });
        self
    }

    pub fn with_history(mut self, symbol: &str, closes: &[(DateTime<Utc>, f64)]) -> Self {
        self.history.insert(symbol.to_string(), closes.to_vec());
        self
    }

    pub fn orders(&self) -> Vec<(String, Side, i64)> {
        self.orders.lock().unwrap().clone()
    }
}

impl Broker for RecordingBroker {
    async fn cash(&self) -> Result<f64, BrokerError> {
        Ok(self.cash)
    }

    async fn positions(&self) -> Result<BTreeMap<String, i64>, BrokerError> {
        Ok(self.positions.clone())
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.prices.get(symbol).copied().ok_or_else(|| BrokerError::UnsupportedSymbol(symbol.to_string()))
    }

    async fn place_order(&self, symbol: &str, side: Side, qty: i64) -> Result<OrderHandle, BrokerError> {
        if self.fail_orders {
            return Err(BrokerError::Unavailable("order endpoint down".into()));
        }
        let mut orders = self.orders.lock().unwrap();
        orders.push((symbol.to_string(), side, qty));
        Ok(OrderHandle { id: format!("T-{}", orders.len()), status: "accepted".into(), filled_at: None })
    }

    async fn is_market_open(&self) -> Result<Option<bool>, BrokerError> {
        Ok(self.market_open)
    }

    async fn open_orders(&self) -> Result<Option<Vec<OpenOrder>>, BrokerError> {
        Ok(self.open.clone())
    }

    async fn historical_close(&self, symbol: &str, at: DateTime<Utc>) -> Result<Option<f64>, BrokerError> {
        Ok(self
            .history
            .get(symbol)
            .and_then(|bars| bars.iter().rev().find(|(ts, _)| *ts <= at))
            .map(|(_, px)| *px))
    }
}
