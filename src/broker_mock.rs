// ===============================
// src/broker_mock.rs (in-process venue)
// ===============================
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerError};
use crate::config::MockCfg;
use crate::domain::{normalize_symbol, OpenOrder, OrderHandle, Side};
use crate::portfolio::{BookError, PaperBook};

pub const MOCK_PRICES: [(&str, f64); 3] = [("PLTR", 100.0), ("NFLX", 200.0), ("PLTK", 20.0)];

struct MockState {
    prices: BTreeMap<String, f64>,
    book: PaperBook,
    next_id: u64,
}

/// Fills every order immediately at the current price. Prices are static
/// unless `price_walk_bps` > 0, in which case each read jitters the price.
pub struct MockBroker {
    state: Mutex<MockState>,
    market_open: Option<bool>,
    price_walk_bps: f64,
}

impl MockBroker {
    pub fn new(cfg: &MockCfg) -> Self {
        let prices: BTreeMap<String, f64> = MOCK_PRICES.iter().map(|(s, p)| (s.to_string(), *p)).collect();
        let symbols: Vec<String> = prices.keys().cloned().collect();
        Self {
            state: Mutex::new(MockState { prices, book: PaperBook::new(cfg.starting_cash, &symbols), next_id: 1 }),
            market_open: cfg.market_open,
            price_walk_bps: cfg.price_walk_bps,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked_symbol(st: &MockState, symbol: &str) -> Result<String, BrokerError> {
        let sym = normalize_symbol(symbol);
        if st.prices.contains_key(&sym) { Ok(sym) } else { Err(BrokerError::UnsupportedSymbol(sym)) }
    }

    /// Overrides a price; used by tests and demos to script moves.
    pub fn set_price(&self, symbol: &str, price: f64) -> Result<(), BrokerError> {
        let mut st = self.lock();
        let sym = Self::checked_symbol(&st, symbol)?;
        st.prices.insert(sym, price);
        Ok(())
    }

    pub fn realized_pnl(&self) -> f64 {
        self.lock().book.realized_pnl
    }
}

impl Broker for MockBroker {
    async fn cash(&self) -> Result<f64, BrokerError> {
        Ok(self.lock().book.cash)
    }

    async fn positions(&self) -> Result<BTreeMap<String, i64>, BrokerError> {
        Ok(self.lock().book.positions.clone())
    }

    async fn avg_entry_prices(&self) -> Result<BTreeMap<String, f64>, BrokerError> {
        Ok(self.lock().book.avg_entry.clone())
    }

    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let mut st = self.lock();
        let sym = Self::checked_symbol(&st, symbol)?;
        let mut px = st.prices.get(&sym).copied().unwrap_or(0.0);
        if self.price_walk_bps > 0.0 {
            let step = rand::thread_rng().gen_range(-self.price_walk_bps..=self.price_walk_bps) / 10_000.0;
            px = (px * (1.0 + step) * 100.0).round() / 100.0;
            px = px.max(0.01);
            st.prices.insert(sym.clone(), px);
            debug!(symbol = %sym, px, "mock price walk");
        }
        Ok(px)
    }

    async fn place_order(&self, symbol: &str, side: Side, qty: i64) -> Result<OrderHandle, BrokerError> {
        let mut st = self.lock();
        let sym = Self::checked_symbol(&st, symbol)?;
        let px = st.prices.get(&sym).copied().unwrap_or(0.0);
        st.book.apply_fill(&sym, side, qty, px).map_err(|e| match e {
            BookError::InvalidQty => BrokerError::InvalidOrder(e.to_string()),
            BookError::InsufficientCash { .. } => BrokerError::InsufficientCash,
            BookError::InsufficientPosition { .. } => BrokerError::InsufficientPosition,
        })?;
        let id = format!("MOCK-{}", st.next_id);
        st.next_id += 1;
        info!(symbol = %sym, %side, qty, px, cash = st.book.cash, "mock fill");
        Ok(OrderHandle { id, status: "filled".into(), filled_at: Some(Utc::now()) })
    }

    async fn is_market_open(&self) -> Result<Option<bool>, BrokerError> {
        Ok(self.market_open)
    }

    // fills are immediate, so nothing is ever pending
    async fn open_orders(&self) -> Result<Option<Vec<OpenOrder>>, BrokerError> {
        Ok(Some(Vec::new()))
    }
}
