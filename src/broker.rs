// ===============================
// src/broker.rs
// ===============================
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{OpenOrder, OrderHandle, Side};
use crate::rate_limiter::Cancelled;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("unsupported symbol: {0}")]
    UnsupportedSymbol(String),
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("insufficient cash")]
    InsufficientCash,
    #[error("insufficient position")]
    InsufficientPosition,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Account + market-data collaborator.
///
/// The required methods are the minimum a tick needs. The optional ones
/// default to "unknown" (`None` / empty) so callers fall back instead of failing.
#[allow(async_fn_in_trait)]
pub trait Broker {
    async fn cash(&self) -> Result<f64, BrokerError>;
    async fn positions(&self) -> Result<BTreeMap<String, i64>, BrokerError>;
    async fn latest_price(&self, symbol: &str) -> Result<f64, BrokerError>;
    async fn place_order(&self, symbol: &str, side: Side, qty: i64) -> Result<OrderHandle, BrokerError>;

    async fn avg_entry_prices(&self) -> Result<BTreeMap<String, f64>, BrokerError> {
        Ok(BTreeMap::new())
    }

    async fn is_market_open(&self) -> Result<Option<bool>, BrokerError> {
        Ok(None)
    }

    async fn open_orders(&self) -> Result<Option<Vec<OpenOrder>>, BrokerError> {
        Ok(None)
    }

    /// Unknown open orders count as "no duplicate".
    async fn has_open_order(&self, symbol: &str, side: Side) -> Result<bool, BrokerError> {
        Ok(match self.open_orders().await? {
            Some(orders) => orders.iter().any(|o| o.symbol == symbol && o.side == side),
            None => false,
        })
    }

    /// Last bar close at or before `at`; `None` when the broker has no history.
    async fn historical_close(&self, _symbol: &str, _at: DateTime<Utc>) -> Result<Option<f64>, BrokerError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Minimal {
        orders: Mutex<Vec<(String, Side, i64)>>,
    }

    impl Broker for Minimal {
        async fn cash(&self) -> Result<f64, BrokerError> { Ok(10.0) }
        async fn positions(&self) -> Result<BTreeMap<String, i64>, BrokerError> { Ok(BTreeMap::new()) }
        async fn latest_price(&self, _symbol: &str) -> Result<f64, BrokerError> { Ok(1.0) }
        async fn place_order(&self, symbol: &str, side: Side, qty: i64) -> Result<OrderHandle, BrokerError> {
            self.orders.lock().unwrap().push((symbol.to_string(), side, qty));
            Ok(OrderHandle { id: "1".into(), status: "accepted".into(), filled_at: None })
        }
    }

    #[tokio::test]
    async fn optional_capabilities_default_to_unknown() {
        let b = Minimal { orders: Mutex::new(Vec::new()) };
        assert!(b.avg_entry_prices().await.unwrap().is_empty());
        assert_eq!(b.is_market_open().await.unwrap(), None);
        assert!(b.open_orders().await.unwrap().is_none());
        assert!(!b.has_open_order("PLTR", Side::Buy).await.unwrap());
        assert_eq!(b.historical_close("PLTR", Utc::now()).await.unwrap(), None);
        b.place_order("PLTR", Side::Buy, 1).await.unwrap();
        assert_eq!(b.orders.lock().unwrap().len(), 1);
    }
}
