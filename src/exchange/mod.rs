//! Exchange boundary: market data and order execution.

mod binance;
mod paper;
mod retry;
mod types;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::GatewayError;

pub use binance::BinanceMarketClient;
pub use paper::PaperGateway;
pub use retry::{with_retry, RetryPolicy};

/// Symbol → last traded price.
pub type PriceMap = HashMap<String, Decimal>;

/// Read-only market data.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Latest prices of every symbol quoted in `quote`.
    async fn prices(&self, quote: &str) -> Result<PriceMap, GatewayError>;

    /// Latest price of one symbol.
    async fn price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    /// Symbols scheduled for delisting.
    async fn delisting(&self) -> Result<HashSet<String>, GatewayError>;
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// A completed market order.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Fee paid, in quote asset
    pub fee: Decimal,
    pub time: DateTime<Utc>,
}

/// Turns a desired buy or sell into a fill.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn buy(&self, symbol: &str, quantity: Decimal) -> Result<Fill, GatewayError>;

    async fn sell(&self, symbol: &str, quantity: Decimal) -> Result<Fill, GatewayError>;

    /// Quote balance free for new buys; `None` when the gateway does not track one.
    async fn available_balance(&self) -> Result<Option<Decimal>, GatewayError> {
        Ok(None)
    }

    /// Whether orders are simulated.
    fn is_paper(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub mod testing {
    //! In-process market for tests.

    use std::sync::{Arc, Mutex};

    use super::*;

    /// Market data backed by a shared map that tests mutate between cycles.
    #[derive(Clone, Default)]
    pub struct ManualMarket {
        prices: Arc<Mutex<PriceMap>>,
        delisting: Arc<Mutex<HashSet<String>>>,
        failure: Arc<Mutex<Option<GatewayError>>>,
    }

    impl ManualMarket {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_price(&self, symbol: &str, price: Decimal) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }

        pub fn set_delisting(&self, symbol: &str) {
            self.delisting.lock().unwrap().insert(symbol.to_string());
        }

        /// Make every call fail with `err` until cleared.
        pub fn fail_with(&self, err: Option<GatewayError>) {
            *self.failure.lock().unwrap() = err;
        }

        fn check(&self) -> Result<(), GatewayError> {
            match self.failure.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl MarketData for ManualMarket {
        async fn prices(&self, quote: &str) -> Result<PriceMap, GatewayError> {
            self.check()?;
            Ok(self
                .prices
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _)| s.ends_with(quote))
                .map(|(s, p)| (s.clone(), *p))
                .collect())
        }

        async fn price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
            self.check()?;
            self.prices
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .ok_or_else(|| GatewayError::InvalidResponse(format!("no price for {}", symbol)))
        }

        async fn delisting(&self) -> Result<HashSet<String>, GatewayError> {
            self.check()?;
            Ok(self.delisting.lock().unwrap().clone())
        }
    }
}
