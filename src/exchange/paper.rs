//! Simulated order execution at the current market price.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::trading::FeeSchedule;

use super::{Fill, MarketData, OrderGateway, OrderSide};

/// Paper trading gateway. Fills every order in full at the latest price.
pub struct PaperGateway {
    market: Arc<dyn MarketData>,
    fees: FeeSchedule,
    /// Simulated quote balance; `None` means unlimited
    balance: Mutex<Option<Decimal>>,
}

impl PaperGateway {
    pub fn new(market: Arc<dyn MarketData>, fees: FeeSchedule) -> Self {
        Self {
            market,
            fees,
            balance: Mutex::new(None),
        }
    }

    /// Track a quote balance and reject buys that exceed it.
    pub fn with_balance(self, balance: Decimal) -> Self {
        Self {
            balance: Mutex::new(Some(balance)),
            ..self
        }
    }

    pub async fn balance(&self) -> Option<Decimal> {
        *self.balance.lock().await
    }

    async fn fill(&self, symbol: &str, side: OrderSide, quantity: Decimal) -> Result<Fill, GatewayError> {
        if quantity <= Decimal::ZERO {
            return Err(GatewayError::Rejected {
                code: -1013,
                message: format!("invalid quantity {}", quantity),
            });
        }

        let price = self.market.price(symbol).await?;
        if price <= Decimal::ZERO {
            return Err(GatewayError::InvalidResponse(format!(
                "non-positive price {} for {}",
                price, symbol
            )));
        }

        let notional = price * quantity;
        let fee = self.fees.fee_on(price, quantity);

        let mut balance = self.balance.lock().await;
        if let Some(available) = balance.as_mut() {
            match side {
                OrderSide::Buy => {
                    let cost = notional + fee;
                    if cost > *available {
                        return Err(GatewayError::InsufficientBalance(format!(
                            "need {} have {}",
                            cost, available
                        )));
                    }
                    *available -= cost;
                }
                OrderSide::Sell => *available += notional - fee,
            }
        }

        let fill = Fill {
            order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            price,
            quantity,
            fee,
            time: Utc::now(),
        };
        info!(
            symbol,
            side = ?side,
            price = %price,
            quantity = %quantity,
            order_id = %fill.order_id,
            "[PAPER] Order filled"
        );
        Ok(fill)
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn buy(&self, symbol: &str, quantity: Decimal) -> Result<Fill, GatewayError> {
        self.fill(symbol, OrderSide::Buy, quantity).await
    }

    async fn sell(&self, symbol: &str, quantity: Decimal) -> Result<Fill, GatewayError> {
        self.fill(symbol, OrderSide::Sell, quantity).await
    }

    async fn available_balance(&self) -> Result<Option<Decimal>, GatewayError> {
        Ok(self.balance().await)
    }

    fn is_paper(&self) -> bool {
        true
    }
}
