//! Position ledger.
//!
//! Owns position lifecycle transitions on top of the durable store. Every
//! P&L figure written here comes from the ledger's [`FeeSchedule`].

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::db::{CloseRecord, Database, NewPosition};
use crate::error::LedgerError;
use crate::models::{CloseReason, ClosedPosition, Position, PositionUpdate};

use super::{FeeSchedule, Pnl};

/// Parameters of a new position.
#[derive(Debug, Clone)]
pub struct OpenRequest<'a> {
    pub symbol: &'a str,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub take_profit_pct: Decimal,
    pub stop_loss_pct: Decimal,
    pub signal_tag: &'a str,
}

/// Position lifecycle over the durable store.
#[derive(Clone)]
pub struct PositionLedger {
    db: Database,
    fees: FeeSchedule,
}

impl PositionLedger {
    pub fn new(db: Database, fees: FeeSchedule) -> Self {
        Self { db, fees }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Open a position. Fails with [`LedgerError::AlreadyOpen`] if the symbol
    /// already has one.
    pub async fn open(&self, req: OpenRequest<'_>) -> Result<Position, LedgerError> {
        if self.db.fetch_open(req.symbol).await?.is_some() {
            return Err(LedgerError::AlreadyOpen(req.symbol.to_string()));
        }

        // A fresh position is marked at its own entry, which shows the fee drag.
        let pnl = self
            .fees
            .pnl(req.entry_price, req.entry_price, req.volume)
            .unwrap_or_default();

        let position = self
            .db
            .insert_position(&NewPosition {
                symbol: req.symbol,
                volume: req.volume,
                entry_price: req.entry_price,
                change_pct: pnl.pct,
                profit_dollars: pnl.dollars,
                entry_time: Utc::now(),
                take_profit_pct: req.take_profit_pct,
                stop_loss_pct: req.stop_loss_pct,
                signal_tag: req.signal_tag,
            })
            .await?;

        info!(
            symbol = %position.symbol,
            volume = %position.volume,
            entry_price = %position.entry_price,
            signal = %position.signal_tag,
            "Opened position"
        );
        Ok(position)
    }

    /// Open position for `symbol`, if any.
    pub async fn get_open(&self, symbol: &str) -> Result<Option<Position>, LedgerError> {
        self.db.fetch_open(symbol).await
    }

    pub async fn list_open(&self) -> Result<Vec<Position>, LedgerError> {
        self.db.fetch_all_open().await
    }

    /// Partial update of the open position for `symbol`.
    pub async fn update(&self, symbol: &str, update: &PositionUpdate) -> Result<(), LedgerError> {
        if update.is_empty() {
            return match self.db.fetch_open(symbol).await? {
                Some(_) => Ok(()),
                None => Err(LedgerError::NotFound(symbol.to_string())),
            };
        }
        if self.db.apply_update(symbol, update).await? {
            debug!(symbol, ?update, "Updated position");
            Ok(())
        } else {
            Err(LedgerError::NotFound(symbol.to_string()))
        }
    }

    /// Record a new market price and the unrealized P&L at that price.
    pub async fn mark(&self, position: &Position, price: Decimal) -> Result<Pnl, LedgerError> {
        let pnl = self.unrealized(position, price)?;
        self.update(&position.symbol, &PositionUpdate::mark(price, pnl))
            .await?;
        Ok(pnl)
    }

    /// Fee-adjusted P&L of `position` at `price`.
    pub fn unrealized(&self, position: &Position, price: Decimal) -> Result<Pnl, LedgerError> {
        self.fees
            .pnl(position.entry_price, price, position.volume)
            .ok_or_else(|| LedgerError::Corrupt {
                symbol: position.symbol.clone(),
                reason: format!("non-positive entry price {}", position.entry_price),
            })
    }

    /// Close the open position for `symbol` at `close_price`.
    pub async fn close(
        &self,
        symbol: &str,
        close_price: Decimal,
        reason: CloseReason,
    ) -> Result<ClosedPosition, LedgerError> {
        let open = self
            .db
            .fetch_open(symbol)
            .await?
            .ok_or_else(|| LedgerError::NotFound(symbol.to_string()))?;
        let pnl = self.unrealized(&open, close_price)?;

        let record = CloseRecord {
            close_price,
            close_time: Utc::now(),
            reason,
            change_pct: pnl.pct,
            profit_dollars: pnl.dollars,
        };
        let position = self
            .db
            .mark_closed(symbol, &record)
            .await?
            .ok_or_else(|| LedgerError::NotFound(symbol.to_string()))?;

        info!(
            symbol,
            reason = %reason,
            close_price = %close_price,
            pct = %pnl.pct.round_dp(2),
            profit = %pnl.dollars.round_dp(4),
            "Closed position"
        );
        Ok(ClosedPosition { position, pnl })
    }
}
