//! Position model: one open or closed spot trade.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trading::Pnl;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// Price fell to the configured stop-loss below fee-adjusted entry.
    BaseStopLoss,
    /// Price reached take-profit with trailing disabled.
    TakeProfit,
    /// Armed position fell back to its trailing floor.
    TrailingStopLoss,
    /// Armed position reached its trailing ceiling.
    TrailingTakeProfit,
    /// Symbol is scheduled for delisting.
    Delisting,
    /// Session take-profit or stop-loss was crossed.
    SessionLimit,
    /// External sell signal.
    SellSignal,
    /// Operator requested the sale.
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::BaseStopLoss => "base_stop_loss",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::TrailingStopLoss => "trailing_stop_loss",
            CloseReason::TrailingTakeProfit => "trailing_take_profit",
            CloseReason::Delisting => "delisting",
            CloseReason::SessionLimit => "session_limit",
            CloseReason::SellSignal => "sell_signal",
            CloseReason::Manual => "manual",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "base_stop_loss" => CloseReason::BaseStopLoss,
            "take_profit" => CloseReason::TakeProfit,
            "trailing_stop_loss" => CloseReason::TrailingStopLoss,
            "trailing_take_profit" => CloseReason::TrailingTakeProfit,
            "delisting" => CloseReason::Delisting,
            "session_limit" => CloseReason::SessionLimit,
            "sell_signal" => CloseReason::SellSignal,
            "manual" => CloseReason::Manual,
            other => return Err(format!("unknown close reason: {}", other)),
        })
    }
}

/// Trailing prices of an armed position, all in fee-adjusted terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailState {
    pub high_water_price: Decimal,
    pub trail_floor_price: Decimal,
    pub trail_ceiling_price: Decimal,
}

/// A spot position as persisted in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Store row id
    pub id: i64,

    /// Trading pair, e.g. "BTCUSDT"
    pub symbol: String,

    /// Quantity held
    pub volume: Decimal,

    /// Raw fill price of the buy
    pub entry_price: Decimal,

    /// Last marked price
    pub current_price: Decimal,

    /// Fee-adjusted unrealized (or realized, once closed) change in percent
    pub change_pct: Decimal,

    /// Fee-adjusted unrealized (or realized, once closed) P&L in quote asset
    pub profit_dollars: Decimal,

    pub entry_time: DateTime<Utc>,

    /// Take-profit percentage relative to fee-adjusted entry
    pub take_profit_pct: Decimal,

    /// Stop-loss percentage relative to fee-adjusted entry
    pub stop_loss_pct: Decimal,

    pub trailing_active: bool,
    pub high_water_price: Option<Decimal>,
    pub trail_floor_price: Option<Decimal>,
    pub trail_ceiling_price: Option<Decimal>,

    /// Tag of the signal that opened the position
    pub signal_tag: String,

    pub closed: bool,
    pub close_price: Option<Decimal>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// Trailing prices, if the position is armed and all three are recorded.
    pub fn trail_state(&self) -> Option<TrailState> {
        if !self.trailing_active {
            return None;
        }
        Some(TrailState {
            high_water_price: self.high_water_price?,
            trail_floor_price: self.trail_floor_price?,
            trail_ceiling_price: self.trail_ceiling_price?,
        })
    }

    /// Market value at the last marked price.
    pub fn current_value(&self) -> Decimal {
        self.volume * self.current_price
    }

    /// Time held so far, or until close.
    pub fn holding_duration(&self) -> chrono::Duration {
        self.close_time.unwrap_or_else(Utc::now) - self.entry_time
    }
}

/// A closed position together with its realized P&L.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub pnl: Pnl,
}

impl ClosedPosition {
    pub fn symbol(&self) -> &str {
        &self.position.symbol
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.position.close_reason
    }
}

/// Partial update of an open position. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionUpdate {
    pub current_price: Option<Decimal>,
    pub change_pct: Option<Decimal>,
    pub profit_dollars: Option<Decimal>,
    pub take_profit_pct: Option<Decimal>,
    pub stop_loss_pct: Option<Decimal>,
    pub trailing_active: Option<bool>,
    pub high_water_price: Option<Decimal>,
    pub trail_floor_price: Option<Decimal>,
    pub trail_ceiling_price: Option<Decimal>,
}

impl PositionUpdate {
    /// Update that records a new mark and its unrealized P&L.
    pub fn mark(price: Decimal, pnl: Pnl) -> Self {
        Self {
            current_price: Some(price),
            change_pct: Some(pnl.pct),
            profit_dollars: Some(pnl.dollars),
            ..Self::default()
        }
    }

    /// Update that arms trailing or moves its prices.
    pub fn trail(state: TrailState) -> Self {
        Self {
            trailing_active: Some(true),
            high_water_price: Some(state.high_water_price),
            trail_floor_price: Some(state.trail_floor_price),
            trail_ceiling_price: Some(state.trail_ceiling_price),
            ..Self::default()
        }
    }

    /// Merge another update into this one; fields set in `other` win.
    pub fn merge(mut self, other: PositionUpdate) -> Self {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            current_price,
            change_pct,
            profit_dollars,
            take_profit_pct,
            stop_loss_pct,
            trailing_active,
            high_water_price,
            trail_floor_price,
            trail_ceiling_price
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == PositionUpdate::default()
    }
}
