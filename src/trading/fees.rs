//! Fee-adjusted P&L.
//!
//! Every profit figure in the engine, realized or unrealized, goes through
//! [`FeeSchedule::pnl`]. The buy side is inflated by the fee rate and the sell
//! side deflated by it, so a flat round trip shows the fee drag.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Profit of a position at some price, net of buy and sell fees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pnl {
    /// Percent change relative to the fee-adjusted entry
    pub pct: Decimal,
    /// Profit in quote asset
    pub dollars: Decimal,
}

/// Proportional trading fee applied on both legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    rate: Decimal,
}

impl FeeSchedule {
    /// Build from a fractional rate (0.001 = 0.1%).
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }

    /// Build from a percentage (0.1 = 0.1%).
    pub fn from_percent(percent: Decimal) -> Self {
        Self::new(percent / dec!(100))
    }

    /// Entry price including the buy fee.
    pub fn effective_buy(&self, entry_price: Decimal) -> Decimal {
        entry_price * (Decimal::ONE + self.rate)
    }

    /// Exit price net of the sell fee.
    pub fn effective_sell(&self, price: Decimal) -> Decimal {
        price * (Decimal::ONE - self.rate)
    }

    /// Fee-adjusted P&L of `volume` bought at `entry_price` and valued at `price`.
    ///
    /// Returns `None` when the fee-adjusted entry is not positive.
    pub fn pnl(&self, entry_price: Decimal, price: Decimal, volume: Decimal) -> Option<Pnl> {
        let buy = self.effective_buy(entry_price);
        if buy <= Decimal::ZERO {
            return None;
        }
        let sell = self.effective_sell(price);
        let diff = sell - buy;
        Some(Pnl {
            pct: diff / buy * dec!(100),
            dollars: diff * volume,
        })
    }

    /// Fee paid on a fill of `quantity` at `price`.
    pub fn fee_on(&self, price: Decimal, quantity: Decimal) -> Decimal {
        price * quantity * self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_round_trip_shows_fee_drag() {
        let fees = FeeSchedule::from_percent(dec!(0.1));
        let pnl = fees.pnl(dec!(100), dec!(100), dec!(1)).unwrap();

        // (99.9 - 100.1) / 100.1 * 100
        assert!(pnl.pct < dec!(-0.199) && pnl.pct > dec!(-0.2));
        assert_eq!(pnl.dollars, dec!(-0.2));
    }

    #[test]
    fn test_profit_scales_with_volume() {
        let fees = FeeSchedule::new(Decimal::ZERO);
        let pnl = fees.pnl(dec!(50), dec!(55), dec!(4)).unwrap();
        assert_eq!(pnl.pct, dec!(10));
        assert_eq!(pnl.dollars, dec!(20));
    }

    #[test]
    fn test_non_positive_entry_has_no_pnl() {
        let fees = FeeSchedule::from_percent(dec!(0.075));
        assert!(fees.pnl(Decimal::ZERO, dec!(10), dec!(1)).is_none());
        assert!(fees.pnl(dec!(-1), dec!(10), dec!(1)).is_none());
    }

    #[test]
    fn test_effective_prices() {
        let fees = FeeSchedule::from_percent(dec!(0.075));
        assert_eq!(fees.effective_buy(dec!(100)), dec!(100.075));
        assert_eq!(fees.effective_sell(dec!(100)), dec!(99.925));
        assert_eq!(fees.fee_on(dec!(200), dec!(2)), dec!(0.3));
    }
}
