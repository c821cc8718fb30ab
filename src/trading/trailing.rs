//! Trailing take-profit / stop-loss engine.
//!
//! Each open position is either flat (not armed) or armed. Once armed it
//! trails a high-water mark with a floor below and a ceiling above it. All
//! prices compared here are fee-adjusted: the entry includes the buy fee and
//! the market price is net of the sell fee.
//!
//! Checks run in a fixed order and the first match wins:
//! 1. malformed prices skip the position
//! 2. base stop-loss
//! 3. delisting
//! 4. flat: arm (trailing on) or take profit (trailing off)
//! 5. armed: ceiling, ratchet, floor

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{CloseReason, Position, TrailState};

use super::{FeeSchedule, TradingConfig};

/// Outcome of evaluating one position at one price.
#[derive(Debug, Clone, PartialEq)]
pub enum TrailDecision {
    /// Input was unusable; leave the position alone this cycle.
    Skip(String),
    /// Nothing to do.
    Hold,
    /// Start trailing with the given prices. Never sells.
    Arm(TrailState),
    /// Move the trailing prices up.
    Ratchet(TrailState),
    /// Sell the position.
    Close(CloseReason),
}

/// Price thresholds of a position, all fee-adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub entry_plus_fees: Decimal,
    pub price_after_fees: Decimal,
    pub base_take_profit: Decimal,
    pub base_stop_loss: Decimal,
}

/// Pure trailing decision function, parameterized by one config snapshot.
#[derive(Debug, Clone, Copy)]
pub struct TrailingStopEngine {
    fees: FeeSchedule,
    trailing_enabled: bool,
    sl_fraction: Decimal,
    tp_fraction: Decimal,
}

impl TrailingStopEngine {
    pub fn new(
        fees: FeeSchedule,
        trailing_enabled: bool,
        sl_fraction: Decimal,
        tp_fraction: Decimal,
    ) -> Self {
        Self {
            fees,
            trailing_enabled,
            sl_fraction,
            tp_fraction,
        }
    }

    pub fn from_config(config: &TradingConfig) -> Self {
        Self::new(
            config.fee_schedule(),
            config.trailing_enabled(),
            config.trailing_sl_fraction(),
            config.trailing_tp_fraction(),
        )
    }

    /// Fee-adjusted thresholds for `position` at `price`, or `None` when the
    /// entry or price is not positive.
    pub fn thresholds(&self, position: &Position, price: Decimal) -> Option<Thresholds> {
        let entry_plus_fees = self.fees.effective_buy(position.entry_price);
        if entry_plus_fees <= Decimal::ZERO || price <= Decimal::ZERO {
            return None;
        }
        Some(Thresholds {
            entry_plus_fees,
            price_after_fees: self.fees.effective_sell(price),
            base_take_profit: entry_plus_fees * (Decimal::ONE + position.take_profit_pct / dec!(100)),
            base_stop_loss: entry_plus_fees * (Decimal::ONE - position.stop_loss_pct / dec!(100)),
        })
    }

    /// Trailing prices around a new high-water mark. The floor never drops
    /// below `previous_floor`.
    pub fn trail_from(&self, high_water: Decimal, previous_floor: Option<Decimal>) -> TrailState {
        let candidate_floor = high_water * (Decimal::ONE - self.sl_fraction);
        TrailState {
            high_water_price: high_water,
            trail_floor_price: previous_floor.map_or(candidate_floor, |f| f.max(candidate_floor)),
            trail_ceiling_price: high_water * (Decimal::ONE + self.tp_fraction),
        }
    }

    /// Decide what to do with `position` at market `price`.
    pub fn evaluate(&self, position: &Position, price: Decimal, delisting: bool) -> TrailDecision {
        let Some(t) = self.thresholds(position, price) else {
            return TrailDecision::Skip(format!(
                "invalid price (entry {}, market {})",
                position.entry_price, price
            ));
        };
        let paf = t.price_after_fees;

        if paf <= t.base_stop_loss {
            return TrailDecision::Close(CloseReason::BaseStopLoss);
        }
        if delisting {
            return TrailDecision::Close(CloseReason::Delisting);
        }

        if position.trailing_active {
            // Armed positions keep trailing even if trailing was switched off since.
            return match position.trail_state() {
                Some(state) => self.evaluate_armed(state, paf),
                None => TrailDecision::Arm(self.trail_from(paf, position.trail_floor_price)),
            };
        }

        if paf >= t.base_take_profit {
            if self.trailing_enabled {
                return TrailDecision::Arm(self.trail_from(paf, None));
            }
            return TrailDecision::Close(CloseReason::TakeProfit);
        }

        TrailDecision::Hold
    }

    fn evaluate_armed(&self, state: TrailState, paf: Decimal) -> TrailDecision {
        // Ceiling is checked against the prices set on the previous tick; a
        // ratchet would otherwise always lift it out of reach.
        if paf >= state.trail_ceiling_price {
            return TrailDecision::Close(CloseReason::TrailingTakeProfit);
        }
        if paf > state.high_water_price {
            return TrailDecision::Ratchet(self.trail_from(paf, Some(state.trail_floor_price)));
        }
        if paf <= state.trail_floor_price {
            return TrailDecision::Close(CloseReason::TrailingStopLoss);
        }
        TrailDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;

    use crate::models::PositionUpdate;

    fn engine(trailing: bool) -> TrailingStopEngine {
        // 0.075% fee, 2% trailing stop-loss, 1% trailing take-profit
        TrailingStopEngine::new(
            FeeSchedule::from_percent(dec!(0.075)),
            trailing,
            dec!(0.02),
            dec!(0.01),
        )
    }

    fn make_position(entry: Decimal) -> Position {
        Position {
            id: 1,
            symbol: "BTCUSDT".to_string(),
            volume: dec!(1),
            entry_price: entry,
            current_price: entry,
            change_pct: Decimal::ZERO,
            profit_dollars: Decimal::ZERO,
            entry_time: Utc::now(),
            take_profit_pct: dec!(2),
            stop_loss_pct: dec!(10),
            trailing_active: false,
            high_water_price: None,
            trail_floor_price: None,
            trail_ceiling_price: None,
            signal_tag: "test".to_string(),
            closed: false,
            close_price: None,
            close_time: None,
            close_reason: None,
        }
    }

    fn apply(position: &mut Position, state: TrailState) {
        let update = PositionUpdate::trail(state);
        position.trailing_active = update.trailing_active.unwrap_or(false);
        position.high_water_price = update.high_water_price;
        position.trail_floor_price = update.trail_floor_price;
        position.trail_ceiling_price = update.trail_ceiling_price;
    }

    #[test]
    fn test_arming_scenario() {
        let engine = engine(true);
        let mut position = make_position(dec!(100));

        let t = engine.thresholds(&position, dec!(102.20)).unwrap();
        assert_eq!(t.entry_plus_fees, dec!(100.075));
        // Raw price needed to reach base TP is about 102.15
        assert!(t.base_take_profit > dec!(102.07) && t.base_take_profit < dec!(102.08));

        let TrailDecision::Arm(state) = engine.evaluate(&position, dec!(102.20), false) else {
            panic!("expected arm");
        };
        let hw = state.high_water_price;
        assert_eq!(hw, dec!(102.20) * dec!(0.99925));
        assert_eq!(state.trail_floor_price, hw * dec!(0.98));
        assert_eq!(state.trail_ceiling_price, hw * dec!(1.01));
        apply(&mut position, state);

        // Above floor, below ceiling
        assert_eq!(engine.evaluate(&position, dec!(101.00), false), TrailDecision::Hold);

        // Just under the floor, in raw price terms
        let floor_raw = state.trail_floor_price / dec!(0.99925);
        assert_eq!(
            engine.evaluate(&position, floor_raw - dec!(0.01), false),
            TrailDecision::Close(CloseReason::TrailingStopLoss)
        );
    }

    #[test]
    fn test_base_stop_loss_precedes_trailing_and_delisting() {
        let engine = engine(true);
        let mut position = make_position(dec!(100));
        apply(&mut position, engine.trail_from(dec!(120), None));

        assert_eq!(
            engine.evaluate(&position, dec!(85), true),
            TrailDecision::Close(CloseReason::BaseStopLoss)
        );
        assert_eq!(
            engine.evaluate(&make_position(dec!(100)), dec!(90), false),
            TrailDecision::Close(CloseReason::BaseStopLoss)
        );
    }

    #[test]
    fn test_delisting_closes_before_profit_logic() {
        let engine = engine(true);
        assert_eq!(
            engine.evaluate(&make_position(dec!(100)), dec!(105), true),
            TrailDecision::Close(CloseReason::Delisting)
        );
    }

    #[test]
    fn test_take_profit_without_trailing() {
        let engine = engine(false);
        let position = make_position(dec!(100));
        assert_eq!(engine.evaluate(&position, dec!(101), false), TrailDecision::Hold);
        assert_eq!(
            engine.evaluate(&position, dec!(102.20), false),
            TrailDecision::Close(CloseReason::TakeProfit)
        );
    }

    #[test]
    fn test_armed_ratchet_and_ceiling() {
        let engine = engine(true);
        let mut position = make_position(dec!(100));
        let start = engine.trail_from(dec!(103), None);
        apply(&mut position, start);

        // New high moves everything up
        let TrailDecision::Ratchet(next) = engine.evaluate(&position, dec!(104), false) else {
            panic!("expected ratchet");
        };
        assert!(next.high_water_price > start.high_water_price);
        assert!(next.trail_floor_price > start.trail_floor_price);
        apply(&mut position, next);

        // A jump through the ceiling takes profit
        assert_eq!(
            engine.evaluate(&position, dec!(110), false),
            TrailDecision::Close(CloseReason::TrailingTakeProfit)
        );
    }

    #[test]
    fn test_armed_position_keeps_trailing_when_disabled() {
        let mut position = make_position(dec!(100));
        apply(&mut position, engine(true).trail_from(dec!(103), None));
        assert_eq!(engine(false).evaluate(&position, dec!(103), false), TrailDecision::Hold);
    }

    #[test]
    fn test_malformed_input_is_skipped() {
        let engine = engine(true);
        assert!(matches!(
            engine.evaluate(&make_position(dec!(100)), Decimal::ZERO, false),
            TrailDecision::Skip(_)
        ));
        assert!(matches!(
            engine.evaluate(&make_position(Decimal::ZERO), dec!(10), true),
            TrailDecision::Skip(_)
        ));
    }

    proptest! {
        #[test]
        fn prop_trail_floor_never_decreases(
            prices in proptest::collection::vec(95_000u32..120_000u32, 1..60)
        ) {
            let engine = engine(true);
            let mut position = make_position(dec!(100));
            apply(&mut position, engine.trail_from(dec!(102.5), None));
            let mut floor = position.trail_floor_price.unwrap();

            for raw in prices {
                let price = Decimal::from(raw) / dec!(1000);
                match engine.evaluate(&position, price, false) {
                    TrailDecision::Ratchet(state) | TrailDecision::Arm(state) => {
                        prop_assert!(state.trail_floor_price >= floor);
                        floor = state.trail_floor_price;
                        apply(&mut position, state);
                    }
                    TrailDecision::Close(_) => break,
                    TrailDecision::Hold | TrailDecision::Skip(_) => {}
                }
                prop_assert_eq!(position.trail_floor_price, Some(floor));
            }
        }
    }
}
