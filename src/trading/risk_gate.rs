//! Signal admission.
//!
//! The [`RiskGate`] filters one cycle's signals against the portfolio. Sells
//! are only dropped for cooloff or delisting; buys must also find a free
//! slot, an open session and room under the exposure cap.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::error::ErrorCategory;
use crate::models::Signal;

use super::TradingConfig;

/// Symbol → time until which re-entry is blocked.
#[derive(Debug, Clone, Default)]
pub struct CooloffRegistry {
    expiries: HashMap<String, DateTime<Utc>>,
}

impl CooloffRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block `symbol` until `until`.
    pub fn set(&mut self, symbol: &str, until: DateTime<Utc>) {
        self.expiries.insert(symbol.to_string(), until);
    }

    /// Start a cooloff after a close. Losing and barely profitable closes
    /// stretch the base window by their configured multipliers.
    pub fn record_close(
        &mut self,
        symbol: &str,
        closed_at: DateTime<Utc>,
        realized_pct: Decimal,
        config: &TradingConfig,
    ) -> DateTime<Utc> {
        let until = closed_at
            .checked_add_signed(cooloff_duration(realized_pct, config))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.set(symbol, until);
        until
    }

    /// Expiry if `symbol` is still cooling off at `now`.
    pub fn active_until(&self, symbol: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expiries.get(symbol).copied().filter(|until| now < *until)
    }

    /// Drop expired entries.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.expiries.retain(|_, until| now < *until);
    }

    pub fn len(&self) -> usize {
        self.expiries.len()
    }
}

fn cooloff_duration(realized_pct: Decimal, config: &TradingConfig) -> Duration {
    let multiplier = if realized_pct < dec!(-5) {
        config.cooloff_multiplier_loss
    } else if realized_pct < dec!(2) {
        config.cooloff_multiplier_small_profit
    } else {
        Decimal::ONE
    };
    let millis = Decimal::from(config.cooloff_minutes.max(0))
        .checked_mul(multiplier.max(Decimal::ZERO))
        .and_then(|minutes| minutes.checked_mul(dec!(60000)))
        .and_then(|millis| millis.round().to_i64())
        .unwrap_or(i64::MAX);
    Duration::try_milliseconds(millis).unwrap_or(Duration::MAX)
}

/// What the gate needs to know about the portfolio.
#[derive(Debug, Clone, Default)]
pub struct PortfolioSnapshot {
    pub open_symbols: HashSet<String>,
    /// Current value of all open positions
    pub exposure: Decimal,
    /// Symbols scheduled for delisting
    pub delisting: HashSet<String>,
    /// Session breaker verdict for new entries
    pub session_allows_entries: bool,
    /// Set after the exchange reported insufficient balance
    pub balance_exhausted: bool,
}

/// Why a signal was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    WrongQuote,
    NoSlots,
    Cooloff { until: DateTime<Utc> },
    SessionLimit,
    InsufficientBalance,
    Delisting,
    AlreadyOpen,
    NoPosition,
    ExposureLimit,
}

impl Rejection {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Rejection::InsufficientBalance | Rejection::Delisting => ErrorCategory::Exchange,
            _ => ErrorCategory::Data,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::WrongQuote => write!(f, "symbol not in quote universe"),
            Rejection::NoSlots => write!(f, "no free trade slots"),
            Rejection::Cooloff { until } => write!(f, "cooling off until {}", until.format("%H:%M:%S")),
            Rejection::SessionLimit => write!(f, "session limit blocks new entries"),
            Rejection::InsufficientBalance => write!(f, "insufficient balance"),
            Rejection::Delisting => write!(f, "scheduled for delisting"),
            Rejection::AlreadyOpen => write!(f, "position already open"),
            Rejection::NoPosition => write!(f, "no open position to sell"),
            Rejection::ExposureLimit => write!(f, "portfolio exposure limit reached"),
        }
    }
}

/// Admitted and rejected signals of one validation pass.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub admitted: Vec<Signal>,
    pub rejected: Vec<(Signal, Rejection)>,
}

/// Admission checks for one cycle.
pub struct RiskGate<'a> {
    config: &'a TradingConfig,
    cooloff: &'a CooloffRegistry,
}

impl<'a> RiskGate<'a> {
    pub fn new(config: &'a TradingConfig, cooloff: &'a CooloffRegistry) -> Self {
        Self { config, cooloff }
    }

    /// Filter `signals` against `snapshot`. Only the first signal per symbol
    /// is considered; slots and exposure are consumed as buys are admitted.
    pub fn validate(
        &self,
        signals: impl IntoIterator<Item = Signal>,
        snapshot: &PortfolioSnapshot,
        now: DateTime<Utc>,
    ) -> GateOutcome {
        let mut outcome = GateOutcome::default();
        let mut seen = HashSet::new();
        let mut slots = self
            .config
            .trade_slots
            .saturating_sub(snapshot.open_symbols.len());
        let mut exposure = snapshot.exposure;

        for signal in signals {
            if !seen.insert(signal.symbol().to_string()) {
                continue;
            }

            let verdict = match &signal {
                Signal::Sell { symbol, .. } => self.check_sell(symbol, snapshot, now),
                Signal::Buy { symbol, .. } => self.check_buy(symbol, snapshot, slots, exposure, now),
            };

            match verdict {
                Ok(()) => {
                    if let Signal::Buy { .. } = signal {
                        slots -= 1;
                        exposure += self.config.trade_total;
                    }
                    debug!(symbol = signal.symbol(), kind = %signal.kind(), "Signal admitted");
                    outcome.admitted.push(signal);
                }
                Err(rejection) => {
                    info!(
                        symbol = signal.symbol(),
                        kind = %signal.kind(),
                        source = signal.source(),
                        category = %rejection.category(),
                        "Signal rejected: {}",
                        rejection
                    );
                    outcome.rejected.push((signal, rejection));
                }
            }
        }

        outcome
    }

    fn check_sell(
        &self,
        symbol: &str,
        snapshot: &PortfolioSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if let Some(until) = self.cooloff.active_until(symbol, now) {
            return Err(Rejection::Cooloff { until });
        }
        // The sweep closes delisting symbols with their own reason.
        if self.is_delisting(symbol, snapshot) {
            return Err(Rejection::Delisting);
        }
        if !snapshot.open_symbols.contains(symbol) {
            return Err(Rejection::NoPosition);
        }
        Ok(())
    }

    fn check_buy(
        &self,
        symbol: &str,
        snapshot: &PortfolioSnapshot,
        slots: usize,
        exposure: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        if !self.config.accepts_symbol(symbol) {
            return Err(Rejection::WrongQuote);
        }
        if slots == 0 {
            return Err(Rejection::NoSlots);
        }
        if let Some(until) = self.cooloff.active_until(symbol, now) {
            return Err(Rejection::Cooloff { until });
        }
        if !snapshot.session_allows_entries {
            return Err(Rejection::SessionLimit);
        }
        if snapshot.balance_exhausted {
            return Err(Rejection::InsufficientBalance);
        }
        if self.is_delisting(symbol, snapshot) {
            return Err(Rejection::Delisting);
        }
        if snapshot.open_symbols.contains(symbol) {
            return Err(Rejection::AlreadyOpen);
        }
        if let Some(cap) = self.config.max_portfolio_exposure {
            if exposure + self.config.trade_total > cap {
                return Err(Rejection::ExposureLimit);
            }
        }
        Ok(())
    }

    fn is_delisting(&self, symbol: &str, snapshot: &PortfolioSnapshot) -> bool {
        snapshot.delisting.contains(symbol) || self.config.delisted_symbols.iter().any(|s| s == symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(slots: usize) -> TradingConfig {
        TradingConfig {
            trade_slots: slots,
            ..TradingConfig::default()
        }
    }

    fn snapshot(open: &[&str]) -> PortfolioSnapshot {
        PortfolioSnapshot {
            open_symbols: open.iter().map(|s| s.to_string()).collect(),
            session_allows_entries: true,
            ..PortfolioSnapshot::default()
        }
    }

    fn buys(symbols: &[&str]) -> Vec<Signal> {
        symbols.iter().map(|s| Signal::buy(*s, "test")).collect()
    }

    #[test]
    fn test_slot_exhaustion_admits_exactly_free_slots() {
        let config = config(2);
        let cooloff = CooloffRegistry::new();
        let gate = RiskGate::new(&config, &cooloff);

        let outcome = gate.validate(
            buys(&["AUSDT", "BUSDT", "CUSDT"]),
            &snapshot(&[]),
            Utc::now(),
        );
        assert_eq!(outcome.admitted.len(), 2);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].1, Rejection::NoSlots);
    }

    #[test]
    fn test_cooloff_window_boundaries() {
        let config = config(5);
        let closed_at = Utc::now();
        let mut cooloff = CooloffRegistry::new();
        let until = cooloff.record_close("AUSDT", closed_at, dec!(3), &config);
        assert_eq!(until, closed_at + Duration::minutes(config.cooloff_minutes));

        let gate = RiskGate::new(&config, &cooloff);
        let early = gate.validate(buys(&["AUSDT"]), &snapshot(&[]), until - Duration::seconds(1));
        assert!(early.admitted.is_empty());
        assert!(matches!(early.rejected[0].1, Rejection::Cooloff { .. }));

        let at_expiry = gate.validate(buys(&["AUSDT"]), &snapshot(&[]), until);
        assert_eq!(at_expiry.admitted.len(), 1);
    }

    #[test]
    fn test_adaptive_cooloff_multipliers() {
        let config = TradingConfig {
            cooloff_minutes: 10,
            cooloff_multiplier_loss: dec!(3),
            cooloff_multiplier_small_profit: dec!(1.5),
            ..TradingConfig::default()
        };
        let now = Utc::now();
        let mut cooloff = CooloffRegistry::new();
        assert_eq!(cooloff.record_close("A", now, dec!(-6), &config), now + Duration::minutes(30));
        assert_eq!(cooloff.record_close("B", now, dec!(1), &config), now + Duration::minutes(15));
        assert_eq!(cooloff.record_close("C", now, dec!(4), &config), now + Duration::minutes(10));

        cooloff.prune(now + Duration::minutes(20));
        assert_eq!(cooloff.len(), 1);
        assert!(cooloff.active_until("A", now + Duration::minutes(20)).is_some());
    }

    #[test]
    fn test_oversized_cooloff_saturates() {
        let config = TradingConfig {
            cooloff_minutes: 1_000_000_000_000,
            cooloff_multiplier_loss: dec!(1000000),
            ..TradingConfig::default()
        };
        let now = Utc::now();
        let mut cooloff = CooloffRegistry::new();
        assert_eq!(cooloff.record_close("A", now, dec!(-8), &config), DateTime::<Utc>::MAX_UTC);
        assert_eq!(cooloff.active_until("A", now), Some(DateTime::<Utc>::MAX_UTC));

        let negative = TradingConfig {
            cooloff_multiplier_small_profit: dec!(-2),
            ..TradingConfig::default()
        };
        assert_eq!(cooloff.record_close("B", now, dec!(1), &negative), now);
    }

    #[test]
    fn test_buy_checks() {
        let config = TradingConfig {
            trade_total: dec!(100),
            max_portfolio_exposure: Some(dec!(250)),
            delisted_symbols: vec!["DUSDT".to_string()],
            ..config(5)
        };
        let cooloff = CooloffRegistry::new();
        let gate = RiskGate::new(&config, &cooloff);
        let mut snap = snapshot(&["OPENUSDT"]);
        snap.delisting.insert("EUSDT".to_string());
        snap.exposure = dec!(100);

        let outcome = gate.validate(
            buys(&["BTCBUSD", "DUSDT", "EUSDT", "OPENUSDT", "AUSDT", "AUSDT", "BUSDT"]),
            &snap,
            Utc::now(),
        );
        let reasons: Vec<_> = outcome.rejected.iter().map(|(s, r)| (s.symbol(), r.clone())).collect();
        assert_eq!(
            reasons,
            vec![
                ("BTCBUSD", Rejection::WrongQuote),
                ("DUSDT", Rejection::Delisting),
                ("EUSDT", Rejection::Delisting),
                ("OPENUSDT", Rejection::AlreadyOpen),
                ("BUSDT", Rejection::ExposureLimit),
            ]
        );
        assert_eq!(outcome.admitted.len(), 1);
        assert_eq!(outcome.admitted[0].symbol(), "AUSDT");
    }

    #[test]
    fn test_session_and_balance_block_buys_not_sells() {
        let config = config(5);
        let cooloff = CooloffRegistry::new();
        let gate = RiskGate::new(&config, &cooloff);
        let mut snap = snapshot(&["AUSDT"]);
        snap.session_allows_entries = false;

        let signals = vec![Signal::sell("AUSDT", "test"), Signal::buy("BUSDT", "test")];
        let outcome = gate.validate(signals, &snap, Utc::now());
        assert_eq!(outcome.admitted.len(), 1);
        assert!(outcome.admitted[0].is_sell());
        assert_eq!(outcome.rejected[0].1, Rejection::SessionLimit);

        snap.session_allows_entries = true;
        snap.balance_exhausted = true;
        let outcome = gate.validate(buys(&["BUSDT"]), &snap, Utc::now());
        assert_eq!(outcome.rejected[0].1, Rejection::InsufficientBalance);
        assert_eq!(outcome.rejected[0].1.category(), ErrorCategory::Exchange);
    }

    #[test]
    fn test_sell_ignores_slots_but_needs_position() {
        let config = config(1);
        let cooloff = CooloffRegistry::new();
        let gate = RiskGate::new(&config, &cooloff);
        let snap = snapshot(&["AUSDT"]);

        let outcome = gate.validate(
            vec![Signal::sell("AUSDT", "test"), Signal::sell("ZUSDT", "test")],
            &snap,
            Utc::now(),
        );
        assert_eq!(outcome.admitted.len(), 1);
        assert_eq!(outcome.rejected[0].1, Rejection::NoPosition);
    }
}
