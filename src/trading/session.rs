//! Session-wide profit limits.
//!
//! Session figures are percentages of session capital
//! (`TRADE_TOTAL * TRADE_SLOTS`). They start fresh every run.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::models::{CloseReason, ClosedPosition};

use super::TradingConfig;

/// Result of a session limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    Continue,
    TakeProfitHit,
    StopLossHit,
}

impl SessionVerdict {
    pub fn is_hit(&self) -> bool {
        !matches!(self, SessionVerdict::Continue)
    }
}

impl fmt::Display for SessionVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionVerdict::Continue => write!(f, "continue"),
            SessionVerdict::TakeProfitHit => write!(f, "session take-profit hit"),
            SessionVerdict::StopLossHit => write!(f, "session stop-loss hit"),
        }
    }
}

/// Per-run session statistics.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub session_start: DateTime<Utc>,
    /// Realized P&L since start as read from the store, percent of session capital
    pub realized_pnl_pct: Decimal,
    /// Sum of profitable closes, percent of session capital
    pub net_profit: Decimal,
    /// Sum of losing closes as a positive number, percent of session capital
    pub net_loss: Decimal,
    pub wins: u32,
    pub losses: u32,
    pub closes_by_reason: BTreeMap<&'static str, u32>,
}

impl SessionStats {
    pub fn new(session_start: DateTime<Utc>) -> Self {
        Self {
            session_start,
            realized_pnl_pct: Decimal::ZERO,
            net_profit: Decimal::ZERO,
            net_loss: Decimal::ZERO,
            wins: 0,
            losses: 0,
            closes_by_reason: BTreeMap::new(),
        }
    }

    pub fn net(&self) -> Decimal {
        self.net_profit - self.net_loss
    }

    pub fn total_closes(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> Decimal {
        match self.total_closes() {
            0 => Decimal::ZERO,
            n => Decimal::from(self.wins) / Decimal::from(n) * dec!(100),
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Session Report ===")?;
        writeln!(f, "Started:        {}", self.session_start.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Realized P&L:   {:.2}%", self.realized_pnl_pct)?;
        writeln!(f, "Net profit:     {:.2}%", self.net_profit)?;
        writeln!(f, "Net loss:       {:.2}%", self.net_loss)?;
        writeln!(
            f,
            "Closes:         {} ({} wins / {} losses, {:.1}% win rate)",
            self.total_closes(),
            self.wins,
            self.losses,
            self.win_rate()
        )?;
        for (reason, count) in &self.closes_by_reason {
            writeln!(f, "  {:<22} {}", reason, count)?;
        }
        Ok(())
    }
}

/// Tracks session P&L and decides when the whole session must stop.
#[derive(Debug, Clone)]
pub struct SessionCircuitBreaker {
    enabled: bool,
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
    margin_sl: Decimal,
    margin_tp: Decimal,
    halted: Option<SessionVerdict>,
    stats: SessionStats,
}

impl SessionCircuitBreaker {
    pub fn new(config: &TradingConfig, session_start: DateTime<Utc>) -> Self {
        let mut breaker = Self {
            enabled: false,
            take_profit_pct: Decimal::ZERO,
            stop_loss_pct: Decimal::ZERO,
            margin_sl: Decimal::ZERO,
            margin_tp: Decimal::ZERO,
            halted: None,
            stats: SessionStats::new(session_start),
        };
        breaker.apply_config(config);
        breaker
    }

    /// Pick up thresholds from a new config snapshot.
    pub fn apply_config(&mut self, config: &TradingConfig) {
        self.enabled = config.session_tpsl_override;
        self.take_profit_pct = config.session_take_profit_pct;
        self.stop_loss_pct = -config.session_stop_loss_pct.abs();
        self.margin_sl = config.session_entry_margin_sl;
        self.margin_tp = config.session_entry_margin_tp;
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn session_start(&self) -> DateTime<Utc> {
        self.stats.session_start
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn halted(&self) -> Option<SessionVerdict> {
        self.halted
    }

    /// Accumulate a realized P&L delta, in percent of session capital.
    pub fn record(&mut self, profit_delta_pct: Decimal) {
        if profit_delta_pct >= Decimal::ZERO {
            self.stats.net_profit += profit_delta_pct;
        } else {
            self.stats.net_loss += -profit_delta_pct;
        }
    }

    /// Record a closed position against session capital.
    pub fn record_close(&mut self, closed: &ClosedPosition, session_capital: Decimal) {
        if session_capital > Decimal::ZERO {
            self.record(closed.pnl.dollars / session_capital * dec!(100));
        }
        if closed.pnl.dollars > Decimal::ZERO {
            self.stats.wins += 1;
        } else {
            self.stats.losses += 1;
        }
        let reason = closed.reason().unwrap_or(CloseReason::Manual).as_str();
        *self.stats.closes_by_reason.entry(reason).or_insert(0) += 1;
    }

    /// Store the realized session percentage read from the store.
    pub fn set_realized_pct(&mut self, pct: Decimal) {
        self.stats.realized_pnl_pct = pct;
    }

    /// Compare the session percentage against the limits.
    pub fn check(&self, current_session_pct: Decimal) -> SessionVerdict {
        if !self.enabled {
            return SessionVerdict::Continue;
        }
        if current_session_pct >= self.take_profit_pct {
            SessionVerdict::TakeProfitHit
        } else if current_session_pct <= self.stop_loss_pct {
            SessionVerdict::StopLossHit
        } else {
            SessionVerdict::Continue
        }
    }

    /// Stop new entries for the rest of the run.
    pub fn halt(&mut self, verdict: SessionVerdict) {
        if verdict.is_hit() && self.halted.is_none() {
            self.halted = Some(verdict);
        }
    }

    /// False once halted, or when net session P&L is close enough to a limit
    /// that one more cycle could overshoot it.
    pub fn allows_new_entries(&self) -> bool {
        if self.halted.is_some() {
            return false;
        }
        if !self.enabled {
            return true;
        }
        let net = self.stats.net();
        net > self.stop_loss_pct * self.margin_sl && net < self.take_profit_pct * self.margin_tp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(enabled: bool) -> SessionCircuitBreaker {
        let config = TradingConfig {
            session_tpsl_override: enabled,
            session_take_profit_pct: dec!(5),
            session_stop_loss_pct: dec!(-10),
            ..TradingConfig::default()
        };
        SessionCircuitBreaker::new(&config, Utc::now())
    }

    #[test]
    fn test_losses_past_stop_loss_trigger_hit() {
        let mut breaker = breaker(true);
        breaker.record(dec!(-6));
        breaker.record(dec!(-4.5));
        assert_eq!(breaker.stats().net_loss, dec!(10.5));
        assert_eq!(breaker.stats().net_profit, Decimal::ZERO);
        assert_eq!(breaker.check(breaker.stats().net()), SessionVerdict::StopLossHit);
    }

    #[test]
    fn test_take_profit_hit_and_disabled_breaker() {
        assert_eq!(breaker(true).check(dec!(5)), SessionVerdict::TakeProfitHit);
        assert_eq!(breaker(true).check(dec!(4.9)), SessionVerdict::Continue);
        assert_eq!(breaker(false).check(dec!(-50)), SessionVerdict::Continue);
        assert!(breaker(false).allows_new_entries());
    }

    #[test]
    fn test_entries_stop_inside_margins() {
        let mut breaker = breaker(true);
        assert!(breaker.allows_new_entries());

        // 80% of -10 is -8
        breaker.record(dec!(-7.9));
        assert!(breaker.allows_new_entries());
        breaker.record(dec!(-0.1));
        assert!(!breaker.allows_new_entries());

        // 90% of 5 is 4.5
        let mut breaker = self::breaker(true);
        breaker.record(dec!(4.4));
        assert!(breaker.allows_new_entries());
        breaker.record(dec!(0.1));
        assert!(!breaker.allows_new_entries());
    }

    #[test]
    fn test_halt_blocks_entries_for_the_run() {
        let mut breaker = breaker(true);
        breaker.halt(SessionVerdict::Continue);
        assert!(breaker.halted().is_none());

        breaker.halt(SessionVerdict::StopLossHit);
        breaker.halt(SessionVerdict::TakeProfitHit);
        assert_eq!(breaker.halted(), Some(SessionVerdict::StopLossHit));
        assert!(!breaker.allows_new_entries());
    }

    #[test]
    fn test_report_lists_close_reasons() {
        let mut breaker = breaker(false);
        breaker.stats.wins = 2;
        breaker.stats.losses = 1;
        breaker.stats.closes_by_reason.insert("take_profit", 2);
        let report = breaker.stats().to_string();
        assert!(report.contains("3 (2 wins / 1 losses"));
        assert!(report.contains("take_profit"));
    }
}
