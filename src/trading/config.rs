//! Trading configuration.
//!
//! A [`TradingConfig`] is an immutable snapshot. Runtime changes produce a new
//! snapshot which the coordinator swaps in between cycles.

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, CredentialError};

use super::FeeSchedule;

/// Longest accepted cooloff base, one year.
const MAX_COOLOFF_MINUTES: i64 = 525_600;
const MAX_COOLOFF_MULTIPLIER: Decimal = dec!(100);

/// Configuration for signal admission, exits and session limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Quote asset every traded symbol must end with (PAIR_WITH)
    pub pair_with: String,

    /// Capital committed per slot, in quote asset (TRADE_TOTAL)
    pub trade_total: Decimal,

    /// Maximum concurrently open positions (TRADE_SLOTS)
    pub trade_slots: usize,

    /// Base take-profit percent over fee-adjusted entry (TAKE_PROFIT)
    pub take_profit_pct: Decimal,

    /// Base stop-loss percent under fee-adjusted entry (STOP_LOSS)
    pub stop_loss_pct: Decimal,

    /// Arm trailing instead of selling at take-profit (USE_TRAILING_STOP_LOSS)
    pub use_trailing_stop_loss: bool,

    /// Trailing floor distance below the high-water mark, percent (TRAILING_STOP_LOSS)
    pub trailing_stop_loss_pct: Decimal,

    /// Trailing ceiling distance above the high-water mark, percent (TRAILING_TAKE_PROFIT)
    pub trailing_take_profit_pct: Decimal,

    /// Reported with the trailing settings; arming uses the base take-profit (TRAILING_THRESHOLD)
    pub trailing_threshold_pct: Decimal,

    /// Enable session-wide take-profit/stop-loss; disables trailing (SESSION_TPSL_OVERRIDE)
    pub session_tpsl_override: bool,

    /// Session take-profit, percent of session capital (SESSION_TAKE_PROFIT)
    pub session_take_profit_pct: Decimal,

    /// Session stop-loss, percent of session capital, always negative (SESSION_STOP_LOSS)
    pub session_stop_loss_pct: Decimal,

    /// Fraction of the session stop-loss at which new entries stop
    pub session_entry_margin_sl: Decimal,

    /// Fraction of the session take-profit at which new entries stop
    pub session_entry_margin_tp: Decimal,

    /// Trading fee per leg, percent (TRADING_FEE)
    pub trading_fee_pct: Decimal,

    /// Re-entry block after a close, minutes (TIME_DIFFERENCE)
    pub cooloff_minutes: i64,

    /// Cooloff multiplier after a losing close
    pub cooloff_multiplier_loss: Decimal,

    /// Cooloff multiplier after a small-profit close
    pub cooloff_multiplier_small_profit: Decimal,

    /// Optional cap on total open position value
    pub max_portfolio_exposure: Option<Decimal>,

    /// Symbols treated as scheduled for delisting regardless of the exchange
    pub delisted_symbols: Vec<String>,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            pair_with: "USDT".to_string(),
            trade_total: dec!(100),
            trade_slots: 5,
            take_profit_pct: dec!(2.0),
            stop_loss_pct: dec!(10.0),
            use_trailing_stop_loss: false,
            trailing_stop_loss_pct: dec!(0.2),
            trailing_take_profit_pct: dec!(0.05),
            trailing_threshold_pct: dec!(0.8),
            session_tpsl_override: false,
            session_take_profit_pct: dec!(5),
            session_stop_loss_pct: dec!(-10),
            session_entry_margin_sl: dec!(0.8),
            session_entry_margin_tp: dec!(0.9),
            trading_fee_pct: dec!(0.075),
            cooloff_minutes: 2,
            cooloff_multiplier_loss: Decimal::ONE,
            cooloff_multiplier_small_profit: Decimal::ONE,
            max_portfolio_exposure: None,
            delisted_symbols: Vec::new(),
        }
    }
}

impl TradingConfig {
    /// Load from the process environment (after `.env` has been applied).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let reader = Reader { lookup: &lookup };

        let pair_with = reader
            .required("PAIR_WITH")?
            .trim()
            .to_uppercase();
        if pair_with.is_empty() {
            return Err(invalid("PAIR_WITH", "", "must not be empty"));
        }

        let trade_slots_raw = reader.required("TRADE_SLOTS")?;
        let trade_slots: usize = trade_slots_raw
            .trim()
            .parse()
            .map_err(|e| invalid("TRADE_SLOTS", &trade_slots_raw, e))?;

        let session_stop_loss = reader
            .decimal("SESSION_STOP_LOSS")?
            .unwrap_or(defaults.session_stop_loss_pct);

        let cooloff_minutes = match reader.raw("TIME_DIFFERENCE") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|e| invalid("TIME_DIFFERENCE", &raw, e))?,
            None => defaults.cooloff_minutes,
        };

        let delisted_symbols = reader
            .raw("DELISTED_SYMBOLS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            pair_with,
            trade_total: reader.required_decimal("TRADE_TOTAL")?,
            trade_slots,
            take_profit_pct: reader.required_decimal("TAKE_PROFIT")?,
            stop_loss_pct: reader.required_decimal("STOP_LOSS")?,
            use_trailing_stop_loss: reader
                .bool("USE_TRAILING_STOP_LOSS")?
                .unwrap_or(defaults.use_trailing_stop_loss),
            trailing_stop_loss_pct: reader
                .decimal("TRAILING_STOP_LOSS")?
                .unwrap_or(defaults.trailing_stop_loss_pct),
            trailing_take_profit_pct: reader
                .decimal("TRAILING_TAKE_PROFIT")?
                .unwrap_or(defaults.trailing_take_profit_pct),
            trailing_threshold_pct: reader
                .decimal("TRAILING_THRESHOLD")?
                .unwrap_or(defaults.trailing_threshold_pct),
            session_tpsl_override: reader
                .bool("SESSION_TPSL_OVERRIDE")?
                .unwrap_or(defaults.session_tpsl_override),
            session_take_profit_pct: reader
                .decimal("SESSION_TAKE_PROFIT")?
                .unwrap_or(defaults.session_take_profit_pct),
            // Accept either sign; a session stop-loss is a loss.
            session_stop_loss_pct: -session_stop_loss.abs(),
            session_entry_margin_sl: reader
                .decimal("SESSION_ENTRY_MARGIN_SL")?
                .unwrap_or(defaults.session_entry_margin_sl),
            session_entry_margin_tp: reader
                .decimal("SESSION_ENTRY_MARGIN_TP")?
                .unwrap_or(defaults.session_entry_margin_tp),
            trading_fee_pct: reader
                .decimal("TRADING_FEE")?
                .unwrap_or(defaults.trading_fee_pct),
            cooloff_minutes,
            cooloff_multiplier_loss: reader
                .decimal("COOLOFF_MULTIPLIER_LOSS")?
                .unwrap_or(defaults.cooloff_multiplier_loss),
            cooloff_multiplier_small_profit: reader
                .decimal("COOLOFF_MULTIPLIER_SMALL_PROFIT")?
                .unwrap_or(defaults.cooloff_multiplier_small_profit),
            max_portfolio_exposure: reader.decimal("MAX_PORTFOLIO_EXPOSURE")?,
            delisted_symbols,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trade_total <= Decimal::ZERO {
            return Err(invalid("TRADE_TOTAL", self.trade_total, "must be positive"));
        }
        if self.trade_slots == 0 {
            return Err(invalid("TRADE_SLOTS", self.trade_slots, "must be at least 1"));
        }
        if self.take_profit_pct <= Decimal::ZERO {
            return Err(invalid("TAKE_PROFIT", self.take_profit_pct, "must be positive"));
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= dec!(100) {
            return Err(invalid("STOP_LOSS", self.stop_loss_pct, "must be in (0, 100)"));
        }
        if self.trading_fee_pct < Decimal::ZERO || self.trading_fee_pct >= dec!(100) {
            return Err(invalid("TRADING_FEE", self.trading_fee_pct, "must be in [0, 100)"));
        }
        if self.trailing_stop_loss_pct < Decimal::ZERO || self.trailing_stop_loss_pct >= dec!(100) {
            return Err(invalid(
                "TRAILING_STOP_LOSS",
                self.trailing_stop_loss_pct,
                "must be in [0, 100)",
            ));
        }
        if self.trailing_take_profit_pct < Decimal::ZERO {
            return Err(invalid(
                "TRAILING_TAKE_PROFIT",
                self.trailing_take_profit_pct,
                "must not be negative",
            ));
        }
        if self.session_take_profit_pct <= Decimal::ZERO {
            return Err(invalid(
                "SESSION_TAKE_PROFIT",
                self.session_take_profit_pct,
                "must be positive",
            ));
        }
        if !(0..=MAX_COOLOFF_MINUTES).contains(&self.cooloff_minutes) {
            return Err(invalid(
                "TIME_DIFFERENCE",
                self.cooloff_minutes,
                "must be between 0 and 525600 (one year)",
            ));
        }
        for (key, multiplier) in [
            ("COOLOFF_MULTIPLIER_LOSS", self.cooloff_multiplier_loss),
            ("COOLOFF_MULTIPLIER_SMALL_PROFIT", self.cooloff_multiplier_small_profit),
        ] {
            if multiplier < Decimal::ZERO || multiplier > MAX_COOLOFF_MULTIPLIER {
                return Err(invalid(key, multiplier, "must be in [0, 100]"));
            }
        }
        Ok(())
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule::from_percent(self.trading_fee_pct)
    }

    /// Trailing is only used when enabled and not overridden by session limits.
    pub fn trailing_enabled(&self) -> bool {
        self.use_trailing_stop_loss && !self.session_tpsl_override
    }

    pub fn trailing_sl_fraction(&self) -> Decimal {
        self.trailing_stop_loss_pct / dec!(100)
    }

    pub fn trailing_tp_fraction(&self) -> Decimal {
        self.trailing_take_profit_pct / dec!(100)
    }

    /// Capital the session percentage is measured against.
    pub fn session_capital(&self) -> Decimal {
        self.trade_total * Decimal::from(self.trade_slots)
    }

    /// Whether a symbol belongs to the configured quote universe.
    pub fn accepts_symbol(&self, symbol: &str) -> bool {
        symbol.len() > self.pair_with.len() && symbol.to_uppercase().ends_with(&self.pair_with)
    }

    pub fn with_take_profit(&self, pct: Decimal) -> Self {
        Self {
            take_profit_pct: pct,
            ..self.clone()
        }
    }

    pub fn with_stop_loss(&self, pct: Decimal) -> Self {
        Self {
            stop_loss_pct: pct,
            ..self.clone()
        }
    }
}

/// Exchange credentials. Only the API key is needed for read endpoints.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self, CredentialError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup("BINANCE_API_KEY") {
            Some(key) if key.trim().is_empty() => Err(CredentialError::Empty("BINANCE_API_KEY")),
            Some(key) => Ok(Self {
                api_key: Some(key.trim().to_string()),
            }),
            None => Ok(Self::default()),
        }
    }
}

struct Reader<'a, F> {
    lookup: &'a F,
}

impl<'a, F> Reader<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &'static str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.raw(key).ok_or(ConfigError::Missing(key))
    }

    fn decimal(&self, key: &'static str) -> Result<Option<Decimal>, ConfigError> {
        self.raw(key)
            .map(|raw| Decimal::from_str(raw.trim()).map_err(|e| invalid(key, &raw, e)))
            .transpose()
    }

    fn required_decimal(&self, key: &'static str) -> Result<Decimal, ConfigError> {
        self.decimal(key)?.ok_or(ConfigError::Missing(key))
    }

    fn bool(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        self.raw(key)
            .map(|raw| match raw.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(invalid(key, &raw, "expected true or false")),
            })
            .transpose()
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
