//! Error taxonomy for the trading engine.
//!
//! Each error maps onto an [`ErrorCategory`] so that logs can attribute every
//! rejected signal, skipped position and forced liquidation to a cause.

use std::fmt;

use thiserror::Error;

/// Broad classification used in logs and for deciding how the loop reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or invalid configuration. Fatal at startup.
    Configuration,
    /// Missing or malformed credentials. Fatal at startup.
    Credential,
    /// Exchange answered with an error code.
    Exchange,
    /// Transport-level failure talking to the exchange.
    Network,
    /// Bad price, missing position and similar per-symbol problems.
    Data,
    /// Anything else. Halts the engine without liquidating.
    Critical,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Credential => "credential",
            ErrorCategory::Exchange => "exchange",
            ErrorCategory::Network => "network",
            ErrorCategory::Data => "data",
            ErrorCategory::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration option: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Credential loading errors.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential {0} is present but empty")]
    Empty(&'static str),
}

/// Errors raised by the position ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Position already open for {0}")]
    AlreadyOpen(String),

    #[error("No open position for {0}")]
    NotFound(String),

    #[error("Corrupt position row for {symbol}: {reason}")]
    Corrupt { symbol: String, reason: String },

    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::AlreadyOpen(_) | LedgerError::NotFound(_) | LedgerError::Corrupt { .. } => {
                ErrorCategory::Data
            }
            LedgerError::Store(_) => ErrorCategory::Critical,
        }
    }
}

/// Errors from the exchange boundary (market data and order execution).
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Rate limited by exchange: {0}")]
    RateLimited(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Order rejected [{code}]: {message}")]
    Rejected { code: i64, message: String },

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Invalid exchange response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Classify a Binance error code.
    pub fn from_exchange_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            -1003 | -1015 => GatewayError::RateLimited(message),
            -2010 => GatewayError::InsufficientBalance(message),
            -2014 | -2015 => GatewayError::Auth(message),
            _ => GatewayError::Rejected { code, message },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Network(_) => ErrorCategory::Network,
            GatewayError::Auth(_) => ErrorCategory::Credential,
            GatewayError::InvalidResponse(_) => ErrorCategory::Data,
            GatewayError::RateLimited(_)
            | GatewayError::InsufficientBalance(_)
            | GatewayError::Rejected { .. } => ErrorCategory::Exchange,
        }
    }

    /// Whether the call may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::RateLimited(_) | GatewayError::Network(_) => true,
            // Timestamp drift errors clear up on retry.
            GatewayError::Rejected { code, .. } => matches!(code, -1021 | -1022),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::InvalidResponse(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

/// Errors surfacing from one trading cycle.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Gateway(e) => e.category(),
            EngineError::Ledger(e) => e.category(),
        }
    }

    /// Whether the engine must stop. Open positions stay as persisted.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Gateway(GatewayError::Network(_) | GatewayError::Auth(_)) => true,
            EngineError::Ledger(LedgerError::Store(_)) => true,
            _ => false,
        }
    }
}
