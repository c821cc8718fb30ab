//! Trading logic: fees, ledger, trailing exits, admission and session limits.

mod config;
mod fees;
mod ledger;
mod risk_gate;
mod session;
mod trailing;

pub use config::{Credentials, TradingConfig};
pub use fees::{FeeSchedule, Pnl};
pub use ledger::{OpenRequest, PositionLedger};
pub use risk_gate::{CooloffRegistry, GateOutcome, PortfolioSnapshot, Rejection, RiskGate};
pub use session::{SessionCircuitBreaker, SessionStats, SessionVerdict};
pub use trailing::{Thresholds, TrailDecision, TrailingStopEngine};
