//! Trading engine: the cycle coordinator and its operator channel.

mod control;
mod coordinator;

pub use control::{ControlCommand, ControlHandle};
pub use coordinator::{CycleReport, TradeCycleCoordinator};
