//! Data models for positions and signals.

mod position;
mod signal;

pub use position::{CloseReason, ClosedPosition, Position, PositionUpdate, TrailState};
pub use signal::{Signal, SignalKind};
