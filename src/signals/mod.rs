//! Signal intake: a bounded queue and the signal-file importer that feeds it.

mod directory;
mod queue;

pub use directory::{parse_signal_file, SignalDirectory};
pub use queue::{SignalQueue, SignalSender};
