//! Bounded signal channel with at-most-once consumption.

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::models::Signal;

/// Producer side. Cheap to clone, one per signal source.
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Signal>,
}

impl SignalSender {
    /// Enqueue without waiting. A full or closed queue drops the signal.
    pub fn offer(&self, signal: Signal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                warn!(symbol = signal.symbol(), source = signal.source(), "Signal queue full, dropping signal");
                false
            }
            Err(TrySendError::Closed(signal)) => {
                warn!(symbol = signal.symbol(), "Signal queue closed, dropping signal");
                false
            }
        }
    }

    /// Whether the consumer side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the coordinator.
pub struct SignalQueue {
    rx: mpsc::Receiver<Signal>,
}

impl SignalQueue {
    pub fn new(capacity: usize) -> (SignalSender, SignalQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (SignalSender { tx }, SignalQueue { rx })
    }

    /// Take every signal currently queued. Each signal is returned once.
    pub fn drain(&mut self) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(signal) = self.rx.try_recv() {
            signals.push(signal);
        }
        signals
    }
}
