//! Operator commands applied by the coordinator at cycle boundaries.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::mpsc;

/// A runtime instruction from the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stop acting on signals. Exits keep running.
    Pause,
    Resume,
    SellAll,
    Sell(String),
    /// Change take-profit for every open position and future ones, or one symbol.
    SetTakeProfit { symbol: Option<String>, pct: Decimal },
    /// Change stop-loss for every open position and future ones, or one symbol.
    SetStopLoss { symbol: Option<String>, pct: Decimal },
    Stop,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Pause => write!(f, "pause"),
            ControlCommand::Resume => write!(f, "resume"),
            ControlCommand::SellAll => write!(f, "sell-all"),
            ControlCommand::Sell(symbol) => write!(f, "sell {}", symbol),
            ControlCommand::SetTakeProfit { symbol: None, pct } => write!(f, "tp {}", pct),
            ControlCommand::SetTakeProfit { symbol: Some(s), pct } => write!(f, "tp {} {}", s, pct),
            ControlCommand::SetStopLoss { symbol: None, pct } => write!(f, "sl {}", pct),
            ControlCommand::SetStopLoss { symbol: Some(s), pct } => write!(f, "sl {} {}", s, pct),
            ControlCommand::Stop => write!(f, "stop"),
        }
    }
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = parts.split_first() else {
            return Err("empty command".to_string());
        };

        let pct = |raw: &str| -> Result<Decimal, String> {
            let pct = Decimal::from_str(raw).map_err(|e| format!("invalid percent {:?}: {}", raw, e))?;
            if pct <= Decimal::ZERO {
                return Err(format!("percent must be positive, got {}", pct));
            }
            Ok(pct)
        };

        match (verb.to_lowercase().as_str(), args) {
            ("pause", []) => Ok(ControlCommand::Pause),
            ("resume", []) => Ok(ControlCommand::Resume),
            ("sell-all" | "sellall", []) => Ok(ControlCommand::SellAll),
            ("sell", [symbol]) => Ok(ControlCommand::Sell(symbol.to_uppercase())),
            ("tp", [value]) => Ok(ControlCommand::SetTakeProfit {
                symbol: None,
                pct: pct(*value)?,
            }),
            ("tp", [symbol, value]) => Ok(ControlCommand::SetTakeProfit {
                symbol: Some(symbol.to_uppercase()),
                pct: pct(*value)?,
            }),
            ("sl", [value]) => Ok(ControlCommand::SetStopLoss {
                symbol: None,
                pct: pct(*value)?,
            }),
            ("sl", [symbol, value]) => Ok(ControlCommand::SetStopLoss {
                symbol: Some(symbol.to_uppercase()),
                pct: pct(*value)?,
            }),
            ("stop" | "quit" | "exit", []) => Ok(ControlCommand::Stop),
            _ => Err(format!("unknown command: {}", line.trim())),
        }
    }
}

/// Sender half of the operator channel.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
    shutdown: Arc<AtomicBool>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::Sender<ControlCommand>, shutdown: Arc<AtomicBool>) -> Self {
        Self { tx, shutdown }
    }

    /// Queue a command for the next cycle. `Stop` also raises the shutdown
    /// flag so a sleeping loop notices it within one tick.
    pub async fn send(&self, command: ControlCommand) -> bool {
        if command == ControlCommand::Stop {
            self.shutdown.store(true, Ordering::SeqCst);
        }
        self.tx.send(command).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_commands() {
        assert_eq!("pause".parse(), Ok(ControlCommand::Pause));
        assert_eq!(" RESUME ".parse(), Ok(ControlCommand::Resume));
        assert_eq!("sell-all".parse(), Ok(ControlCommand::SellAll));
        assert_eq!("sell btcusdt".parse(), Ok(ControlCommand::Sell("BTCUSDT".into())));
        assert_eq!(
            "tp 3.5".parse(),
            Ok(ControlCommand::SetTakeProfit { symbol: None, pct: dec!(3.5) })
        );
        assert_eq!(
            "sl ethusdt 4".parse(),
            Ok(ControlCommand::SetStopLoss {
                symbol: Some("ETHUSDT".into()),
                pct: dec!(4)
            })
        );
        assert_eq!("stop".parse(), Ok(ControlCommand::Stop));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("".parse::<ControlCommand>().is_err());
        assert!("buy BTCUSDT".parse::<ControlCommand>().is_err());
        assert!("tp abc".parse::<ControlCommand>().is_err());
        assert!("sl -2".parse::<ControlCommand>().is_err());
        assert!("pause now".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for line in ["pause", "sell-all", "sell BTCUSDT", "tp ETHUSDT 2.5", "sl 8", "stop"] {
            let command: ControlCommand = line.parse().unwrap();
            assert_eq!(command.to_string(), line);
        }
    }

    #[tokio::test]
    async fn test_stop_raises_shutdown_flag() {
        let (tx, mut rx) = mpsc::channel(4);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = ControlHandle::new(tx, shutdown.clone());

        assert!(handle.send(ControlCommand::Pause).await);
        assert!(!shutdown.load(Ordering::SeqCst));
        assert!(handle.send(ControlCommand::Stop).await);
        assert!(shutdown.load(Ordering::SeqCst));
        assert_eq!(rx.recv().await, Some(ControlCommand::Pause));
    }
}
