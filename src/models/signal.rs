//! Trading signals consumed by the engine.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    Buy,
    Sell,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Buy => "BUY",
            SignalKind::Sell => "SELL",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory buy/sell request for one symbol. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Signal {
    Buy {
        symbol: String,
        /// Free-form origin tag (producer module, file name)
        source: String,
        /// Optional producer-specific strength, e.g. percent move
        #[serde(default)]
        strength: Option<Decimal>,
    },
    Sell {
        symbol: String,
        reason: String,
        source: String,
    },
}

impl Signal {
    pub fn buy(symbol: impl Into<String>, source: impl Into<String>) -> Self {
        Signal::Buy {
            symbol: symbol.into(),
            source: source.into(),
            strength: None,
        }
    }

    /// Attach a strength to a buy. Sells carry none.
    pub fn with_strength(mut self, value: Option<Decimal>) -> Self {
        if let Signal::Buy { strength, .. } = &mut self {
            *strength = value;
        }
        self
    }

    pub fn sell(symbol: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        Signal::Sell {
            symbol: symbol.into(),
            reason: format!("sell signal from {}", source),
            source,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Signal::Buy { symbol, .. } | Signal::Sell { symbol, .. } => symbol,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Signal::Buy { source, .. } | Signal::Sell { source, .. } => source,
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Buy { .. } => SignalKind::Buy,
            Signal::Sell { .. } => SignalKind::Sell,
        }
    }

    pub fn is_sell(&self) -> bool {
        self.kind() == SignalKind::Sell
    }

    pub fn strength(&self) -> Option<Decimal> {
        match self {
            Signal::Buy { strength, .. } => *strength,
            Signal::Sell { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_accessors() {
        let buy = Signal::buy("ETHUSDT", "volatility");
        assert_eq!(buy.symbol(), "ETHUSDT");
        assert_eq!(buy.kind(), SignalKind::Buy);
        assert!(!buy.is_sell());

        let sell = Signal::sell("ETHUSDT", "rsi.sell");
        assert_eq!(sell.source(), "rsi.sell");
        assert!(sell.is_sell());
        match sell {
            Signal::Sell { reason, .. } => assert!(reason.contains("rsi.sell")),
            Signal::Buy { .. } => panic!("expected sell"),
        }
    }

    #[test]
    fn test_strength_only_on_buys() {
        let buy = Signal::buy("ETHUSDT", "dip").with_strength(Some(rust_decimal_macros::dec!(3.5)));
        assert_eq!(buy.strength(), Some(rust_decimal_macros::dec!(3.5)));
        let sell = Signal::sell("ETHUSDT", "dip").with_strength(Some(Decimal::ONE));
        assert_eq!(sell.strength(), None);
    }

    #[test]
    fn test_signal_json_is_tagged() {
        let json = serde_json::to_string(&Signal::buy("BTCUSDT", "ext")).unwrap();
        assert!(json.contains("\"kind\":\"buy\""));
        let back: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.symbol(), "BTCUSDT");
    }
}
