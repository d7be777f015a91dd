use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an order was submitted; recorded at intent time and written to the KPI log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeReason {
    EmaCross,
    TakeProfit,
    Stagnation,
    StopLoss,
}

impl TradeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeReason::EmaCross => "ema_cross",
            TradeReason::TakeProfit => "take_profit",
            TradeReason::Stagnation => "stagnation",
            TradeReason::StopLoss => "stop_loss",
        }
    }
}

impl std::fmt::Display for TradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A traded product with its exchange tick constraints
///
/// Loaded once at startup from the exchange and immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub product_id: String,
    /// Smallest quote-price step accepted by the exchange
    pub price_increment: f64,
    /// Smallest base-quantity step accepted by the exchange
    pub base_increment: f64,
    /// Minimum base size for a market order
    pub min_market_base_size: f64,
}

impl Instrument {
    /// Conservative fallback when the product endpoint is unavailable
    pub fn with_defaults(product_id: &str) -> Self {
        Self {
            product_id: product_id.to_string(),
            price_increment: 0.01,
            base_increment: 1e-8,
            min_market_base_size: 0.0,
        }
    }
}

/// One closed OHLC bar for an instrument/interval bucket
///
/// Only `close` is consumed downstream; the full bar is kept for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub product_id: String,
    pub start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Last known top-of-book + last trade price, used for maker pricing
///
/// Transient; never persisted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quote {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
}

/// Intent recorded when an order is submitted, keyed by exchange order id
///
/// Lets the ledger compute slippage and hold time when fills arrive later.
/// In-memory cache only; not authoritative.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub product_id: String,
    pub side: Side,
    pub quote_usd: f64,
    pub base_size: Option<f64>,
    pub reference_price: f64,
    pub reason: TradeReason,
    pub submitted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_strings() {
        assert_eq!(Side::Buy.as_str(), "BUY");
        assert_eq!(Side::Sell.as_str(), "SELL");
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(TradeReason::EmaCross.as_str(), "ema_cross");
        assert_eq!(TradeReason::TakeProfit.as_str(), "take_profit");
        assert_eq!(TradeReason::Stagnation.as_str(), "stagnation");
        assert_eq!(TradeReason::StopLoss.as_str(), "stop_loss");
    }

    #[test]
    fn test_instrument_defaults() {
        let inst = Instrument::with_defaults("ETH-USD");
        assert_eq!(inst.product_id, "ETH-USD");
        assert_eq!(inst.price_increment, 0.01);
        assert_eq!(inst.base_increment, 1e-8);
    }
}
