// Exchange collaborator contracts: REST call surface, streaming market data,
// retry gating, and the error taxonomy the supervisor branches on

pub mod error;
pub mod rest;
pub mod retry;
pub mod ws;

pub use error::ExchangeError;
pub use rest::CoinbaseRest;
pub use retry::{RestGate, RetryPolicy, DEFAULT_TRANSIENT_STATUSES};
pub use ws::{MarketStream, StreamCommand, StreamEvent};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{Instrument, Side};

/// One historical bar from the candle-history endpoint; only start/close are
/// consumed downstream
#[derive(Debug, Clone, Copy)]
pub struct HistoricalCandle {
    pub start: DateTime<Utc>,
    pub close: f64,
}

/// A fill as returned by the exchange, kept in wire form
///
/// Field presence varies across endpoints and API revisions, so everything is
/// optional; the ledger applies the fallback chains and numeric parsing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FillRecord {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub trade_id: Option<String>,
    #[serde(default)]
    pub fill_id: Option<String>,
    #[serde(default)]
    pub sequence: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub order_side: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub base_size: Option<String>,
    #[serde(default)]
    pub filled_size: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub fee: Option<String>,
    #[serde(default)]
    pub liquidity_indicator: Option<String>,
    #[serde(default)]
    pub trade_time: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
}

impl FillRecord {
    /// side -> order_side fallback, normalized to upper case
    pub fn side(&self) -> Option<Side> {
        let raw = self.side.as_deref().or(self.order_side.as_deref())?;
        match raw.to_uppercase().as_str() {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }

    /// size -> base_size -> filled_size fallback, still as received
    pub fn size_str(&self) -> Option<&str> {
        self.size
            .as_deref()
            .or(self.base_size.as_deref())
            .or(self.filled_size.as_deref())
    }

    /// trade_time -> time fallback
    pub fn time_str(&self) -> Option<&str> {
        self.trade_time.as_deref().or(self.time.as_deref())
    }

    pub fn parsed_time(&self) -> Option<DateTime<Utc>> {
        self.time_str()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Result of an order submission after the success judgment is applied
///
/// A submission counts as accepted only when the response carried a success
/// indicator or an order id and no explicit error payload; ambiguous or empty
/// responses are failures.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub accepted: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
}

/// Limit (maker) order request; prices and sizes already formatted to the
/// instrument's increments
#[derive(Debug, Clone)]
pub struct LimitOrderParams {
    pub client_order_id: String,
    pub product_id: String,
    pub side: Side,
    pub base_size: String,
    pub limit_price: String,
    pub post_only: bool,
}

/// Market order request; BUY is quote-denominated, SELL base-denominated
#[derive(Debug, Clone)]
pub struct MarketOrderParams {
    pub client_order_id: String,
    pub product_id: String,
    pub side: Side,
    pub quote_size: Option<String>,
    pub base_size: Option<String>,
}

/// The REST call surface the core needs from the exchange
///
/// Everything behind this trait is an external collaborator; business logic
/// depends only on these contracts.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Tick constraints for one product
    async fn get_product(&self, product_id: &str) -> Result<Instrument, ExchangeError>;

    /// Closed candles for `[start, end]` at the given granularity, oldest first
    async fn get_candles(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity_secs: u64,
    ) -> Result<Vec<HistoricalCandle>, ExchangeError>;

    /// Trading-available balance (net of holds) for one asset, walking
    /// account pagination as needed
    async fn get_available_balance(&self, asset: &str) -> Result<f64, ExchangeError>;

    async fn submit_limit_order(&self, params: &LimitOrderParams)
        -> Result<OrderAck, ExchangeError>;

    async fn submit_market_order(
        &self,
        params: &MarketOrderParams,
    ) -> Result<OrderAck, ExchangeError>;

    /// Fills for one order id (best-effort immediate sweep)
    async fn get_fills_by_order(&self, order_id: &str) -> Result<Vec<FillRecord>, ExchangeError>;

    /// Fills in a time window, paginated
    async fn get_fills_by_time(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>, ExchangeError>;
}
