use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::exchange::ExchangeApi;

/// Live available-balance lookups with a short TTL cache
///
/// Bounds REST volume when several gates need the same balance inside one
/// candle cycle. Errors degrade to 0.0 (the conservative answer for SELL
/// sizing) and are logged.
#[derive(Clone)]
pub struct BalanceCache {
    api: Arc<dyn ExchangeApi>,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<String, (Instant, f64)>>>,
}

impl BalanceCache {
    pub fn new(api: Arc<dyn ExchangeApi>, ttl: Duration) -> Self {
        Self {
            api,
            ttl,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Available quantity for a base asset (e.g. "ETH" for "ETH-USD")
    pub async fn available(&self, asset: &str) -> f64 {
        self.try_available(asset).await.unwrap_or(0.0)
    }

    /// Like [`available`](Self::available) but lets callers distinguish a
    /// failed lookup from a genuinely empty balance
    pub async fn try_available(&self, asset: &str) -> Option<f64> {
        if let Some(v) = self.cached(asset) {
            return Some(v);
        }

        match self.api.get_available_balance(asset).await {
            Ok(v) => {
                self.cache
                    .lock()
                    .unwrap()
                    .insert(asset.to_string(), (Instant::now(), v));
                Some(v)
            }
            Err(e) => {
                tracing::warn!("Balance lookup for {} failed: {}", asset, e);
                None
            }
        }
    }

    /// Drop one asset's cached value, forcing a refetch on next use
    pub fn invalidate(&self, asset: &str) {
        self.cache.lock().unwrap().remove(asset);
    }

    fn cached(&self, asset: &str) -> Option<f64> {
        let cache = self.cache.lock().unwrap();
        cache
            .get(asset)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| *v)
    }
}

/// Base asset of a product id ("ETH-USD" -> "ETH")
pub fn base_asset(product_id: &str) -> &str {
    product_id.split('-').next().unwrap_or(product_id)
}
