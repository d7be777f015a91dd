use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// How closed candles are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleMode {
    /// Exchange-native candle channel; a bar's `start` change closes the previous bar
    Native,
    /// Local OHLC aggregation from the ticker stream
    Local,
}

/// Fully-typed bot configuration with explicit defaults
///
/// All tunables live here; there are no runtime name lookups. Read a snapshot
/// once per decision cycle via [`ConfigHandle::snapshot`].
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub product_ids: Vec<String>,

    /// Paper trading: log orders and stamp spend/cooldown without touching the exchange
    pub dry_run: bool,

    // -------- Candles --------
    pub candle_mode: CandleMode,
    pub candle_interval_secs: u64,
    /// Wait for this many closed candles before the signal machine may trade
    pub min_candles: u32,
    /// Consecutive same-side readings required to confirm a crossover
    pub confirm_candles: u32,
    /// Fetch candle history on startup to pre-seed indicators
    pub use_backfill: bool,
    pub warmup_candles: u32,
    /// Delay before dispatching a locally-aggregated close, to absorb
    /// boundary-straddling ticks
    pub settle_delay_ms: u64,

    // -------- EMA crossover --------
    pub short_ema: usize,
    pub long_ema: usize,
    pub ema_deadband_bps: f64,

    // -------- Advisors (RSI/MACD veto) --------
    pub enable_advisors: bool,
    pub rsi_period: usize,
    /// BUY blocked only above this (overbought)
    pub rsi_buy_max: f64,
    /// SELL blocked only below this (oversold)
    pub rsi_sell_min: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    /// bps of price; BUY blocked when normalized histogram is below this
    pub macd_buy_min: f64,
    /// bps of price; SELL blocked when normalized histogram is above this
    pub macd_sell_max: f64,

    // -------- Quartermaster exits --------
    pub enable_quartermaster: bool,
    pub take_profit_bps: f64,
    pub max_hold_hours: f64,
    pub stagnation_close_bps: f64,
    /// Histogram magnitude below which MACD counts as flat
    pub flat_macd_abs_max: f64,
    /// Defer take-profit while the histogram is still strongly bullish
    pub quartermaster_respect_macd: bool,
    /// Floor between quartermaster attempts per instrument, independent of
    /// the normal trade cooldown
    pub quartermaster_min_interval_secs: u64,

    // -------- Ops / risk --------
    pub usd_per_order: f64,
    /// BUY spend stops after this; SELLs always continue
    pub daily_spend_cap_usd: f64,
    pub per_product_cooldown_secs: u64,
    /// Emergency stop loss: force a market SELL once price falls this far
    /// below cost basis
    pub hard_stop_bps: Option<f64>,
    /// Suppress repeat attempts for this long after a dust-sized order is skipped
    pub dust_suppress_secs: u64,
    /// Increments shaved off a computed full exit before rounding
    pub full_exit_shave_increments: u32,

    // -------- Maker/post-only --------
    pub prefer_maker: bool,
    pub prefer_maker_for_sells: bool,
    pub maker_offset_bps: f64,
    pub maker_offset_bps_per_product: HashMap<String, f64>,

    // -------- Reconciliation --------
    /// Startup fill sweep honors the full value; mid-session sweeps are
    /// clamped to 6-168h
    pub lookback_hours: u32,
    pub mid_reconcile_enabled: bool,
    pub mid_reconcile_interval_minutes: u64,
    /// Quick bounded sweep right before a SELL so held quantity is fresh
    pub reconcile_on_sell_attempt: bool,
    pub processed_fills_max: usize,

    // -------- Connection resilience --------
    /// Warn once the stream has been silent this long
    pub idle_warn_secs: u64,
    /// Force close/reopen/resubscribe past this
    pub idle_reconnect_secs: u64,
    /// Flip native-candle mode to local aggregation after this many idle reconnects
    pub idle_reconnects_before_fallback: u32,
    /// A candle is stalled once none closed for stall_factor * interval
    pub stall_factor: f64,
    /// Consecutive per-instrument stalls before a resubscribe escalates to reconnect
    pub stalls_before_reconnect: u32,
    /// Minimum gap between REST backstop polls per instrument
    pub backstop_min_poll_secs: u64,
    pub rest_max_attempts: u32,
    pub rest_requests_per_sec: u32,
    /// Live-balance lookups are cached this long to bound REST volume
    pub balance_cache_ttl_secs: u64,

    // -------- Elapsed config refresh --------
    pub elapsed_refresh_enabled: bool,
    pub elapsed_refresh_hours: f64,

    // -------- Persistence --------
    pub state_dir: PathBuf,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            product_ids: vec![
                "ETH-USD", "XRP-USD", "ADA-USD", "ATOM-USD", "ALGO-USD", "XLM-USD", "HBAR-USD",
                "FIL-USD", "NEAR-USD", "SOL-USD", "DOGE-USD", "AVAX-USD", "LINK-USD", "SUI-USD",
                "LTC-USD", "CRO-USD", "DOT-USD", "ARB-USD",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            dry_run: false,

            candle_mode: CandleMode::Native,
            candle_interval_secs: 300,
            min_candles: 120,
            confirm_candles: 3,
            use_backfill: true,
            warmup_candles: 200,
            settle_delay_ms: 150,

            short_ema: 40,
            long_ema: 120,
            ema_deadband_bps: 6.0,

            enable_advisors: true,
            rsi_period: 14,
            rsi_buy_max: 65.0,
            rsi_sell_min: 35.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            macd_buy_min: 2.0,
            macd_sell_max: -2.0,

            enable_quartermaster: true,
            take_profit_bps: 600.0,
            max_hold_hours: 24.0,
            stagnation_close_bps: 200.0,
            flat_macd_abs_max: 0.40,
            quartermaster_respect_macd: true,
            quartermaster_min_interval_secs: 120,

            usd_per_order: 30.0,
            daily_spend_cap_usd: 240.0,
            per_product_cooldown_secs: 600,
            hard_stop_bps: Some(100.0),
            dust_suppress_secs: 900,
            full_exit_shave_increments: 1,

            prefer_maker: true,
            prefer_maker_for_sells: true,
            maker_offset_bps: 5.0,
            maker_offset_bps_per_product: [
                ("ETH-USD", 16.0),
                ("SOL-USD", 18.0),
                ("LINK-USD", 18.0),
                ("XRP-USD", 20.0),
                ("DOGE-USD", 20.0),
                ("LTC-USD", 20.0),
                ("ADA-USD", 20.0),
                ("AVAX-USD", 18.0),
                ("DOT-USD", 16.0),
                ("ARB-USD", 20.0),
                ("FIL-USD", 26.0),
                ("NEAR-USD", 20.0),
                ("ATOM-USD", 26.0),
                ("ALGO-USD", 22.0),
                ("XLM-USD", 20.0),
                ("CRO-USD", 22.0),
                ("SUI-USD", 22.0),
                ("HBAR-USD", 20.0),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),

            lookback_hours: 48,
            mid_reconcile_enabled: true,
            mid_reconcile_interval_minutes: 60,
            reconcile_on_sell_attempt: true,
            processed_fills_max: 10_000,

            idle_warn_secs: 90,
            idle_reconnect_secs: 240,
            idle_reconnects_before_fallback: 3,
            stall_factor: 2.0,
            stalls_before_reconnect: 3,
            backstop_min_poll_secs: 60,
            rest_max_attempts: 3,
            rest_requests_per_sec: 10,
            balance_cache_ttl_secs: 20,

            elapsed_refresh_enabled: true,
            elapsed_refresh_hours: 4.0,

            state_dir: PathBuf::from(".state"),
        }
    }
}

impl BotConfig {
    /// Defaults overridden by environment variables where provided
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_parse::<bool>("TRENDBOT_DRY_RUN") {
            cfg.dry_run = v;
        }
        if let Ok(list) = std::env::var("TRENDBOT_PRODUCTS") {
            let ids: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !ids.is_empty() {
                cfg.product_ids = ids;
            }
        }
        if let Some(v) = env_parse::<f64>("TRENDBOT_USD_PER_ORDER") {
            cfg.usd_per_order = v;
        }
        if let Some(v) = env_parse::<f64>("TRENDBOT_DAILY_CAP_USD") {
            cfg.daily_spend_cap_usd = v;
        }
        if let Ok(v) = std::env::var("TRENDBOT_STATE_DIR") {
            if !v.is_empty() {
                cfg.state_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("TRENDBOT_CANDLE_MODE") {
            match v.to_lowercase().as_str() {
                "local" => cfg.candle_mode = CandleMode::Local,
                "native" | "ws" => cfg.candle_mode = CandleMode::Native,
                other => tracing::warn!("Unknown TRENDBOT_CANDLE_MODE '{}', keeping default", other),
            }
        }

        cfg
    }

    pub fn maker_offset_bps_for(&self, product_id: &str) -> f64 {
        self.maker_offset_bps_per_product
            .get(product_id)
            .copied()
            .unwrap_or(self.maker_offset_bps)
    }

    pub fn candle_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.candle_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

/// Shared, live-mutable configuration
///
/// Readers take a cheap `Arc` snapshot once per decision cycle; writers swap
/// the whole config atomically. Safe to mutate mid-run: in-flight cycles keep
/// the snapshot they started with.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<BotConfig>>>,
}

impl ConfigHandle {
    pub fn new(cfg: BotConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
        }
    }

    pub fn snapshot(&self) -> Arc<BotConfig> {
        self.inner.read().unwrap().clone()
    }

    pub fn replace(&self, cfg: BotConfig) {
        *self.inner.write().unwrap() = Arc::new(cfg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tuning() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.candle_interval_secs, 300);
        assert_eq!(cfg.confirm_candles, 3);
        assert_eq!(cfg.short_ema, 40);
        assert_eq!(cfg.long_ema, 120);
        assert_eq!(cfg.take_profit_bps, 600.0);
        assert_eq!(cfg.hard_stop_bps, Some(100.0));
    }

    #[test]
    fn test_maker_offset_lookup() {
        let cfg = BotConfig::default();
        assert_eq!(cfg.maker_offset_bps_for("ETH-USD"), 16.0);
        // Unlisted products fall back to the global offset
        assert_eq!(cfg.maker_offset_bps_for("BTC-USD"), 5.0);
    }

    #[test]
    fn test_snapshot_is_stable_across_replace() {
        let handle = ConfigHandle::new(BotConfig::default());
        let snap = handle.snapshot();

        let mut updated = BotConfig::default();
        updated.usd_per_order = 99.0;
        handle.replace(updated);

        assert_eq!(snap.usd_per_order, 30.0);
        assert_eq!(handle.snapshot().usd_per_order, 99.0);
    }
}
