use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::BotConfig;
use crate::models::TradeReason;

/// Inputs for one quartermaster evaluation of a held position
#[derive(Debug, Clone, Copy)]
pub struct ExitInputs {
    pub last_price: f64,
    /// Fee-inclusive weighted-average entry price
    pub entry_price: f64,
    pub opened_at: Option<DateTime<Utc>>,
    pub macd_hist: Option<f64>,
}

/// Pure exit decision: take-profit and stagnation checks
///
/// Runs before the crossover machine for any instrument with a positive held
/// quantity. Rate limiting and dust suppression are the caller-visible state
/// on [`Quartermaster`].
pub fn evaluate_exit(inputs: &ExitInputs, now: DateTime<Utc>, cfg: &BotConfig) -> Option<TradeReason> {
    if inputs.entry_price <= 0.0 || inputs.last_price <= 0.0 {
        return None;
    }
    let profit_bps = (inputs.last_price / inputs.entry_price - 1.0) * 10_000.0;

    // Take-profit, unless momentum-respect defers to the crossover machine
    if profit_bps >= cfg.take_profit_bps {
        let still_running = cfg.quartermaster_respect_macd
            && inputs
                .macd_hist
                .map(|h| h > cfg.flat_macd_abs_max)
                .unwrap_or(false);
        if !still_running {
            return Some(TradeReason::TakeProfit);
        }
    }

    // Stagnation: held too long, going nowhere, MACD flat or unavailable
    if let Some(opened_at) = inputs.opened_at {
        let hold_hours = (now - opened_at).num_seconds() as f64 / 3600.0;
        let flat_macd = inputs
            .macd_hist
            .map(|h| h.abs() <= cfg.flat_macd_abs_max)
            .unwrap_or(true);
        if hold_hours >= cfg.max_hold_hours
            && profit_bps.abs() < cfg.stagnation_close_bps
            && flat_macd
        {
            return Some(TradeReason::Stagnation);
        }
    }

    None
}

/// Attempt pacing for the exit overlay: a per-instrument rate-limit floor
/// plus a dust-suppression window after undersized exits
#[derive(Debug, Default)]
pub struct Quartermaster {
    last_attempt: HashMap<String, Instant>,
    dust_until: HashMap<String, Instant>,
}

impl Quartermaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limited(&self, product_id: &str, min_interval: Duration, now: Instant) -> bool {
        self.last_attempt
            .get(product_id)
            .map(|at| now.duration_since(*at) < min_interval)
            .unwrap_or(false)
    }

    pub fn mark_attempt(&mut self, product_id: &str, now: Instant) {
        self.last_attempt.insert(product_id.to_string(), now);
    }

    pub fn dust_suppressed(&self, product_id: &str, now: Instant) -> bool {
        self.dust_until
            .get(product_id)
            .map(|until| now < *until)
            .unwrap_or(false)
    }

    /// Held quantity is below the exchange minimum; stop retrying for a while
    pub fn suppress_dust(&mut self, product_id: &str, window: Duration, now: Instant) {
        self.dust_until.insert(product_id.to_string(), now + window);
    }
}
