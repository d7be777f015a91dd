// Connection-resilience supervisor: idle and candle-stall watchdogs driving
// resubscribe/reconnect escalation and candle-mode failover

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::config::{CandleMode, ConfigHandle};
use crate::exchange::ws::{StreamCommand, StreamHealth};

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Recovery work the supervisor hands to the engine
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// Poll REST candle history for these products and synthesize missed closes
    BackstopSweep(Vec<String>),
}

/// Candle-side liveness shared between the engine and the supervisor
///
/// The engine records each dispatched close; the supervisor reads ages and
/// owns the active candle mode.
#[derive(Debug)]
pub struct MarketHealth {
    last_close: Mutex<HashMap<String, Instant>>,
    mode: Mutex<CandleMode>,
    mode_flipped_at: Mutex<Option<Instant>>,
}

impl MarketHealth {
    pub fn new(initial_mode: CandleMode, product_ids: &[String]) -> Self {
        let now = Instant::now();
        let last_close = product_ids.iter().map(|p| (p.clone(), now)).collect();
        Self {
            last_close: Mutex::new(last_close),
            mode: Mutex::new(initial_mode),
            mode_flipped_at: Mutex::new(None),
        }
    }

    pub fn record_close(&self, product_id: &str) {
        self.last_close
            .lock()
            .unwrap()
            .insert(product_id.to_string(), Instant::now());
    }

    pub fn close_age(&self, product_id: &str) -> Option<Duration> {
        self.last_close
            .lock()
            .unwrap()
            .get(product_id)
            .map(|at| at.elapsed())
    }

    pub fn mode(&self) -> CandleMode {
        *self.mode.lock().unwrap()
    }

    /// Flip the candle producer; stall checks pause for a grace period so the
    /// first bar of the new producer isn't judged by the old clock
    pub fn set_mode(&self, mode: CandleMode) {
        let mut current = self.mode.lock().unwrap();
        if *current != mode {
            *current = mode;
            *self.mode_flipped_at.lock().unwrap() = Some(Instant::now());
            // restart the stall clocks under the new producer
            let now = Instant::now();
            for at in self.last_close.lock().unwrap().values_mut() {
                *at = now;
            }
        }
    }

    pub fn in_mode_grace(&self, grace: Duration) -> bool {
        self.mode_flipped_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed() < grace)
            .unwrap_or(false)
    }
}

/// Watchdog loop wrapping the stream and the candle flow
///
/// Escalation ladder: warn -> resubscribe -> reconnect -> mode fallback.
/// Never fatal; every step is logged.
pub struct Supervisor {
    cfg: ConfigHandle,
    stream: Arc<StreamHealth>,
    market: Arc<MarketHealth>,
    ws_commands: mpsc::Sender<StreamCommand>,
    recovery: mpsc::Sender<RecoveryAction>,
    shutdown: Arc<AtomicBool>,

    idle_warned: bool,
    last_forced_reconnect: Option<Instant>,
    idle_reconnects: u32,
    consecutive_stalls: HashMap<String, u32>,
    last_resubscribe: Option<Instant>,
    last_backstop: HashMap<String, Instant>,
}

impl Supervisor {
    pub fn new(
        cfg: ConfigHandle,
        stream: Arc<StreamHealth>,
        market: Arc<MarketHealth>,
        ws_commands: mpsc::Sender<StreamCommand>,
        recovery: mpsc::Sender<RecoveryAction>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            stream,
            market,
            ws_commands,
            recovery,
            shutdown,
            idle_warned: false,
            last_forced_reconnect: None,
            idle_reconnects: 0,
            consecutive_stalls: HashMap::new(),
            last_resubscribe: None,
            last_backstop: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(CHECK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("Supervisor stopping");
                return;
            }
            self.check_idle().await;
            self.check_candle_stalls().await;
        }
    }

    /// Raw stream liveness: warn, then force a reconnect, then fall back to
    /// local aggregation after repeated idle reconnects
    async fn check_idle(&mut self) {
        let cfg = self.cfg.snapshot();
        let idle = self.stream.idle_for();

        if idle < Duration::from_secs(cfg.idle_warn_secs) {
            self.idle_warned = false;
            return;
        }

        if !self.idle_warned {
            tracing::warn!("Stream idle for {:?}", idle);
            self.idle_warned = true;
        }

        if idle < Duration::from_secs(cfg.idle_reconnect_secs) {
            return;
        }
        let recently_forced = self
            .last_forced_reconnect
            .map(|at| at.elapsed() < Duration::from_secs(cfg.idle_reconnect_secs))
            .unwrap_or(false);
        if recently_forced {
            return;
        }

        self.idle_reconnects += 1;
        self.last_forced_reconnect = Some(Instant::now());
        tracing::warn!(
            "Stream idle for {:?}; forcing reconnect ({} idle reconnects so far)",
            idle,
            self.idle_reconnects
        );
        let _ = self.ws_commands.send(StreamCommand::Reconnect).await;

        if self.idle_reconnects >= cfg.idle_reconnects_before_fallback
            && self.market.mode() == CandleMode::Native
        {
            tracing::warn!(
                "{} idle reconnects; falling back to local candle aggregation",
                self.idle_reconnects
            );
            self.market.set_mode(CandleMode::Local);
        }
    }

    /// Candle flow, independent of raw liveness: the stream can be chatty
    /// while the candle channel is dead
    async fn check_candle_stalls(&mut self) {
        let cfg = self.cfg.snapshot();
        let interval = Duration::from_secs(cfg.candle_interval_secs);
        if self.market.in_mode_grace(interval) {
            return;
        }

        let threshold = interval.mul_f64(cfg.stall_factor.max(1.0));
        let mut stalled: Vec<String> = Vec::new();
        for pid in &cfg.product_ids {
            match self.market.close_age(pid) {
                Some(age) if age > threshold => stalled.push(pid.clone()),
                _ => {
                    self.consecutive_stalls.remove(pid);
                }
            }
        }
        if stalled.is_empty() {
            return;
        }

        // majority stalled in native mode: the candle channel itself is the
        // problem; flip immediately
        if self.market.mode() == CandleMode::Native && stalled.len() * 2 > cfg.product_ids.len() {
            tracing::warn!(
                "{}/{} instruments stalled; flipping to local candle aggregation",
                stalled.len(),
                cfg.product_ids.len()
            );
            self.market.set_mode(CandleMode::Local);
            self.consecutive_stalls.clear();
            return;
        }

        let mut escalate = false;
        for pid in &stalled {
            let n = self.consecutive_stalls.entry(pid.clone()).or_insert(0);
            *n += 1;
            if *n >= cfg.stalls_before_reconnect {
                escalate = true;
            }
        }

        // throttled REST backstop for the stalled instruments
        let now = Instant::now();
        let min_poll = Duration::from_secs(cfg.backstop_min_poll_secs);
        let sweep: Vec<String> = stalled
            .iter()
            .filter(|pid| {
                self.last_backstop
                    .get(*pid)
                    .map(|at| now.duration_since(*at) >= min_poll)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !sweep.is_empty() {
            for pid in &sweep {
                self.last_backstop.insert(pid.clone(), now);
            }
            tracing::info!("Requesting backstop sweep for {} instruments", sweep.len());
            let _ = self.recovery.send(RecoveryAction::BackstopSweep(sweep)).await;
        }

        if escalate {
            tracing::warn!(
                "Candle stalls persisted {} checks; escalating to hard reconnect",
                cfg.stalls_before_reconnect
            );
            let _ = self.ws_commands.send(StreamCommand::Reconnect).await;
            self.consecutive_stalls.clear();
        } else {
            let debounced = self
                .last_resubscribe
                .map(|at| at.elapsed() < threshold)
                .unwrap_or(false);
            if !debounced {
                tracing::info!("{} instruments stalled; issuing resubscribe", stalled.len());
                self.last_resubscribe = Some(Instant::now());
                let _ = self.ws_commands.send(StreamCommand::Resubscribe).await;
            }
        }
    }
}
