use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::candles::CandlePipeline;
use crate::config::{CandleMode, ConfigHandle};
use crate::exchange::ws::StreamEvent;
use crate::exchange::{ExchangeApi, LimitOrderParams, MarketOrderParams, OrderAck};
use crate::indicators::IndicatorSet;
use crate::ledger::{self, Ledger};
use crate::models::{Candle, Instrument, OrderIntent, Quote, Side, TradeReason};
use crate::persistence::{log_trade_line, LastTradeTracker, SpendTracker, StateStore};
use crate::strategy::{
    advisor_allows, evaluate_exit, AdvisorInputs, CrossoverMachine, ExitInputs, Quartermaster,
};
use crate::supervisor::{MarketHealth, RecoveryAction};

use super::balances::{base_asset, BalanceCache};
use super::pricing::{
    compute_maker_limit, format_to_inc, market_sell_base_size, min_market_size, round_down_to_inc,
};

/// How far back a backstop sweep looks, in candle intervals
const BACKSTOP_WINDOW_INTERVALS: i64 = 10;

/// Per-candle-close orchestration: indicators -> quartermaster -> crossover
/// -> gates -> order submission -> immediate fill sweep
///
/// All candle-close processing for one instrument happens on this task;
/// background reconciliation shares only the ledger, behind its lock.
pub struct Engine {
    cfg: ConfigHandle,
    api: Arc<dyn ExchangeApi>,
    store: StateStore,
    instruments: HashMap<String, Instrument>,
    indicators: HashMap<String, IndicatorSet>,
    crossover: CrossoverMachine,
    quartermaster: Quartermaster,
    ledger: Arc<Mutex<Ledger>>,
    balances: BalanceCache,
    quotes: HashMap<String, Quote>,
    spend: SpendTracker,
    last_trades: LastTradeTracker,
    pipeline: CandlePipeline,
    market: Arc<MarketHealth>,
    events: mpsc::Receiver<StreamEvent>,
    recovery: mpsc::Receiver<RecoveryAction>,
    shutdown: Arc<AtomicBool>,
    session_cash_pnl: f64,
    daily_cap_logged: bool,
}

#[allow(clippy::too_many_arguments)]
impl Engine {
    pub fn new(
        cfg: ConfigHandle,
        api: Arc<dyn ExchangeApi>,
        store: StateStore,
        instruments: HashMap<String, Instrument>,
        ledger: Arc<Mutex<Ledger>>,
        market: Arc<MarketHealth>,
        events: mpsc::Receiver<StreamEvent>,
        recovery: mpsc::Receiver<RecoveryAction>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let snapshot = cfg.snapshot();
        let mut indicators = HashMap::new();
        for pid in &snapshot.product_ids {
            indicators.insert(
                pid.clone(),
                IndicatorSet::new(
                    snapshot.short_ema,
                    snapshot.long_ema,
                    snapshot.rsi_period,
                    snapshot.macd_fast,
                    snapshot.macd_slow,
                    snapshot.macd_signal,
                ),
            );
        }
        let balances = BalanceCache::new(
            api.clone(),
            Duration::from_secs(snapshot.balance_cache_ttl_secs),
        );
        let pipeline = CandlePipeline::new(snapshot.candle_interval_secs, snapshot.settle_delay_ms);
        let spend = SpendTracker::load(store.clone());
        let last_trades = LastTradeTracker::load(store.clone());

        Self {
            cfg,
            api,
            store,
            instruments,
            indicators,
            crossover: CrossoverMachine::new(),
            quartermaster: Quartermaster::new(),
            ledger,
            balances,
            quotes: HashMap::new(),
            spend,
            last_trades,
            pipeline,
            market,
            events,
            recovery,
            shutdown,
            session_cash_pnl: 0.0,
            daily_cap_logged: false,
        }
    }

    /// Pre-seed indicators from candle history so the crossover machine is
    /// meaningful from the first live bar; the signal machine never sees
    /// these closes
    pub async fn warmup(&mut self) {
        let cfg = self.cfg.snapshot();
        if !cfg.use_backfill {
            return;
        }
        let end = Utc::now();
        let start = end
            - chrono::Duration::seconds(
                cfg.candle_interval_secs as i64 * cfg.warmup_candles as i64,
            );

        for pid in cfg.product_ids.clone() {
            match self
                .api
                .get_candles(&pid, start, end, cfg.candle_interval_secs)
                .await
            {
                Ok(bars) => {
                    // drop the still-open bucket; only closed bars count
                    let cutoff =
                        Utc::now() - chrono::Duration::seconds(cfg.candle_interval_secs as i64);
                    let closed: Vec<_> = bars.into_iter().filter(|b| b.start <= cutoff).collect();
                    if let Some(ind) = self.indicators.get_mut(&pid) {
                        for bar in &closed {
                            ind.update(bar.close);
                        }
                    }
                    if let Some(last) = closed.last() {
                        self.pipeline.prime_last_emitted(&pid, last.start);
                    }
                    tracing::info!("Warmed up {} with {} candles", pid, closed.len());
                }
                Err(e) => {
                    tracing::warn!("Warm-up backfill for {} failed: {}", pid, e);
                }
            }
        }
    }

    /// Event loop; returns the session's dry-run cash P&L at shutdown
    pub async fn run(mut self) -> f64 {
        let mut drain = tokio::time::interval(Duration::from_millis(100));
        drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                tracing::info!("Engine stopping");
                break;
            }

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_stream_event(event).await,
                    None => {
                        tracing::info!("Stream channel closed; engine stopping");
                        break;
                    }
                },
                action = self.recovery.recv() => {
                    if let Some(action) = action {
                        self.on_recovery(action).await;
                    }
                }
                _ = drain.tick() => {
                    for candle in self.pipeline.drain_settled(Instant::now()) {
                        self.on_candle_close(candle).await;
                    }
                }
            }
        }
        self.session_cash_pnl
    }

    async fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Ticker {
                product_id,
                price,
                best_bid,
                best_ask,
            } => {
                let quote = self.quotes.entry(product_id.clone()).or_default();
                if best_bid.is_some() {
                    quote.bid = best_bid;
                }
                if best_ask.is_some() {
                    quote.ask = best_ask;
                }
                quote.last = Some(price);

                if self.market.mode() == CandleMode::Local {
                    self.pipeline
                        .on_tick(&product_id, price, Utc::now(), Instant::now());
                    for candle in self.pipeline.drain_settled(Instant::now()) {
                        self.on_candle_close(candle).await;
                    }
                }
            }
            StreamEvent::Bar(bar) => {
                if self.market.mode() == CandleMode::Native {
                    if let Some(closed) = self.pipeline.on_native_bar(bar) {
                        self.on_candle_close(closed).await;
                    }
                }
            }
            StreamEvent::Heartbeat => {}
        }
    }

    async fn on_recovery(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::BackstopSweep(product_ids) => {
                let cfg = self.cfg.snapshot();
                let end = Utc::now();
                let start = end
                    - chrono::Duration::seconds(
                        cfg.candle_interval_secs as i64 * BACKSTOP_WINDOW_INTERVALS,
                    );
                for pid in product_ids {
                    match self
                        .api
                        .get_candles(&pid, start, end, cfg.candle_interval_secs)
                        .await
                    {
                        Ok(bars) => {
                            let synthesized =
                                self.pipeline.accept_backstop(&pid, &bars, Utc::now());
                            if !synthesized.is_empty() {
                                tracing::info!(
                                    "Backstop synthesized {} missed closes for {}",
                                    synthesized.len(),
                                    pid
                                );
                            }
                            for candle in synthesized {
                                self.on_candle_close(candle).await;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Backstop poll for {} failed: {}", pid, e);
                        }
                    }
                }
            }
        }
    }

    /// One decisive action per instrument per candle: the quartermaster runs
    /// first and preempts the crossover machine when it fires
    async fn on_candle_close(&mut self, candle: Candle) {
        let cfg = self.cfg.snapshot();
        let pid = candle.product_id.clone();
        self.market.record_close(&pid);

        let Some(ind) = self.indicators.get_mut(&pid) else {
            return;
        };
        let (short, long) = ind.update(candle.close);
        let rsi = ind.rsi.value();
        let macd_hist = ind.macd.hist();
        let candles_seen = ind.candles_seen;

        self.quotes.entry(pid.clone()).or_default().last = Some(candle.close);

        if cfg.enable_quartermaster && self.run_quartermaster(&pid, candle.close, macd_hist).await {
            return;
        }

        if candles_seen < cfg.min_candles as u64 {
            return;
        }

        let allow_grace = self.market.mode() == CandleMode::Local;
        let Some(signal) = self.crossover.on_close(
            &pid,
            short,
            long,
            cfg.ema_deadband_bps,
            cfg.confirm_candles,
            allow_grace,
        ) else {
            return;
        };

        self.on_signal(&pid, signal, candle.close, rsi, macd_hist).await;
    }

    /// Exit overlay; returns true when it took the candle's decisive action
    async fn run_quartermaster(&mut self, pid: &str, last_price: f64, macd_hist: Option<f64>) -> bool {
        let cfg = self.cfg.snapshot();

        let cached = {
            let guard = self.ledger.lock().await;
            guard.position(pid)
        };
        if cached.qty <= 0.0 {
            return false;
        }

        // the exchange is authoritative for what we can actually sell
        let live = self.balances.try_available(base_asset(pid)).await;
        let position = if let Some(live) = live {
            let mut guard = self.ledger.lock().await;
            guard.clamp_to_available(pid, live);
            guard.position(pid)
        } else {
            cached
        };
        if position.qty <= 0.0 {
            return false;
        }

        let inputs = ExitInputs {
            last_price,
            entry_price: position.cost_basis,
            opened_at: position.opened_at,
            macd_hist,
        };
        let Some(reason) = evaluate_exit(&inputs, Utc::now(), &cfg) else {
            return false;
        };

        let now = Instant::now();
        if self.quartermaster.dust_suppressed(pid, now) {
            return false;
        }

        let Some(instrument) = self.instruments.get(pid) else {
            return false;
        };
        let required = min_market_size(instrument);
        if position.qty < required {
            tracing::info!(
                "{} exit wanted ({}) but held {:.8} is dust (< {:.8}); suppressing",
                pid,
                reason,
                position.qty,
                required
            );
            self.quartermaster
                .suppress_dust(pid, Duration::from_secs(cfg.dust_suppress_secs), now);
            return false;
        }

        if self.quartermaster.rate_limited(
            pid,
            Duration::from_secs(cfg.quartermaster_min_interval_secs),
            now,
        ) {
            return false;
        }
        self.quartermaster.mark_attempt(pid, now);

        tracing::info!(
            "Quartermaster {} for {}: qty {:.8} @ {:.6}",
            reason,
            pid,
            position.qty,
            last_price
        );
        self.submit_order(
            pid,
            Side::Sell,
            position.qty * last_price,
            last_price,
            reason,
            true,
        )
        .await;
        true
    }

    /// Gate a fired crossover signal: cooldown -> position -> hard stop ->
    /// advisor veto -> daily BUY cap, then submit
    async fn on_signal(
        &mut self,
        pid: &str,
        side: Side,
        price: f64,
        rsi: Option<f64>,
        macd_hist: Option<f64>,
    ) {
        let cfg = self.cfg.snapshot();

        if !self.last_trades.ok(pid, cfg.per_product_cooldown_secs) {
            tracing::debug!("Skip {} {}: cooldown active", side, pid);
            return;
        }

        if side == Side::Sell {
            if cfg.reconcile_on_sell_attempt {
                // quick bounded sweep so held quantity is fresh
                if let Err(e) =
                    ledger::reconcile_window(self.api.as_ref(), &self.ledger, 6, true).await
                {
                    tracing::debug!("Pre-SELL reconcile failed: {}", e);
                }
            }

            let cached = {
                let guard = self.ledger.lock().await;
                guard.position(pid)
            };
            let live = self
                .balances
                .try_available(base_asset(pid))
                .await
                .unwrap_or(0.0);
            if cached.qty.max(live) <= 0.0 {
                tracing::info!("Skip SELL {}: no position held", pid);
                return;
            }

            // hard stop-loss short-circuits every remaining gate
            if let Some(stop_bps) = cfg.hard_stop_bps {
                if cached.cost_basis > 0.0 {
                    let floor = cached.cost_basis * (1.0 - stop_bps / 10_000.0);
                    if price < floor {
                        tracing::warn!(
                            "Hard stop for {}: price {:.6} < floor {:.6} (cb {:.6})",
                            pid,
                            price,
                            floor,
                            cached.cost_basis
                        );
                        self.submit_order(
                            pid,
                            Side::Sell,
                            cached.qty * price,
                            price,
                            TradeReason::StopLoss,
                            true,
                        )
                        .await;
                        return;
                    }
                }
            }
        }

        if cfg.enable_advisors {
            let inputs = AdvisorInputs {
                rsi,
                macd_hist,
                last_price: price,
            };
            if !advisor_allows(side, &inputs, &cfg) {
                tracing::info!(
                    "Advisor veto {} {} (RSI={}, MACD_hist={})",
                    side,
                    pid,
                    rsi.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".to_string()),
                    macd_hist
                        .map(|v| format!("{v:.5}"))
                        .unwrap_or_else(|| "n/a".to_string()),
                );
                return;
            }
        }

        let notional = if side == Side::Buy {
            // SELLs are never capped
            let remaining = (cfg.daily_spend_cap_usd - self.spend.today_total()).max(0.0);
            if remaining <= 0.0 {
                if !self.daily_cap_logged {
                    tracing::info!(
                        "Daily BUY cap reached (${:.2}); skipping buys until tomorrow",
                        cfg.daily_spend_cap_usd
                    );
                    self.daily_cap_logged = true;
                }
                return;
            }
            self.daily_cap_logged = false;
            cfg.usd_per_order.min(remaining)
        } else {
            cfg.usd_per_order
        };

        self.submit_order(pid, side, notional, price, TradeReason::EmaCross, false)
            .await;
    }

    /// Price, size, and submit one order, then sweep its immediate fills
    async fn submit_order(
        &mut self,
        pid: &str,
        side: Side,
        quote_usd: f64,
        last_price: f64,
        reason: TradeReason,
        force_market: bool,
    ) {
        let cfg = self.cfg.snapshot();
        let display_qty = if last_price > 0.0 {
            quote_usd / last_price
        } else {
            0.0
        };
        log_trade_line(
            &self.store,
            pid,
            side.as_str(),
            quote_usd,
            last_price,
            display_qty,
            cfg.dry_run,
        );

        if cfg.dry_run {
            match side {
                Side::Buy => self.session_cash_pnl -= quote_usd,
                Side::Sell => self.session_cash_pnl += quote_usd,
            }
            if side == Side::Buy {
                self.spend.add(quote_usd);
            }
            self.last_trades.stamp(pid);
            tracing::info!("[DRY RUN] {} {} ${:.2} ({})", side, pid, quote_usd, reason);
            return;
        }

        let Some(instrument) = self.instruments.get(pid).cloned() else {
            tracing::error!("No instrument metadata for {}; order skipped", pid);
            return;
        };

        let prefer_maker = !force_market
            && match side {
                Side::Buy => cfg.prefer_maker,
                Side::Sell => cfg.prefer_maker && cfg.prefer_maker_for_sells,
            };

        let client_order_id = format!(
            "ema-{}-{}-{}",
            pid,
            Utc::now().timestamp(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let submitted = if prefer_maker {
            self.submit_maker(&instrument, side, quote_usd, last_price, &client_order_id, &cfg)
                .await
        } else {
            self.submit_market(&instrument, side, quote_usd, last_price, &client_order_id, &cfg)
                .await
        };

        let Some((ack, sized_base)) = submitted else {
            return; // sized to nothing or rejected before submission; already logged
        };

        if !ack.accepted {
            tracing::error!(
                "{} order FAILED for {} ${:.2}: {}",
                side,
                pid,
                quote_usd,
                ack.error.as_deref().unwrap_or("ambiguous response")
            );
            return;
        }

        if side == Side::Buy {
            self.spend.add(quote_usd);
        }
        self.last_trades.stamp(pid);
        self.balances.invalidate(base_asset(pid));

        tracing::info!(
            "Live {} {} ${:.2} placed ({}), order id {}",
            side,
            pid,
            quote_usd,
            reason,
            ack.order_id.as_deref().unwrap_or("n/a")
        );

        if let Some(order_id) = ack.order_id {
            {
                let mut guard = self.ledger.lock().await;
                guard.record_intent(
                    order_id.clone(),
                    OrderIntent {
                        product_id: pid.to_string(),
                        side,
                        quote_usd,
                        base_size: sized_base,
                        reference_price: last_price,
                        reason,
                        submitted_at: Utc::now(),
                    },
                );
            }
            self.sweep_order_fills(&order_id).await;
        }
    }

    async fn submit_maker(
        &mut self,
        instrument: &Instrument,
        side: Side,
        quote_usd: f64,
        last_price: f64,
        client_order_id: &str,
        cfg: &crate::config::BotConfig,
    ) -> Option<(OrderAck, Option<f64>)> {
        let pid = &instrument.product_id;
        let quote = self.quotes.get(pid).copied().unwrap_or_default();
        let offset_bps = cfg.maker_offset_bps_for(pid);
        let (limit_price, mut base_size) =
            compute_maker_limit(side, last_price, &quote, instrument, quote_usd, offset_bps);

        if side == Side::Sell {
            let held = {
                let guard = self.ledger.lock().await;
                guard.position(pid).qty
            };
            let live = self
                .balances
                .try_available(base_asset(pid))
                .await
                .unwrap_or(held);
            base_size = round_down_to_inc(
                base_size.min(held).min(live),
                instrument.base_increment,
            );
        }

        if limit_price <= 0.0 || base_size <= 0.0 {
            tracing::error!(
                "Invalid maker params for {} {}: price={:.8} size={:.8}",
                side,
                pid,
                limit_price,
                base_size
            );
            return None;
        }
        if base_size < instrument.base_increment {
            tracing::info!(
                "Skip {} {}: size {:.8} below base increment; suppressing dust",
                side,
                pid,
                base_size
            );
            self.quartermaster.suppress_dust(
                pid,
                Duration::from_secs(cfg.dust_suppress_secs),
                Instant::now(),
            );
            return None;
        }

        let params = LimitOrderParams {
            client_order_id: client_order_id.to_string(),
            product_id: pid.clone(),
            side,
            base_size: format_to_inc(base_size, instrument.base_increment),
            limit_price: format_to_inc(limit_price, instrument.price_increment),
            post_only: true,
        };
        match self.api.submit_limit_order(&params).await {
            Ok(ack) => Some((ack, Some(base_size))),
            Err(e) => {
                tracing::error!("{} maker order error for {}: {}", side, pid, e);
                None
            }
        }
    }

    async fn submit_market(
        &mut self,
        instrument: &Instrument,
        side: Side,
        quote_usd: f64,
        last_price: f64,
        client_order_id: &str,
        cfg: &crate::config::BotConfig,
    ) -> Option<(OrderAck, Option<f64>)> {
        let pid = &instrument.product_id;
        let mut sized_base = None;
        let params = match side {
            Side::Buy => MarketOrderParams {
                client_order_id: client_order_id.to_string(),
                product_id: pid.clone(),
                side,
                quote_size: Some(format!("{quote_usd:.2}")),
                base_size: None,
            },
            Side::Sell => {
                let held = {
                    let guard = self.ledger.lock().await;
                    guard.position(pid).qty
                };
                let live = self
                    .balances
                    .try_available(base_asset(pid))
                    .await
                    .unwrap_or(held);
                let size = market_sell_base_size(
                    quote_usd,
                    last_price,
                    held,
                    live,
                    instrument,
                    cfg.full_exit_shave_increments,
                );
                if size < min_market_size(instrument) || size <= 0.0 {
                    tracing::info!(
                        "Skip market SELL {}: size {:.8} below minimum {:.8}; suppressing dust",
                        pid,
                        size,
                        min_market_size(instrument)
                    );
                    self.quartermaster.suppress_dust(
                        pid,
                        Duration::from_secs(cfg.dust_suppress_secs),
                        Instant::now(),
                    );
                    return None;
                }
                sized_base = Some(size);
                MarketOrderParams {
                    client_order_id: client_order_id.to_string(),
                    product_id: pid.clone(),
                    side,
                    quote_size: None,
                    base_size: Some(format_to_inc(size, instrument.base_increment)),
                }
            }
        };
        match self.api.submit_market_order(&params).await {
            Ok(ack) => Some((ack, sized_base)),
            Err(e) => {
                tracing::error!("{} market order error for {}: {}", side, pid, e);
                None
            }
        }
    }

    /// Best-effort immediate fill fetch for a just-submitted order
    async fn sweep_order_fills(&mut self, order_id: &str) {
        let fills = match self.api.get_fills_by_order(order_id).await {
            Ok(fills) => fills,
            Err(e) => {
                tracing::debug!("Could not fetch immediate fills for {}: {}", order_id, e);
                return;
            }
        };
        if fills.is_empty() {
            return;
        }

        let mut guard = self.ledger.lock().await;
        let summary = guard.apply_fills(&fills, None);
        if summary.any_new() {
            let flags: Vec<&str> = summary
                .liquidity_flags
                .iter()
                .map(|s| s.as_str())
                .collect();
            tracing::info!(
                "Updated from immediate fills. Fees: ${:.2} | liquidity: {} | Lifetime P&L: ${:.8} | This run: ${:.8}",
                summary.fees,
                if flags.is_empty() { "n/a".to_string() } else { flags.join(",") },
                guard.realized_pnl(),
                guard.run_delta()
            );
        }
    }
}
