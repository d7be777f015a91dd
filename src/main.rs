use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use trendbot::config::{BotConfig, ConfigHandle};
use trendbot::exchange::ws::{MarketStream, StreamCommand, StreamHealth};
use trendbot::exchange::{CoinbaseRest, ExchangeApi, RestGate, RetryPolicy};
use trendbot::execution::Engine;
use trendbot::ledger::{reconcile_window, Ledger};
use trendbot::models::Instrument;
use trendbot::persistence::{log_session_footer, StateStore};
use trendbot::supervisor::{MarketHealth, Supervisor};

/// Final tail sweep at shutdown, in hours; small and cheap
const FINAL_RECONCILE_LOOKBACK_HOURS: u32 = 2;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trendbot=info".into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cfg = BotConfig::from_env();
    tracing::info!(
        "Trendbot starting: {} products, {}s candles, mode {:?}, dry_run={}",
        cfg.product_ids.len(),
        cfg.candle_interval_secs,
        cfg.candle_mode,
        cfg.dry_run
    );

    let api_key = std::env::var("COINBASE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("COINBASE_API_SECRET").unwrap_or_default();
    if (api_key.is_empty() || api_secret.is_empty()) && !cfg.dry_run {
        anyhow::bail!("Missing COINBASE_API_KEY / COINBASE_API_SECRET in environment");
    }

    let gate = RestGate::new(
        cfg.rest_requests_per_sec,
        RetryPolicy {
            max_attempts: cfg.rest_max_attempts,
            ..Default::default()
        },
    );
    let api: Arc<dyn ExchangeApi> = Arc::new(CoinbaseRest::new(api_key, api_secret, gate)?);

    let store = StateStore::new(cfg.state_dir.clone())?;
    let session_start = Utc::now();

    let product_ids = cfg.product_ids.clone();
    let initial_mode = cfg.candle_mode;
    let cfg_handle = ConfigHandle::new(cfg);
    let cfg = cfg_handle.snapshot();

    // Exchange tick constraints, loaded once and immutable for the run
    let mut instruments = HashMap::new();
    for pid in &product_ids {
        let instrument = match api.get_product(pid).await {
            Ok(i) => i,
            Err(e) => {
                tracing::warn!("Could not load increments for {} ({}); using defaults", pid, e);
                Instrument::with_defaults(pid)
            }
        };
        instruments.insert(pid.clone(), instrument);
    }

    // Ledger: restore, sweep offline fills, then baseline this run's P&L
    let ledger = Arc::new(Mutex::new(Ledger::load(
        store.clone(),
        cfg.processed_fills_max,
    )));
    tracing::info!(
        "Gathering trade data from past {} hours...",
        cfg.lookback_hours
    );
    if let Err(e) = reconcile_window(api.as_ref(), &ledger, cfg.lookback_hours, false).await {
        tracing::warn!("Reconcile on startup failed: {}", e);
    }

    // Restored holdings cannot exceed what the exchange will actually let us
    // sell (manual trades may have happened while the bot was down)
    for pid in &product_ids {
        let held = ledger.lock().await.position(pid).qty;
        if held <= 0.0 {
            continue;
        }
        match api
            .get_available_balance(trendbot::execution::base_asset(pid))
            .await
        {
            Ok(available) => ledger.lock().await.clamp_to_available(pid, available),
            Err(e) => tracing::warn!("Startup balance check for {} failed: {}", pid, e),
        }
    }
    ledger.lock().await.set_run_baseline();

    let shutdown = Arc::new(AtomicBool::new(false));
    let stream_health = Arc::new(StreamHealth::new());
    let market_health = Arc::new(MarketHealth::new(initial_mode, &product_ids));

    let (event_tx, event_rx) = mpsc::channel(1024);
    let (ws_cmd_tx, ws_cmd_rx) = mpsc::channel(16);
    let (recovery_tx, recovery_rx) = mpsc::channel(16);

    // Market data stream with its own reconnect loop
    let stream = MarketStream::new(
        product_ids.clone(),
        event_tx,
        ws_cmd_rx,
        stream_health.clone(),
    );
    let stream_task = tokio::spawn(stream.run());

    // Engine: indicator warm-up first, then the candle-close loop
    let mut engine = Engine::new(
        cfg_handle.clone(),
        api.clone(),
        store.clone(),
        instruments,
        ledger.clone(),
        market_health.clone(),
        event_rx,
        recovery_rx,
        shutdown.clone(),
    );
    engine.warmup().await;
    let engine_task = tokio::spawn(engine.run());

    // Watchdogs
    let supervisor = Supervisor::new(
        cfg_handle.clone(),
        stream_health,
        market_health,
        ws_cmd_tx.clone(),
        recovery_tx,
        shutdown.clone(),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    // Mid-session reconcile sweep
    if cfg.mid_reconcile_enabled {
        let api = api.clone();
        let ledger = ledger.clone();
        let cfg_handle = cfg_handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let cfg = cfg_handle.snapshot();
                let interval_secs = (cfg.mid_reconcile_interval_minutes * 60).max(60);
                if sleep_unless_shutdown(&shutdown, interval_secs).await {
                    return;
                }
                tracing::info!("Mid-session reconcile sweep...");
                if let Err(e) =
                    reconcile_window(api.as_ref(), &ledger, cfg.lookback_hours, true).await
                {
                    tracing::warn!("Mid-session reconcile failed: {}", e);
                }
            }
        });
    }

    // One-shot configuration refresh after N hours of runtime
    if cfg.elapsed_refresh_enabled {
        let cfg_handle = cfg_handle.clone();
        let shutdown = shutdown.clone();
        let hours = cfg.elapsed_refresh_hours;
        tokio::spawn(async move {
            let secs = (hours * 3600.0) as u64;
            if sleep_unless_shutdown(&shutdown, secs).await {
                return;
            }
            tracing::info!("Elapsed {}h; refreshing configuration", hours);
            cfg_handle.replace(BotConfig::from_env());
        });
    }

    // Run until Ctrl+C or a task dies
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = supervisor_task => {
            tracing::error!("Supervisor exited: {:?}", result);
        }
        result = stream_task => {
            tracing::error!("Market stream exited: {:?}", result);
        }
    }

    // Cooperative shutdown: flag, stream teardown, final sweep, footer.
    // The flag swap guards the finalize sequence against running twice if a
    // second trigger races the first.
    if !shutdown.swap(true, Ordering::SeqCst) {
        let _ = ws_cmd_tx.send(StreamCommand::Shutdown).await;

        let session_cash_pnl = engine_task.await.unwrap_or(0.0);

        tracing::info!("Final reconcile...");
        if let Err(e) = reconcile_window(
            api.as_ref(),
            &ledger,
            FINAL_RECONCILE_LOOKBACK_HOURS,
            true,
        )
        .await
        {
            tracing::warn!("Final reconcile failed: {}", e);
        }

        let guard = ledger.lock().await;
        let run_total = guard.run_delta() + session_cash_pnl;
        let lifetime = guard.realized_pnl();
        drop(guard);
        log_session_footer(&store, run_total, lifetime, session_start);
        tracing::info!(
            "Session P&L logged: this run ${:.8} | lifetime ${:.8}",
            run_total,
            lifetime
        );
    }

    tracing::info!("Exiting bot...");
    Ok(())
}

/// Sleep in small steps so shutdown stays responsive; returns true if
/// shutdown was requested
async fn sleep_unless_shutdown(shutdown: &AtomicBool, secs: u64) -> bool {
    let step = Duration::from_secs(5);
    let mut slept = 0u64;
    while slept < secs {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::sleep(step.min(Duration::from_secs(secs - slept))).await;
        slept += 5;
    }
    shutdown.load(Ordering::SeqCst)
}
