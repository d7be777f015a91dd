use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::models::Candle;

const WS_URL: &str = "wss://advanced-trade-ws.coinbase.com";
const CHANNELS: &[&str] = &["ticker", "candles", "heartbeats"];

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Parsed market-data events forwarded to the engine
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Ticker {
        product_id: String,
        price: f64,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
    },
    /// Native candle update; the pipeline closes the previous bar when a
    /// bar's start moves forward
    Bar(Candle),
    Heartbeat,
}

/// Control commands issued by the resilience supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    /// Re-send channel subscriptions on the live connection
    Resubscribe,
    /// Close and reopen the connection
    Reconnect,
    Ping,
    Shutdown,
}

/// Liveness counters shared with the supervisor
#[derive(Debug)]
pub struct StreamHealth {
    last_message: Mutex<Instant>,
    reconnects: AtomicU32,
}

impl StreamHealth {
    pub fn new() -> Self {
        Self {
            last_message: Mutex::new(Instant::now()),
            reconnects: AtomicU32::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_message.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_message.lock().unwrap().elapsed()
    }

    pub fn record_reconnect(&self) -> u32 {
        self.reconnects.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Market-data websocket with a supervised reconnect loop
///
/// Runs until a `Shutdown` command arrives or the event receiver is dropped.
/// Connection losses are never fatal: the loop backs off and reopens.
pub struct MarketStream {
    product_ids: Vec<String>,
    events: mpsc::Sender<StreamEvent>,
    commands: mpsc::Receiver<StreamCommand>,
    health: std::sync::Arc<StreamHealth>,
    url: String,
}

impl MarketStream {
    pub fn new(
        product_ids: Vec<String>,
        events: mpsc::Sender<StreamEvent>,
        commands: mpsc::Receiver<StreamCommand>,
        health: std::sync::Arc<StreamHealth>,
    ) -> Self {
        Self {
            product_ids,
            events,
            commands,
            health,
            url: WS_URL.to_string(),
        }
    }

    pub async fn run(mut self) {
        let mut backoff_secs = 1u64;

        loop {
            match connect_async(self.url.as_str()).await {
                Ok((mut ws, _)) => {
                    tracing::info!("Market stream connected");
                    backoff_secs = 1;
                    self.health.touch();

                    if let Err(e) = self.subscribe(&mut ws).await {
                        tracing::warn!("Subscribe failed: {}", e);
                    } else {
                        tracing::info!(
                            "Subscribed to {:?} for {} products",
                            CHANNELS,
                            self.product_ids.len()
                        );
                    }

                    if self.read_until_drop(&mut ws).await {
                        // Shutdown requested
                        let _ = ws.close(None).await;
                        tracing::info!("Market stream shut down");
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Market stream connect failed: {}", e);
                }
            }

            let n = self.health.record_reconnect();
            tracing::warn!(
                "Market stream reconnecting in {}s (reconnect #{})",
                backoff_secs,
                n
            );
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            backoff_secs = (backoff_secs * 2).min(60);
        }
    }

    /// Pump one connection; returns true if shutdown was requested
    async fn read_until_drop(&mut self, ws: &mut WsStream) -> bool {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None | Some(StreamCommand::Shutdown) => return true,
                    Some(StreamCommand::Reconnect) => {
                        tracing::info!("Supervisor requested stream reconnect");
                        let _ = ws.close(None).await;
                        return false;
                    }
                    Some(StreamCommand::Resubscribe) => {
                        tracing::info!("Supervisor requested resubscribe");
                        if let Err(e) = self.subscribe(ws).await {
                            tracing::warn!("Resubscribe failed: {}", e);
                            return false;
                        }
                    }
                    Some(StreamCommand::Ping) => {
                        if ws.send(Message::Ping(Vec::new())).await.is_err() {
                            return false;
                        }
                    }
                },
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.health.touch();
                        for event in parse_message(&text) {
                            if self.events.send(event).await.is_err() {
                                // engine gone; treat as shutdown
                                return true;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        self.health.touch();
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.health.touch();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!("Market stream closed by peer: {:?}", frame);
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Market stream read error: {}", e);
                        return false;
                    }
                    None => {
                        tracing::warn!("Market stream ended");
                        return false;
                    }
                },
            }
        }
    }

    async fn subscribe(&self, ws: &mut WsStream) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        for channel in CHANNELS {
            let sub = json!({
                "type": "subscribe",
                "channel": channel,
                "product_ids": self.product_ids,
            });
            ws.send(Message::Text(sub.to_string())).await?;
        }
        Ok(())
    }
}

/// Parse one websocket text frame into zero or more events
///
/// Unparseable frames are dropped with a debug log; they never crash the
/// pipeline.
pub fn parse_message(text: &str) -> Vec<StreamEvent> {
    let msg: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!("Non-JSON stream message");
            return Vec::new();
        }
    };

    let channel = msg.get("channel").and_then(|c| c.as_str()).unwrap_or("");
    let events = msg.get("events").and_then(|e| e.as_array());

    match (channel, events) {
        ("ticker", Some(events)) => events
            .iter()
            .filter_map(|ev| ev.get("tickers").and_then(|t| t.as_array()))
            .flatten()
            .filter_map(parse_ticker)
            .collect(),
        ("candles", Some(events)) => events
            .iter()
            .filter_map(|ev| ev.get("candles").and_then(|c| c.as_array()))
            .flatten()
            .filter_map(parse_bar)
            .collect(),
        ("heartbeats", _) => vec![StreamEvent::Heartbeat],
        _ => Vec::new(),
    }
}

fn str_or_num(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_ticker(t: &serde_json::Value) -> Option<StreamEvent> {
    let product_id = t.get("product_id")?.as_str()?.to_string();
    let price = t.get("price").and_then(str_or_num)?;
    let best_bid = t
        .get("best_bid")
        .or_else(|| t.get("bid"))
        .and_then(str_or_num)
        .filter(|b| *b > 0.0);
    let best_ask = t
        .get("best_ask")
        .or_else(|| t.get("ask"))
        .and_then(str_or_num)
        .filter(|a| *a > 0.0);
    Some(StreamEvent::Ticker {
        product_id,
        price,
        best_bid,
        best_ask,
    })
}

fn parse_bar(c: &serde_json::Value) -> Option<StreamEvent> {
    let product_id = c.get("product_id")?.as_str()?.to_string();
    let start_secs = match c.get("start")? {
        serde_json::Value::String(s) => s.parse::<i64>().ok()?,
        serde_json::Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    let start: DateTime<Utc> = DateTime::from_timestamp(start_secs, 0)?;
    let open = c.get("open").and_then(str_or_num)?;
    let high = c.get("high").and_then(str_or_num)?;
    let low = c.get("low").and_then(str_or_num)?;
    let close = c.get("close").and_then(str_or_num)?;
    Some(StreamEvent::Bar(Candle {
        product_id,
        start,
        open,
        high,
        low,
        close,
    }))
}
