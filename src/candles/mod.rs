// Candle construction: local OHLC aggregation with a settle delay, native
// bar-close handling, REST backstop synthesis, and the no-duplicate guard

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use crate::exchange::HistoricalCandle;
use crate::models::Candle;

#[derive(Debug, Clone)]
struct Bucket {
    start: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

impl Bucket {
    fn new(start: DateTime<Utc>, price: f64) -> Self {
        Self {
            start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    fn absorb(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    fn into_candle(self, product_id: &str) -> Candle {
        Candle {
            product_id: product_id.to_string(),
            start: self.start,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

#[derive(Debug)]
struct PendingClose {
    candle: Candle,
    ready_at: Instant,
}

/// Produces exactly one close per bar boundary per instrument, in
/// non-decreasing time order, regardless of which producer is active
///
/// Local aggregation holds a just-closed bucket for a short settle delay so
/// ticks straddling the boundary still land in the right bar. Native bars
/// close when the delivered bar's start moves forward. Backstop candles are
/// synthesized in order from REST history. The per-instrument last-emitted
/// guard makes duplicate boundaries impossible across producer switches.
pub struct CandlePipeline {
    interval_secs: i64,
    settle_delay: Duration,
    open: HashMap<String, Bucket>,
    native_open: HashMap<String, Candle>,
    pending: HashMap<String, PendingClose>,
    last_emitted: HashMap<String, DateTime<Utc>>,
}

impl CandlePipeline {
    pub fn new(interval_secs: u64, settle_delay_ms: u64) -> Self {
        Self {
            interval_secs: interval_secs.max(1) as i64,
            settle_delay: Duration::from_millis(settle_delay_ms),
            open: HashMap::new(),
            native_open: HashMap::new(),
            pending: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }

    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let aligned = secs - secs.rem_euclid(self.interval_secs);
        Utc.timestamp_opt(aligned, 0).unwrap()
    }

    /// Mark a boundary as already delivered (warm-up backfill) so the live
    /// producers cannot re-emit it
    pub fn prime_last_emitted(&mut self, product_id: &str, start: DateTime<Utc>) {
        let entry = self
            .last_emitted
            .entry(product_id.to_string())
            .or_insert(start);
        if start > *entry {
            *entry = start;
        }
    }

    /// Local aggregation: feed one tick; closed buckets wait out the settle
    /// delay in the pending slot before `drain_settled` releases them
    pub fn on_tick(&mut self, product_id: &str, price: f64, ts: DateTime<Utc>, now: Instant) {
        let start = self.bucket_start(ts);

        // late tick for a bucket still settling folds into it
        if let Some(pending) = self.pending.get_mut(product_id) {
            if pending.candle.start == start {
                pending.candle.high = pending.candle.high.max(price);
                pending.candle.low = pending.candle.low.min(price);
                pending.candle.close = price;
                return;
            }
        }

        enum Action {
            Absorb,
            Roll,
            Stale,
            Fresh,
        }
        let action = match self.open.get(product_id) {
            Some(b) if b.start == start => Action::Absorb,
            Some(b) if start > b.start => Action::Roll,
            Some(_) => Action::Stale,
            None => Action::Fresh,
        };

        match action {
            Action::Absorb => {
                if let Some(b) = self.open.get_mut(product_id) {
                    b.absorb(price);
                }
            }
            Action::Roll => {
                if let Some(closed) = self
                    .open
                    .insert(product_id.to_string(), Bucket::new(start, price))
                {
                    self.pending.insert(
                        product_id.to_string(),
                        PendingClose {
                            candle: closed.into_candle(product_id),
                            ready_at: now + self.settle_delay,
                        },
                    );
                }
            }
            // stale tick from before the open bucket; drop it
            Action::Stale => {}
            Action::Fresh => {
                self.open
                    .insert(product_id.to_string(), Bucket::new(start, price));
            }
        }
    }

    /// Release settled local closes, oldest first
    pub fn drain_settled(&mut self, now: Instant) -> Vec<Candle> {
        let ready: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.ready_at <= now)
            .map(|(pid, _)| pid.clone())
            .collect();

        let mut out = Vec::new();
        for pid in ready {
            if let Some(p) = self.pending.remove(&pid) {
                if self.guard_emit(&pid, p.candle.start) {
                    out.push(p.candle);
                }
            }
        }
        out.sort_by_key(|c| c.start);
        out
    }

    /// Native stream: a bar whose start moved forward closes the held bar
    pub fn on_native_bar(&mut self, bar: Candle) -> Option<Candle> {
        let pid = bar.product_id.clone();
        let held_start = self.native_open.get(&pid).map(|h| h.start);

        match held_start {
            Some(start) if bar.start == start => {
                self.native_open.insert(pid, bar);
                None
            }
            Some(start) if bar.start > start => {
                let closed = self.native_open.insert(pid.clone(), bar)?;
                if self.guard_emit(&pid, closed.start) {
                    Some(closed)
                } else {
                    None
                }
            }
            Some(_) => None, // out-of-order bar
            None => {
                self.native_open.insert(pid, bar);
                None
            }
        }
    }

    /// Synthesize missed closes from REST history, in order, skipping the
    /// still-open bucket and anything already delivered
    pub fn accept_backstop(
        &mut self,
        product_id: &str,
        bars: &[HistoricalCandle],
        now: DateTime<Utc>,
    ) -> Vec<Candle> {
        let mut sorted: Vec<&HistoricalCandle> = bars.iter().collect();
        sorted.sort_by_key(|b| b.start);

        let mut out = Vec::new();
        for bar in sorted {
            let bucket_end = bar.start + chrono::Duration::seconds(self.interval_secs);
            if bucket_end > now {
                continue; // current bucket hasn't closed yet
            }
            if self.guard_emit(product_id, bar.start) {
                out.push(Candle {
                    product_id: product_id.to_string(),
                    start: bar.start,
                    open: bar.close,
                    high: bar.close,
                    low: bar.close,
                    close: bar.close,
                });
            }
        }
        out
    }

    pub fn last_emitted(&self, product_id: &str) -> Option<DateTime<Utc>> {
        self.last_emitted.get(product_id).copied()
    }

    /// True if this boundary is new; records it as delivered
    fn guard_emit(&mut self, product_id: &str, start: DateTime<Utc>) -> bool {
        match self.last_emitted.get(product_id) {
            Some(prev) if start <= *prev => false,
            _ => {
                self.last_emitted.insert(product_id.to_string(), start);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn pipeline() -> CandlePipeline {
        // 60s buckets, no settle delay for determinism unless stated
        CandlePipeline::new(60, 0)
    }

    #[test]
    fn test_bucket_alignment() {
        let p = CandlePipeline::new(300, 0);
        assert_eq!(p.bucket_start(ts(1700000123)), ts(1700000100));
        assert_eq!(p.bucket_start(ts(1700000100)), ts(1700000100));
    }

    #[test]
    fn test_local_aggregation_closes_on_rollover() {
        let mut p = pipeline();
        let now = Instant::now();

        p.on_tick("ETH-USD", 100.0, ts(0), now);
        p.on_tick("ETH-USD", 105.0, ts(30), now);
        p.on_tick("ETH-USD", 95.0, ts(45), now);
        assert!(p.drain_settled(now).is_empty());

        // tick in the next bucket closes the first
        p.on_tick("ETH-USD", 101.0, ts(61), now);
        let closed = p.drain_settled(now);
        assert_eq!(closed.len(), 1);
        let c = &closed[0];
        assert_eq!(c.start, ts(0));
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 95.0);
        assert_eq!(c.close, 95.0);
    }

    #[test]
    fn test_settle_delay_holds_close() {
        let mut p = CandlePipeline::new(60, 150);
        let now = Instant::now();

        p.on_tick("ETH-USD", 100.0, ts(0), now);
        p.on_tick("ETH-USD", 101.0, ts(61), now);

        // not settled yet
        assert!(p.drain_settled(now).is_empty());
        // late tick for the old bucket folds in during the settle window
        p.on_tick("ETH-USD", 99.0, ts(59), now);

        let later = now + Duration::from_millis(200);
        let closed = p.drain_settled(later);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close, 99.0);
        assert_eq!(closed[0].low, 99.0);
    }

    #[test]
    fn test_no_duplicate_boundaries() {
        let mut p = pipeline();
        let now = Instant::now();

        p.on_tick("ETH-USD", 100.0, ts(0), now);
        p.on_tick("ETH-USD", 101.0, ts(61), now);
        assert_eq!(p.drain_settled(now).len(), 1);

        // backstop offering the same bucket is suppressed
        let bars = [HistoricalCandle {
            start: ts(0),
            close: 100.5,
        }];
        assert!(p.accept_backstop("ETH-USD", &bars, ts(300)).is_empty());
    }

    #[test]
    fn test_native_bar_close_on_start_change() {
        let mut p = pipeline();
        let bar = |start: i64, close: f64| Candle {
            product_id: "SOL-USD".to_string(),
            start: ts(start),
            open: close,
            high: close,
            low: close,
            close,
        };

        assert!(p.on_native_bar(bar(0, 50.0)).is_none());
        // same start: update in place
        assert!(p.on_native_bar(bar(0, 51.0)).is_none());
        // start moved: previous bar closes with its latest values
        let closed = p.on_native_bar(bar(60, 52.0)).unwrap();
        assert_eq!(closed.start, ts(0));
        assert_eq!(closed.close, 51.0);
    }

    #[test]
    fn test_native_out_of_order_bar_ignored() {
        let mut p = pipeline();
        let bar = |start: i64| Candle {
            product_id: "SOL-USD".to_string(),
            start: ts(start),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
        };
        p.on_native_bar(bar(120));
        assert!(p.on_native_bar(bar(60)).is_none());
    }

    #[test]
    fn test_backstop_synthesizes_in_order() {
        let mut p = pipeline();
        let bars = [
            HistoricalCandle {
                start: ts(120),
                close: 102.0,
            },
            HistoricalCandle {
                start: ts(0),
                close: 100.0,
            },
            HistoricalCandle {
                start: ts(60),
                close: 101.0,
            },
        ];
        let out = p.accept_backstop("ETH-USD", &bars, ts(600));
        let starts: Vec<i64> = out.iter().map(|c| c.start.timestamp()).collect();
        assert_eq!(starts, vec![0, 60, 120]);
    }

    #[test]
    fn test_backstop_skips_open_bucket() {
        let mut p = pipeline();
        let bars = [
            HistoricalCandle {
                start: ts(0),
                close: 100.0,
            },
            HistoricalCandle {
                start: ts(60),
                close: 101.0,
            },
        ];
        // now = 90: the ts(60) bucket is still open
        let out = p.accept_backstop("ETH-USD", &bars, ts(90));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, ts(0));
    }

    #[test]
    fn test_prime_blocks_backfilled_buckets() {
        let mut p = pipeline();
        p.prime_last_emitted("ETH-USD", ts(120));

        let bars = [
            HistoricalCandle {
                start: ts(60),
                close: 100.0,
            },
            HistoricalCandle {
                start: ts(180),
                close: 102.0,
            },
        ];
        let out = p.accept_backstop("ETH-USD", &bars, ts(600));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, ts(180));
    }

    #[test]
    fn test_products_are_independent() {
        let mut p = pipeline();
        let now = Instant::now();
        p.on_tick("ETH-USD", 100.0, ts(0), now);
        p.on_tick("SOL-USD", 50.0, ts(0), now);
        p.on_tick("ETH-USD", 101.0, ts(61), now);

        let closed = p.drain_settled(now);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].product_id, "ETH-USD");
    }
}
