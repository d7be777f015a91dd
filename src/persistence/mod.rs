use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const TRADE_LOG_MAX_MB: u64 = 10;
const TRADE_LOG_BACKUPS: u32 = 3;
const SPEND_RETENTION_DAYS: i64 = 14;

/// Durable state directory with atomic JSON reads/writes
///
/// Writes go to a temp file that is fsynced and renamed over the target, so a
/// crash mid-write never leaves a torn file.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn load_json<T: DeserializeOwned>(&self, name: &str, default: T) -> T {
        let path = self.path(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("Could not parse {}: {}; using default", path.display(), e);
                    default
                }
            },
            Err(_) => default,
        }
    }

    pub fn save_json<T: Serialize>(&self, name: &str, data: &T) -> anyhow::Result<()> {
        let path = self.path(name);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(data)?;
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// On-disk shape of the position ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioFile {
    #[serde(default)]
    pub positions: HashMap<String, f64>,
    #[serde(default)]
    pub cost_basis: HashMap<String, f64>,
    #[serde(default)]
    pub opened_at: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: f64,
}

pub const PORTFOLIO_FILE: &str = "portfolio.json";
pub const PROCESSED_FILLS_FILE: &str = "processed_fills.json";
pub const DAILY_SPEND_FILE: &str = "daily_spend.json";
pub const LAST_TRADES_FILE: &str = "last_trades.json";
pub const TRADE_LOG_FILE: &str = "trade_log.txt";
pub const TRADES_CSV_FILE: &str = "trades.csv";

/// One processed-fill marker; `flag` records skip/bad_num sentinels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillMarker {
    pub fp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
}

/// Insertion-ordered processed-fill index for idempotent ingestion
///
/// Serialized as an array so oldest-first pruning survives restarts.
#[derive(Debug, Default)]
pub struct ProcessedFills {
    entries: VecDeque<FillMarker>,
    index: HashSet<String>,
}

impl ProcessedFills {
    pub fn load(store: &StateStore) -> Self {
        let entries: VecDeque<FillMarker> =
            store.load_json(PROCESSED_FILLS_FILE, VecDeque::new());
        let index = entries.iter().map(|m| m.fp.clone()).collect();
        Self { entries, index }
    }

    pub fn has(&self, fp: &str) -> bool {
        self.index.contains(fp)
    }

    pub fn add(&mut self, marker: FillMarker) {
        if self.index.insert(marker.fp.clone()) {
            self.entries.push_back(marker);
        }
    }

    /// Drop the oldest ~20% once the index exceeds `max_keys`
    pub fn prune(&mut self, max_keys: usize) -> usize {
        if self.entries.len() <= max_keys {
            return 0;
        }
        let drop_n = (max_keys / 5).max(1);
        let mut dropped = 0;
        for _ in 0..drop_n {
            if let Some(old) = self.entries.pop_front() {
                self.index.remove(&old.fp);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self, store: &StateStore) -> anyhow::Result<()> {
        store.save_json(PROCESSED_FILLS_FILE, &self.entries)
    }
}

/// Tracks daily BUY spend across runs, keyed by UTC date
#[derive(Debug)]
pub struct SpendTracker {
    store: StateStore,
    data: HashMap<String, f64>,
}

impl SpendTracker {
    pub fn load(store: StateStore) -> Self {
        let data = store.load_json(DAILY_SPEND_FILE, HashMap::new());
        Self { store, data }
    }

    fn day_key(now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d").to_string()
    }

    pub fn add(&mut self, usd: f64) {
        let key = Self::day_key(Utc::now());
        *self.data.entry(key).or_insert(0.0) += usd;
        self.prune_old();
        if let Err(e) = self.store.save_json(DAILY_SPEND_FILE, &self.data) {
            tracing::error!("Failed to persist daily spend: {}", e);
        }
    }

    pub fn today_total(&self) -> f64 {
        self.data
            .get(&Self::day_key(Utc::now()))
            .copied()
            .unwrap_or(0.0)
    }

    fn prune_old(&mut self) {
        let cutoff = Utc::now() - ChronoDuration::days(SPEND_RETENTION_DAYS);
        self.data.retain(|k, _| {
            chrono::NaiveDate::parse_from_str(k, "%Y-%m-%d")
                .map(|d| d.and_hms_opt(0, 0, 0).unwrap().and_utc() >= cutoff)
                .unwrap_or(false)
        });
    }
}

/// Per-instrument last-trade stamps enforcing the trade cooldown
#[derive(Debug)]
pub struct LastTradeTracker {
    store: StateStore,
    data: HashMap<String, f64>,
}

impl LastTradeTracker {
    pub fn load(store: StateStore) -> Self {
        let data = store.load_json(LAST_TRADES_FILE, HashMap::new());
        Self { store, data }
    }

    pub fn ok(&self, product_id: &str, cooldown_secs: u64) -> bool {
        match self.data.get(product_id) {
            None => true,
            Some(stamp) => (Utc::now().timestamp() as f64 - stamp) >= cooldown_secs as f64,
        }
    }

    pub fn stamp(&mut self, product_id: &str) {
        self.data
            .insert(product_id.to_string(), Utc::now().timestamp() as f64);
        if let Err(e) = self.store.save_json(LAST_TRADES_FILE, &self.data) {
            tracing::error!("Failed to persist last-trade stamps: {}", e);
        }
    }
}

/// Append a one-line human-readable trade entry, rotating the log past ~10MB
pub fn log_trade_line(
    store: &StateStore,
    product_id: &str,
    side: &str,
    usd_amount: f64,
    price: f64,
    quantity: f64,
    dry_run: bool,
) {
    let path = store.path(TRADE_LOG_FILE);
    rotate_if_big(&path, TRADE_LOG_MAX_MB, TRADE_LOG_BACKUPS);

    let ts = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let entry = format!(
        "{ts} | {side:<4} {product_id:<10} USD ${usd_amount:.2} @ ${price:.6} Qty {quantity:.8} {}\n",
        if dry_run { "(DRY RUN)" } else { "" }
    );
    if let Err(e) = append_line(&path, &entry) {
        tracing::error!("Failed to append trade log: {}", e);
    }
}

/// Session footer: per-run and lifetime P&L plus runtime duration
pub fn log_session_footer(
    store: &StateStore,
    run_pnl: f64,
    lifetime_pnl: f64,
    started: DateTime<Utc>,
) {
    let path = store.path(TRADE_LOG_FILE);
    let ts = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let sep = "-".repeat(110);
    let duration = Utc::now() - started;
    let body = format!(
        "{ts} | P&L this run: ${run_pnl:.8} | Lifetime P&L: ${lifetime_pnl:.8}\n{sep}\n{ts} | Runtime duration: {duration}\n{sep}\n{}\n",
        "$".repeat(100)
    );
    if let Err(e) = append_line(&path, &body) {
        tracing::error!("Failed to append session footer: {}", e);
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    f.write_all(line.as_bytes())
}

fn rotate_if_big(path: &Path, max_mb: u64, backups: u32) {
    let size = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return,
    };
    if size < max_mb * 1024 * 1024 {
        return;
    }
    for i in (1..=backups).rev() {
        let src = path.with_extension(format!("txt.{i}"));
        if i == backups {
            let _ = std::fs::remove_file(&src);
        } else {
            let dst = path.with_extension(format!("txt.{}", i + 1));
            let _ = std::fs::rename(&src, &dst);
        }
    }
    let _ = std::fs::rename(path, path.with_extension("txt.1"));
}
