use std::path::PathBuf;

use serde::Serialize;

/// One KPI row, appended per processed fill
#[derive(Debug, Clone, Serialize)]
pub struct KpiRow {
    pub timestamp: String,
    pub order_id: String,
    pub side: String,
    pub product_id: String,
    pub size: f64,
    pub price: f64,
    pub notional: f64,
    pub fee: f64,
    pub liquidity: String,
    /// Realized P&L contributed by this fill (0 for BUYs)
    pub fill_pnl: f64,
    pub position_after: f64,
    pub cost_basis_after: f64,
    /// Reference price captured at order-intent time, when known
    pub reference_price: Option<f64>,
    /// Signed bps vs. the intent reference; positive means worse than intended
    pub slippage_bps: Option<f64>,
    /// Seconds held, populated when a SELL takes the position to flat
    pub hold_secs: Option<i64>,
    pub reason: String,
}

/// Append-only CSV trade/KPI log
///
/// The header is written once when the file is created; every batch is
/// flushed so rows survive a crash.
#[derive(Debug, Clone)]
pub struct KpiWriter {
    path: PathBuf,
}

impl KpiWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, row: &KpiRow) -> anyhow::Result<()> {
        let new_file = !self.path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(new_file)
            .from_writer(file);
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }
}
