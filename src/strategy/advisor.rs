use crate::config::BotConfig;
use crate::models::Side;

/// Indicator readings fed to the veto check for one instrument
#[derive(Debug, Clone, Copy)]
pub struct AdvisorInputs {
    pub rsi: Option<f64>,
    pub macd_hist: Option<f64>,
    pub last_price: f64,
}

/// Histogram normalized to bps of price, so thresholds work across
/// instruments with very different price levels
fn macd_metric(hist: Option<f64>, price: f64) -> Option<f64> {
    let h = hist?;
    if price <= 0.0 {
        return Some(h);
    }
    Some(10_000.0 * (h / price))
}

/// The crossover machine is captain; advisors veto only if clearly bad
///
/// RSI veto is one-sided: BUY blocked only when overbought, SELL only when
/// oversold. MACD blocks BUYs with a clearly bearish histogram and SELLs
/// with a clearly bullish one. Unpopulated indicators never veto.
pub fn advisor_allows(side: Side, inputs: &AdvisorInputs, cfg: &BotConfig) -> bool {
    if let Some(rsi) = inputs.rsi {
        match side {
            Side::Buy if rsi > cfg.rsi_buy_max => return false,
            Side::Sell if rsi < cfg.rsi_sell_min => return false,
            _ => {}
        }
    }

    if let Some(metric) = macd_metric(inputs.macd_hist, inputs.last_price) {
        match side {
            Side::Buy if metric < cfg.macd_buy_min => return false,
            Side::Sell if metric > cfg.macd_sell_max => return false,
            _ => {}
        }
    }

    true
}
