use crate::models::{Instrument, Quote, Side};

/// Round down to a multiple of `inc`; increments <= 0 pass the value through
pub fn round_down_to_inc(value: f64, inc: f64) -> f64 {
    if inc <= 0.0 {
        return value;
    }
    (value / inc).floor() * inc
}

/// Round up to a multiple of `inc`, tolerating float error just below a step
pub fn round_up_to_inc(value: f64, inc: f64) -> f64 {
    if inc <= 0.0 {
        return value;
    }
    let steps = (value / inc).floor();
    let cand = steps * inc;
    if cand < value - 1e-12 {
        (steps + 1.0) * inc
    } else {
        cand
    }
}

/// Decimal places implied by an increment, for price/size string formatting
pub fn decimals_from_inc(inc: f64) -> usize {
    let s = format!("{inc:.10}");
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    match trimmed.find('.') {
        Some(dot) => trimmed.len() - dot - 1,
        None => 0,
    }
}

/// Format a value to the increment's implied precision
pub fn format_to_inc(value: f64, inc: f64) -> String {
    format!("{:.*}", decimals_from_inc(inc), value)
}

/// Maker limit price and base size for one order
///
/// BUY rests below the bid (fallback: last), SELL above the ask; offsets in
/// bps, prices snapped conservatively to the price increment and sizes down
/// to the base increment.
pub fn compute_maker_limit(
    side: Side,
    last_price: f64,
    quote: &Quote,
    instrument: &Instrument,
    usd_per_order: f64,
    offset_bps: f64,
) -> (f64, f64) {
    let offset = offset_bps / 10_000.0;

    let limit_price = match side {
        Side::Buy => {
            let reference = quote.bid.filter(|b| *b > 0.0).unwrap_or(last_price);
            round_down_to_inc(reference * (1.0 - offset), instrument.price_increment)
        }
        Side::Sell => {
            let reference = quote.ask.filter(|a| *a > 0.0).unwrap_or(last_price);
            round_up_to_inc(reference * (1.0 + offset), instrument.price_increment)
        }
    };

    let base_size = if limit_price > 0.0 {
        round_down_to_inc(
            (usd_per_order / limit_price).max(0.0),
            instrument.base_increment,
        )
    } else {
        0.0
    };

    (limit_price, base_size)
}

/// Intended base size for a market SELL, clamped to what is actually sellable
///
/// When the computed size is within `shave_increments + 1` increments of the
/// full held amount, a configurable number of increments is shaved off before
/// rounding so float error cannot request more than the exchange will honor.
pub fn market_sell_base_size(
    quote_usd: f64,
    last_price: f64,
    held_qty: f64,
    live_available: f64,
    instrument: &Instrument,
    shave_increments: u32,
) -> f64 {
    if last_price <= 0.0 {
        return 0.0;
    }
    let sellable = held_qty.min(live_available);
    let mut size = (quote_usd / last_price).min(sellable);

    let inc = instrument.base_increment;
    if inc > 0.0 && size > 0.0 {
        let near_full = (sellable - size).abs() <= inc * (shave_increments as f64 + 1.0);
        if near_full {
            size = (sellable - inc * shave_increments as f64).max(0.0);
        }
        size = round_down_to_inc(size, inc);
    }

    size.max(0.0)
}

/// Minimum viable market-order size: at least one base increment and at least
/// the exchange's minimum market base size
pub fn min_market_size(instrument: &Instrument) -> f64 {
    instrument.base_increment.max(instrument.min_market_base_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(price_inc: f64, base_inc: f64, min_market: f64) -> Instrument {
        Instrument {
            product_id: "ETH-USD".to_string(),
            price_increment: price_inc,
            base_increment: base_inc,
            min_market_base_size: min_market,
        }
    }

    #[test]
    fn test_round_down() {
        assert!((round_down_to_inc(0.0399, 0.01) - 0.03).abs() < 1e-12);
        assert!((round_down_to_inc(123.456, 0.01) - 123.45).abs() < 1e-9);
    }

    #[test]
    fn test_round_up() {
        assert!((round_up_to_inc(0.0301, 0.01) - 0.04).abs() < 1e-12);
        // exact multiples stay put
        assert!((round_up_to_inc(0.03, 0.01) - 0.03).abs() < 1e-12);
    }

    #[test]
    fn test_non_positive_increment_passthrough() {
        assert_eq!(round_down_to_inc(1.234, 0.0), 1.234);
        assert_eq!(round_up_to_inc(1.234, -1.0), 1.234);
    }

    #[test]
    fn test_decimals_from_inc() {
        assert_eq!(decimals_from_inc(0.01), 2);
        assert_eq!(decimals_from_inc(0.00000001), 8);
        assert_eq!(decimals_from_inc(1.0), 0);
    }

    #[test]
    fn test_format_to_inc() {
        assert_eq!(format_to_inc(2500.456, 0.01), "2500.46");
        assert_eq!(format_to_inc(0.123456789, 1e-8), "0.12345679");
    }

    #[test]
    fn test_maker_buy_rests_below_bid() {
        let inst = instrument(0.01, 1e-8, 0.0);
        let quote = Quote {
            bid: Some(100.0),
            ask: Some(100.1),
            last: Some(100.05),
        };
        let (price, size) = compute_maker_limit(Side::Buy, 100.05, &quote, &inst, 30.0, 10.0);
        // 100 * (1 - 0.001) = 99.9, already on increment
        assert!((price - 99.9).abs() < 1e-9);
        assert!(size > 0.0);
        assert!(size * price <= 30.0 + 1e-9);
    }

    #[test]
    fn test_maker_sell_rests_above_ask() {
        let inst = instrument(0.01, 1e-8, 0.0);
        let quote = Quote {
            bid: Some(100.0),
            ask: Some(100.1),
            last: Some(100.05),
        };
        let (price, _) = compute_maker_limit(Side::Sell, 100.05, &quote, &inst, 30.0, 10.0);
        assert!(price >= 100.1);
        // snapped up to the increment
        assert!((price / 0.01 - (price / 0.01).round()).abs() < 1e-6);
    }

    #[test]
    fn test_maker_falls_back_to_last_price() {
        let inst = instrument(0.01, 1e-8, 0.0);
        let quote = Quote::default();
        let (buy_price, _) = compute_maker_limit(Side::Buy, 200.0, &quote, &inst, 30.0, 50.0);
        // 200 * (1 - 0.005) = 199.0
        assert!((buy_price - 199.0).abs() < 1e-9);
    }

    #[test]
    fn test_market_sell_clamps_to_held_and_available() {
        let inst = instrument(0.01, 0.001, 0.0);
        // wants $500 worth = 5.0, but holds 2.0 and only 1.5 is available
        let size = market_sell_base_size(500.0, 100.0, 2.0, 1.5, &inst, 1);
        assert!(size <= 1.5);
    }

    #[test]
    fn test_full_exit_shave() {
        let inst = instrument(0.01, 0.001, 0.0);
        // requested size lands exactly on the full holding
        let size = market_sell_base_size(100.0, 100.0, 1.0, 1.0, &inst, 1);
        // one increment shaved off, then rounded down
        assert!((size - 0.999).abs() < 1e-9);
    }

    #[test]
    fn test_partial_sell_not_shaved() {
        let inst = instrument(0.01, 0.001, 0.0);
        // requested 0.5 of a 2.0 holding: nowhere near full, no shave
        let size = market_sell_base_size(50.0, 100.0, 2.0, 2.0, &inst, 1);
        assert!((size - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_min_market_size() {
        let inst = instrument(0.01, 0.001, 0.01);
        assert_eq!(min_market_size(&inst), 0.01);
        let inst = instrument(0.01, 0.1, 0.01);
        assert_eq!(min_market_size(&inst), 0.1);
    }

    #[test]
    fn test_zero_price_yields_zero_size() {
        let inst = instrument(0.01, 0.001, 0.0);
        assert_eq!(market_sell_base_size(100.0, 0.0, 1.0, 1.0, &inst, 1), 0.0);
    }
}
