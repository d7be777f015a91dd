// Order execution: pricing/sizing to exchange increments, balance caching,
// and the candle-close engine

pub mod balances;
pub mod engine;
pub mod pricing;

pub use balances::{base_asset, BalanceCache};
pub use engine::Engine;
pub use pricing::{
    compute_maker_limit, decimals_from_inc, format_to_inc, market_sell_base_size, min_market_size,
    round_down_to_inc, round_up_to_inc,
};
