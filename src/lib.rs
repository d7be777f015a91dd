// Core modules
pub mod candles;
pub mod config;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod ledger;
pub mod models;
pub mod persistence;
pub mod strategy;
pub mod supervisor;

// Re-export commonly used types
pub use config::{BotConfig, CandleMode, ConfigHandle};
pub use models::*;
