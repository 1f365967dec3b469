//! Breakout/Reentry Channel Scanner
//!
//! Watches perpetual-futures symbols for price escaping a regression channel
//! and re-entering it with oscillator confirmation, then emits trade signals,
//! tracks their outcome against take-profit/stop-loss levels and tunes its own
//! detection thresholds from the resulting trade ledger.

pub mod binance;
pub mod bingx;
pub mod channel;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod http;
pub mod indicators;
pub mod ledger;
pub mod market_data;
pub mod notify;
pub mod optimizer;
pub mod risk;
pub mod scan_config;
pub mod state_manager;
pub mod types;

pub use config::Config;
pub use types::*;
