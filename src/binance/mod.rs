//! Binance public market data

pub mod client;
pub mod types;

pub use client::BinanceClient;
pub use types::BinanceKline;
