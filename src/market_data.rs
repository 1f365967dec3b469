//! Market data capability consumed by the engine
//!
//! Any source of OHLC candles can drive the scanner. Failures are reported
//! as [`ScanError::DataUnavailable`] so the engine skips the symbol for the
//! cycle instead of aborting the scan.

use async_trait::async_trait;

use crate::error::ScanError;
use crate::{Candle, Symbol};

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// The most recent `count` candles, oldest first.
    ///
    /// Implementations return `DataUnavailable` when fewer than `count`
    /// valid candles exist.
    async fn fetch_ohlc(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ScanError>;

    /// Latest traded price, used for exit checks
    async fn latest_price(&self, symbol: &Symbol) -> Result<f64, ScanError> {
        let candles = self.fetch_ohlc(symbol, "1m", 1).await?;
        candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| ScanError::DataUnavailable {
                symbol: symbol.clone(),
                reason: "no candles returned".into(),
            })
    }
}

/// Keep the trailing `count` candles or report the shortfall
pub fn require_bars(
    symbol: &Symbol,
    mut candles: Vec<Candle>,
    count: usize,
) -> Result<Vec<Candle>, ScanError> {
    if candles.len() < count {
        return Err(ScanError::DataUnavailable {
            symbol: symbol.clone(),
            reason: format!("needed {} candles, got {}", count, candles.len()),
        });
    }
    let excess = candles.len() - count;
    candles.drain(..excess);
    Ok(candles)
}
