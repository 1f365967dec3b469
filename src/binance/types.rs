//! Binance API types for klines and price tickers

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::types::{Candle, CandleValidationError};

/// Binance kline/candlestick
/// API returns an array: [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Clone, PartialEq)]
pub struct BinanceKline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl BinanceKline {
    /// Parse from raw JSON array returned by Binance API
    pub fn from_raw(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 7 {
            return None;
        }

        Some(BinanceKline {
            open_time: raw[0].as_i64()?,
            open: raw[1].as_str()?.parse().ok()?,
            high: raw[2].as_str()?.parse().ok()?,
            low: raw[3].as_str()?.parse().ok()?,
            close: raw[4].as_str()?.parse().ok()?,
            volume: raw[5].as_str()?.parse().ok()?,
            close_time: raw[6].as_i64()?,
        })
    }

    pub fn open_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.open_time)
    }

    /// Validated candle keyed by open time
    pub fn to_candle(&self) -> Result<Candle, CandleValidationError> {
        let datetime = self.open_datetime().unwrap_or_default();
        Candle::new(
            datetime,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}

/// `/api/v3/ticker/price` response
#[derive(Debug, Clone, Deserialize)]
pub struct PriceTicker {
    pub symbol: String,
    pub price: String,
}

impl PriceTicker {
    pub fn price(&self) -> Option<f64> {
        self.price.parse().ok().filter(|p: &f64| p.is_finite() && *p > 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_raw() {
        let raw = json!([
            1700000000000i64,
            "100.5",
            "101.0",
            "99.5",
            "100.8",
            "12.3",
            1700000059999i64,
            "1234.5",
            42,
            "6.1",
            "615.0",
            "0"
        ]);
        let kline = BinanceKline::from_raw(raw.as_array().unwrap()).unwrap();
        assert_eq!(kline.open_time, 1700000000000);
        assert_eq!(kline.close, 100.8);

        let candle = kline.to_candle().unwrap();
        assert_eq!(candle.datetime.timestamp_millis(), 1700000000000);
        assert_eq!(candle.high, 101.0);
    }

    #[test]
    fn test_from_raw_rejects_short_or_bad_rows() {
        assert!(BinanceKline::from_raw(&[json!(1)]).is_none());
        let raw = json!([1, "x", "1", "1", "1", "1", 2]);
        assert!(BinanceKline::from_raw(raw.as_array().unwrap()).is_none());
    }

    #[test]
    fn test_ticker_price() {
        let ticker: PriceTicker =
            serde_json::from_str(r#"{"symbol":"BTCUSDT","price":"64000.10"}"#).unwrap();
        assert_eq!(ticker.price(), Some(64000.10));
    }
}
