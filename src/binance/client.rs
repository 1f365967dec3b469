//! Binance API client for recent kline (candlestick) data
//!
//! No API key required for public market data endpoints.
//!
//! # Example
//! ```no_run
//! use breakout_reentry::binance::BinanceClient;
//! use breakout_reentry::http::ClientConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = BinanceClient::new(ClientConfig::default())?;
//!     let klines = client.get_klines("BTCUSDT", "5m", 100).await?;
//!     println!("Fetched {} klines", klines.len());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use super::types::{BinanceKline, PriceTicker};
use crate::error::{GatewayError, GatewayResult, ScanError};
use crate::http::{execute_with_retry, ClientConfig};
use crate::market_data::{require_bars, MarketDataProvider};
use crate::{Candle, Symbol};

/// Base URL for Binance API
pub const BINANCE_API_BASE: &str = "https://api.binance.com";

/// Maximum klines per request (Binance limit)
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Binance API client
#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    config: ClientConfig,
}

impl BinanceClient {
    pub fn new(config: ClientConfig) -> GatewayResult<Self> {
        Ok(Self {
            client: config.build_client()?,
            base_url: BINANCE_API_BASE.to_string(),
            config,
        })
    }

    /// Point the client at another host (testnets, proxies)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Fetch the most recent `limit` klines (max 1000)
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
    ) -> GatewayResult<Vec<BinanceKline>> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let limit = limit.clamp(1, MAX_KLINES_PER_REQUEST);
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];

        debug!(
            "Fetching klines: symbol={}, interval={}, limit={}",
            symbol, interval, limit
        );

        let (url, params) = (&url, &params);
        let raw_data: Vec<Vec<serde_json::Value>> =
            execute_with_retry(&self.config, "binance klines", move || async move {
                let response = self.client.get(url).query(params).send().await?;
                check_status(response).await?.json().await.map_err(GatewayError::from)
            })
            .await?;

        Ok(raw_data
            .iter()
            .filter_map(|row| BinanceKline::from_raw(row))
            .collect())
    }

    pub async fn get_price(&self, symbol: &str) -> GatewayResult<f64> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let params = [("symbol", symbol.to_string())];

        let (url, params) = (&url, &params);
        let ticker: PriceTicker = execute_with_retry(&self.config, "binance price", move || async move {
            let response = self.client.get(url).query(params).send().await?;
            check_status(response).await?.json().await.map_err(GatewayError::from)
        })
        .await?;

        ticker
            .price()
            .ok_or_else(|| GatewayError::Parse(format!("invalid price for {}", ticker.symbol)))
    }
}

/// Map rate-limit and error statuses onto gateway errors
async fn check_status(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return Err(GatewayError::RateLimited);
    }
    if status.is_server_error() {
        return Err(GatewayError::Network(format!("Binance server error {}", status)));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::Api {
            code: i64::from(status.as_u16()),
            message: body,
        });
    }
    Ok(response)
}

fn unavailable(symbol: &Symbol, err: impl std::fmt::Display) -> ScanError {
    ScanError::DataUnavailable {
        symbol: symbol.clone(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl MarketDataProvider for BinanceClient {
    async fn fetch_ohlc(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ScanError> {
        let klines = self
            .get_klines(symbol.as_str(), timeframe, count)
            .await
            .map_err(|e| unavailable(symbol, e))?;

        let mut candles = Vec::with_capacity(klines.len());
        for kline in &klines {
            match kline.to_candle() {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!("{} - dropping invalid kline {}: {}", symbol, kline.open_time, e),
            }
        }
        require_bars(symbol, candles, count)
    }

    async fn latest_price(&self, symbol: &Symbol) -> Result<f64, ScanError> {
        self.get_price(symbol.as_str())
            .await
            .map_err(|e| unavailable(symbol, e))
    }
}
