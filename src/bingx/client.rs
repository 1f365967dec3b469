//! BingX perpetual swap client
//!
//! Signed REST calls for order placement and position queries, plus the
//! public kline/ticker endpoints so BingX can also serve as the market
//! data source.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::auth::{Credentials, API_KEY_HEADER};
use super::types::{
    order_side, to_bingx_symbol, ApiResponse, BingxPosition, OpenOrders, OrderEnvelope,
    TickerData,
};
use crate::error::{GatewayError, GatewayResult, ScanError};
use crate::exchange::{ExchangePosition, OrderAck, OrderGateway};
use crate::http::{execute_with_retry_if, ClientConfig};
use crate::market_data::{require_bars, MarketDataProvider};
use crate::{Candle, Side, Symbol};

pub const BINGX_API_BASE: &str = "https://open-api.bingx.com";

const ORDER_PATH: &str = "/openApi/swap/v2/trade/order";
const LEVERAGE_PATH: &str = "/openApi/swap/v2/trade/leverage";
const OPEN_ORDERS_PATH: &str = "/openApi/swap/v2/trade/openOrders";
const POSITIONS_PATH: &str = "/openApi/swap/v2/user/positions";
const TICKER_PATH: &str = "/openApi/swap/v2/quote/ticker";
const KLINES_PATH: &str = "/openApi/swap/v3/quote/klines";

const MAX_KLINES_PER_REQUEST: usize = 1440;

fn retry_reads(e: &GatewayError) -> bool {
    e.is_retryable()
}

fn retry_writes(e: &GatewayError) -> bool {
    matches!(e, GatewayError::RateLimited)
}

/// Price or quantity as sent on the wire: at most 8 decimals, no exponent
fn format_number(value: f64) -> String {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(8).normalize().to_string())
        .unwrap_or_else(|| value.to_string())
}

#[derive(Debug, Deserialize)]
struct RawKline {
    #[serde(alias = "t")]
    time: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    #[serde(default)]
    volume: String,
}

impl RawKline {
    fn to_candle(&self) -> Option<Candle> {
        Candle::new(
            chrono::DateTime::from_timestamp_millis(self.time)?,
            self.open.parse().ok()?,
            self.high.parse().ok()?,
            self.low.parse().ok()?,
            self.close.parse().ok()?,
            self.volume.parse().unwrap_or(0.0),
        )
        .ok()
    }
}

#[derive(Debug, Clone)]
pub struct BingxClient {
    client: Client,
    base_url: String,
    config: ClientConfig,
    credentials: Credentials,
    last_nonce: Arc<AtomicI64>,
}

impl BingxClient {
    pub fn new(credentials: Credentials, config: ClientConfig) -> GatewayResult<Self> {
        Ok(Self {
            client: config.build_client()?,
            base_url: BINGX_API_BASE.to_string(),
            config,
            credentials,
            last_nonce: Arc::new(AtomicI64::new(0)),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Millisecond timestamp that never repeats or steps back
    fn next_nonce(&self, now_ms: i64) -> i64 {
        let previous = self
            .last_nonce
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now_ms.max(previous + 1)
    }

    /// Signed request; a fresh timestamp and signature are computed per attempt
    async fn signed<T>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        should_retry: fn(&GatewayError) -> bool,
    ) -> GatewayResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let label = format!("bingx {} {}", method, path);
        let (method, path) = (&method, path);
        execute_with_retry_if(&self.config, &label, should_retry, move || async move {
            let mut all = params.to_vec();
            let nonce = self.next_nonce(Utc::now().timestamp_millis());
            all.push(("timestamp", nonce.to_string()));
            let url = format!(
                "{}{}?{}",
                self.base_url,
                path,
                self.credentials.signed_query(&all)?
            );

            let response = self
                .client
                .request(method.clone(), url)
                .header(API_KEY_HEADER, self.credentials.api_key())
                .send()
                .await?;
            let envelope: ApiResponse<T> = check_status(response).await?.json().await?;
            envelope.into_result()
        })
        .await
    }

    /// Unsigned market data request
    async fn public<T>(&self, path: &str, params: &[(&str, String)]) -> GatewayResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let url = format!("{}{}", self.base_url, path);
        let label = format!("bingx {}", path);
        let url = &url;
        execute_with_retry_if(&self.config, &label, retry_reads, move || async move {
            let response = self.client.get(url).query(params).send().await?;
            let envelope: ApiResponse<T> = check_status(response).await?.json().await?;
            envelope.into_result()
        })
        .await
    }

    async fn place_order(
        &self,
        params: Vec<(&str, String)>,
        requested_quantity: f64,
    ) -> GatewayResult<OrderAck> {
        debug!("Placing order: {:?}", params);
        let envelope: OrderEnvelope = self
            .signed(Method::POST, ORDER_PATH, &params, retry_writes)
            .await?;
        Ok(envelope.order.to_ack(requested_quantity))
    }

    /// Closing trigger order for the `side` position
    async fn place_trigger(
        &self,
        symbol: &Symbol,
        side: Side,
        order_type: &str,
        trigger: f64,
    ) -> GatewayResult<OrderAck> {
        let params = vec![
            ("symbol", to_bingx_symbol(symbol.as_str())),
            ("side", order_side(side, false).to_string()),
            ("positionSide", side.as_str().to_string()),
            ("type", order_type.to_string()),
            ("stopPrice", format_number(trigger)),
            ("closePosition", "true".to_string()),
            ("workingType", "MARK_PRICE".to_string()),
        ];
        self.place_order(params, 0.0).await
    }

    pub async fn get_klines(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> GatewayResult<Vec<Candle>> {
        let params = [
            ("symbol", to_bingx_symbol(symbol.as_str())),
            ("interval", interval.to_string()),
            ("limit", limit.clamp(1, MAX_KLINES_PER_REQUEST).to_string()),
        ];
        let raw: Vec<RawKline> = self.public(KLINES_PATH, &params).await?;

        let mut candles: Vec<Candle> = raw.iter().filter_map(RawKline::to_candle).collect();
        if candles.len() < raw.len() {
            warn!(
                "{} {} - dropped {} malformed klines",
                symbol,
                interval,
                raw.len() - candles.len()
            );
        }
        // newest first on the wire
        candles.sort_by_key(|c| c.datetime);
        Ok(candles)
    }

    pub async fn get_price(&self, symbol: &Symbol) -> GatewayResult<f64> {
        let params = [("symbol", to_bingx_symbol(symbol.as_str()))];
        let ticker: TickerData = self.public(TICKER_PATH, &params).await?;
        ticker
            .last_price()
            .ok_or_else(|| GatewayError::Parse(format!("no last price for {}", symbol)))
    }
}

async fn check_status(response: reqwest::Response) -> GatewayResult<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(GatewayError::RateLimited);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(GatewayError::Auth(format!("BingX rejected credentials ({})", status)));
    }
    if status.is_server_error() {
        return Err(GatewayError::Network(format!("BingX server error {}", status)));
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

#[async_trait]
impl OrderGateway for BingxClient {
    async fn set_leverage(&self, symbol: &Symbol, side: Side, leverage: u32) -> GatewayResult<()> {
        let params = [
            ("symbol", to_bingx_symbol(symbol.as_str())),
            ("side", side.as_str().to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .signed(Method::POST, LEVERAGE_PATH, &params, retry_writes)
            .await?;
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
    ) -> GatewayResult<OrderAck> {
        let params = vec![
            ("symbol", to_bingx_symbol(symbol.as_str())),
            ("side", order_side(side, true).to_string()),
            ("positionSide", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", format_number(quantity)),
        ];
        self.place_order(params, quantity).await
    }

    async fn place_stop_order(
        &self,
        symbol: &Symbol,
        side: Side,
        stop_price: f64,
    ) -> GatewayResult<OrderAck> {
        self.place_trigger(symbol, side, "STOP_MARKET", stop_price).await
    }

    async fn place_take_profit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        price: f64,
    ) -> GatewayResult<OrderAck> {
        self.place_trigger(symbol, side, "TAKE_PROFIT_MARKET", price).await
    }

    async fn get_open_positions(&self, symbol: &Symbol) -> GatewayResult<Vec<ExchangePosition>> {
        let params = [("symbol", to_bingx_symbol(symbol.as_str()))];
        let rows: Vec<BingxPosition> = self
            .signed(Method::GET, POSITIONS_PATH, &params, retry_reads)
            .await?;
        Ok(rows.iter().filter_map(BingxPosition::to_position).collect())
    }

    async fn open_order_ids(&self, symbol: &Symbol) -> GatewayResult<Vec<String>> {
        let params = [("symbol", to_bingx_symbol(symbol.as_str()))];
        let open: OpenOrders = self
            .signed(Method::GET, OPEN_ORDERS_PATH, &params, retry_reads)
            .await?;
        Ok(open.orders.into_iter().map(|o| o.order_id).collect())
    }

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> GatewayResult<()> {
        let params = [
            ("symbol", to_bingx_symbol(symbol.as_str())),
            ("orderId", order_id.to_string()),
        ];
        let _: serde_json::Value = self
            .signed(Method::DELETE, ORDER_PATH, &params, retry_reads)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for BingxClient {
    async fn fetch_ohlc(
        &self,
        symbol: &Symbol,
        timeframe: &str,
        count: usize,
    ) -> Result<Vec<Candle>, ScanError> {
        let candles = self
            .get_klines(symbol, timeframe, count)
            .await
            .map_err(|e| ScanError::DataUnavailable {
                symbol: symbol.clone(),
                reason: e.to_string(),
            })?;
        require_bars(symbol, candles, count)
    }

    async fn latest_price(&self, symbol: &Symbol) -> Result<f64, ScanError> {
        self.get_price(symbol)
            .await
            .map_err(|e| ScanError::DataUnavailable {
                symbol: symbol.clone(),
                reason: e.to_string(),
            })
    }
}
