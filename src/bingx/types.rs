//! BingX swap API payloads
//!
//! Every response is wrapped in `{"code": 0, "msg": "", "data": ...}`; a
//! non-zero code is an API error. Numeric fields arrive either as strings
//! or as JSON numbers depending on the endpoint.

use serde::{Deserialize, Deserializer};

use crate::error::{GatewayError, GatewayResult};
use crate::exchange::{ExchangePosition, OrderAck};
use crate::{Side, Symbol};

/// Exchange code returned when the request rate is exceeded
pub const RATE_LIMIT_CODE: i64 = 100410;

/// `BTCUSDT` → `BTC-USDT`; symbols already containing a dash pass through
pub fn to_bingx_symbol(symbol: &str) -> String {
    if symbol.contains('-') {
        return symbol.to_string();
    }
    match symbol.strip_suffix("USDT") {
        Some(base) if !base.is_empty() => format!("{}-USDT", base),
        _ => symbol.to_string(),
    }
}

/// `BTC-USDT` → `BTCUSDT`
pub fn from_bingx_symbol(symbol: &str) -> Symbol {
    Symbol::new(&symbol.replace('-', ""))
}

/// Order side for opening (`entry = true`) or closing a `side` position
pub fn order_side(side: Side, entry: bool) -> &'static str {
    match (side, entry) {
        (Side::Long, true) | (Side::Short, false) => "BUY",
        (Side::Short, true) | (Side::Long, false) => "SELL",
    }
}

#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Unwrap the payload or map the exchange code onto a gateway error
    pub fn into_result(self) -> GatewayResult<T> {
        if self.code == RATE_LIMIT_CODE {
            return Err(GatewayError::RateLimited);
        }
        if self.code != 0 {
            return Err(GatewayError::Api {
                code: self.code,
                message: self.msg,
            });
        }
        self.data
            .ok_or_else(|| GatewayError::Parse("response without data".into()))
    }
}

fn flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.is_empty() => Ok(0.0),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n.to_string(),
        Raw::Text(s) => s,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingxOrder {
    #[serde(deserialize_with = "flexible_id")]
    pub order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default, rename = "type")]
    pub order_type: String,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub executed_qty: f64,
}

impl BingxOrder {
    pub fn to_ack(&self, requested_quantity: f64) -> OrderAck {
        OrderAck {
            order_id: self.order_id.clone(),
            avg_price: (self.avg_price > 0.0).then_some(self.avg_price),
            quantity: if self.executed_qty > 0.0 {
                self.executed_qty
            } else {
                requested_quantity
            },
        }
    }
}

/// `data` of order placement: `{"order": {...}}`
#[derive(Debug, Clone, Deserialize)]
pub struct OrderEnvelope {
    pub order: BingxOrder,
}

/// `data` of the open-orders endpoint: `{"orders": [...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct OpenOrders {
    #[serde(default)]
    pub orders: Vec<BingxOrder>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingxPosition {
    pub symbol: String,
    pub position_side: String,
    #[serde(deserialize_with = "flexible_f64")]
    pub position_amt: f64,
    #[serde(deserialize_with = "flexible_f64")]
    pub avg_price: f64,
    #[serde(default, deserialize_with = "flexible_f64")]
    pub unrealized_profit: f64,
}

impl BingxPosition {
    /// Open position, or `None` for flat or unrecognized rows
    pub fn to_position(&self) -> Option<ExchangePosition> {
        let side = match self.position_side.as_str() {
            "LONG" => Side::Long,
            "SHORT" => Side::Short,
            _ => return None,
        };
        let quantity = self.position_amt.abs();
        if quantity == 0.0 {
            return None;
        }
        Some(ExchangePosition {
            symbol: from_bingx_symbol(&self.symbol),
            side,
            quantity,
            entry_price: self.avg_price,
            unrealized_pnl: self.unrealized_profit,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingxTicker {
    #[serde(default)]
    pub symbol: String,
    #[serde(deserialize_with = "flexible_f64")]
    pub last_price: f64,
}

/// The ticker endpoint answers with an object or a one-element list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TickerData {
    One(BingxTicker),
    Many(Vec<BingxTicker>),
}

impl TickerData {
    pub fn last_price(&self) -> Option<f64> {
        let price = match self {
            TickerData::One(t) => t.last_price,
            TickerData::Many(list) => list.first()?.last_price,
        };
        (price.is_finite() && price > 0.0).then_some(price)
    }
}
