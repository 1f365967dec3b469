//! Order execution capability
//!
//! The engine talks to a futures exchange through [`OrderGateway`]. Opening
//! a position is a three step sequence: market entry, stop-loss and
//! take-profit. Protective orders are retried with progressively wider
//! levels; if one still cannot be placed the position is reported as
//! [`ScanError::CriticalUnprotectedPosition`].

use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::detector::ActivePosition;
use crate::error::{GatewayResult, ScanError};
use crate::{Side, Symbol};

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    /// Average fill price, when the exchange reports one
    pub avg_price: Option<f64>,
    pub quantity: f64,
}

/// Open position as reported by the exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangePosition {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn set_leverage(&self, symbol: &Symbol, side: Side, leverage: u32) -> GatewayResult<()>;

    /// Market order opening a position on `side`
    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: f64,
    ) -> GatewayResult<OrderAck>;

    /// Stop-market order closing the `side` position at `stop_price`
    async fn place_stop_order(
        &self,
        symbol: &Symbol,
        side: Side,
        stop_price: f64,
    ) -> GatewayResult<OrderAck>;

    /// Take-profit-market order closing the `side` position at `price`
    async fn place_take_profit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        price: f64,
    ) -> GatewayResult<OrderAck>;

    async fn get_open_positions(&self, symbol: &Symbol) -> GatewayResult<Vec<ExchangePosition>>;

    /// Ids of orders still resting on the book for `symbol`
    async fn open_order_ids(&self, symbol: &Symbol) -> GatewayResult<Vec<String>>;

    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> GatewayResult<()>;
}

/// Sizing and protective-order settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Margin committed per trade, in USDT
    pub order_notional_usdt: f64,
    pub leverage: u32,
    /// Decimal places of the order quantity
    pub quantity_precision: u32,
    /// Placement attempts per protective order
    pub protective_order_attempts: u32,
    /// Minimum distance from the fill price used on the first retry
    pub safety_margin_base: f64,
    /// Extra distance added on every further retry
    pub safety_margin_step: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_notional_usdt: 10.0,
            leverage: 10,
            quantity_precision: 3,
            protective_order_attempts: 3,
            safety_margin_base: 0.008,
            safety_margin_step: 0.002,
        }
    }
}

impl ExecutionConfig {
    /// Contract quantity for `price`, rounded toward zero.
    ///
    /// Returns `None` when the rounded size is zero or not representable.
    pub fn quantity_for(&self, price: f64) -> Option<f64> {
        if !(price.is_finite() && price > 0.0) {
            return None;
        }
        let raw = self.order_notional_usdt * self.leverage as f64 / price;
        let quantity = Decimal::from_f64(raw)?
            .round_dp_with_strategy(self.quantity_precision, RoundingStrategy::ToZero);
        if quantity.is_zero() {
            return None;
        }
        quantity.to_f64()
    }

    /// Distance from the fill price demanded on `attempt` (0-based).
    ///
    /// The first attempt uses the planned level unchanged.
    pub fn safety_margin(&self, attempt: u32) -> f64 {
        if attempt == 0 {
            0.0
        } else {
            self.safety_margin_base + self.safety_margin_step * (attempt - 1) as f64
        }
    }

    /// Stop level for `attempt`: the planned stop, pushed out to at least
    /// the attempt's safety margin on the loss side of `fill`
    pub fn stop_level(&self, side: Side, planned: f64, fill: f64, attempt: u32) -> f64 {
        let margin = self.safety_margin(attempt);
        if margin == 0.0 {
            return planned;
        }
        match side {
            Side::Long => planned.min(fill * (1.0 - margin)),
            Side::Short => planned.max(fill * (1.0 + margin)),
        }
    }

    /// Target level for `attempt`, mirrored on the profit side
    pub fn take_profit_level(&self, side: Side, planned: f64, fill: f64, attempt: u32) -> f64 {
        let margin = self.safety_margin(attempt);
        if margin == 0.0 {
            return planned;
        }
        match side {
            Side::Long => planned.max(fill * (1.0 + margin)),
            Side::Short => planned.min(fill * (1.0 - margin)),
        }
    }
}

/// Orders backing an opened position
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedEntry {
    pub entry: OrderAck,
    pub stop: OrderAck,
    pub take_profit: OrderAck,
    pub stop_price: f64,
    pub take_profit_price: f64,
}

impl ProtectedEntry {
    pub fn fill_price(&self, fallback: f64) -> f64 {
        self.entry.avg_price.unwrap_or(fallback)
    }
}

#[derive(Clone, Copy)]
enum Protection {
    Stop,
    TakeProfit,
}

impl Protection {
    fn label(self) -> &'static str {
        match self {
            Protection::Stop => "stop-loss",
            Protection::TakeProfit => "take-profit",
        }
    }
}

async fn place_protection(
    gateway: &dyn OrderGateway,
    config: &ExecutionConfig,
    position: &ActivePosition,
    fill: f64,
    kind: Protection,
) -> Result<(OrderAck, f64), ScanError> {
    let attempts = config.protective_order_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 0..attempts {
        let price = match kind {
            Protection::Stop => {
                config.stop_level(position.side, position.stop_loss, fill, attempt)
            }
            Protection::TakeProfit => {
                config.take_profit_level(position.side, position.take_profit, fill, attempt)
            }
        };
        let placed = match kind {
            Protection::Stop => {
                gateway
                    .place_stop_order(&position.symbol, position.side, price)
                    .await
            }
            Protection::TakeProfit => {
                gateway
                    .place_take_profit_order(&position.symbol, position.side, price)
                    .await
            }
        };
        match placed {
            Ok(ack) => {
                info!(
                    "🛡️ {} {} placed at {:.8} (attempt {})",
                    position.symbol,
                    kind.label(),
                    price,
                    attempt + 1
                );
                return Ok((ack, price));
            }
            Err(e) => {
                warn!(
                    "{} {} at {:.8} rejected (attempt {}/{}): {}",
                    position.symbol,
                    kind.label(),
                    price,
                    attempt + 1,
                    attempts,
                    e
                );
                last_error = e.to_string();
            }
        }
    }

    error!(
        "🚨 {} {} position left without {}",
        position.symbol,
        position.side,
        kind.label()
    );
    Err(ScanError::CriticalUnprotectedPosition {
        symbol: position.symbol.clone(),
        side: position.side,
        message: format!(
            "{} failed after {} attempts: {}",
            kind.label(),
            attempts,
            last_error
        ),
    })
}

/// Open `position` on the exchange and attach its protective orders.
///
/// A failed entry is an ordinary external-service error; a missing stop or
/// target after the entry filled is critical.
pub async fn open_protected_position(
    gateway: &dyn OrderGateway,
    config: &ExecutionConfig,
    position: &ActivePosition,
) -> Result<ProtectedEntry, ScanError> {
    let quantity = config
        .quantity_for(position.entry_price)
        .ok_or_else(|| ScanError::ExternalService {
            service: "exchange",
            message: format!(
                "order size for {} at {} rounds to zero",
                position.symbol, position.entry_price
            ),
        })?;

    let existing = gateway.get_open_positions(&position.symbol).await?;
    if let Some(open) = existing.iter().find(|p| p.side == position.side) {
        return Err(ScanError::ExternalService {
            service: "exchange",
            message: format!(
                "{} already has an open {} position of {}",
                position.symbol, open.side, open.quantity
            ),
        });
    }

    if let Err(e) = gateway
        .set_leverage(&position.symbol, position.side, config.leverage)
        .await
    {
        warn!("{} - leverage not updated: {}", position.symbol, e);
    }

    let entry = gateway
        .place_market_order(&position.symbol, position.side, quantity)
        .await?;
    let fill = entry.avg_price.unwrap_or(position.entry_price);
    info!(
        "🚀 {} {} opened: qty {} at {:.8} (order {})",
        position.symbol, position.side, entry.quantity, fill, entry.order_id
    );

    let (stop, stop_price) =
        place_protection(gateway, config, position, fill, Protection::Stop).await?;
    let (take_profit, take_profit_price) =
        place_protection(gateway, config, position, fill, Protection::TakeProfit).await?;

    Ok(ProtectedEntry {
        entry,
        stop,
        take_profit,
        stop_price,
        take_profit_price,
    })
}

/// Cancel whatever protective order survived a closed position.
///
/// Returns how many orders were cancelled; individual failures are logged.
pub async fn cancel_remaining_orders(gateway: &dyn OrderGateway, symbol: &Symbol) -> usize {
    let ids = match gateway.open_order_ids(symbol).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!("{} - could not list open orders: {}", symbol, e);
            return 0;
        }
    };

    let mut cancelled = 0;
    for id in ids {
        match gateway.cancel_order(symbol, &id).await {
            Ok(()) => {
                info!("🧹 {} - cancelled order {}", symbol, id);
                cancelled += 1;
            }
            Err(e) => warn!("{} - cancel of order {} failed: {}", symbol, id, e),
        }
    }
    cancelled
}
