//! Order Gateway (driven port).
//!
//! Abstracts the exchange. Every call is assumed slow, rate-limited and
//! fallible; callers never hold the position registry lock across one.

pub mod retry;
pub mod simulated;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{InstrumentRules, OrderSide, Side};

pub use retry::{ErrorCategory, LinearBackoff, RetryPolicy};
pub use simulated::{GatewayOp, SimulatedExchange};

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderKind {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
    /// Stop-loss trigger order.
    StopMarket,
    /// Take-profit trigger order.
    TakeProfitMarket,
}

impl OrderKind {
    /// Stop-loss or take-profit trigger order.
    #[must_use]
    pub const fn is_protective(self) -> bool {
        matches!(self, Self::StopMarket | Self::TakeProfitMarket)
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopMarket => "STOP_MARKET",
            Self::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        };
        f.write_str(s)
    }
}

/// Exchange order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Accepted, resting or not yet reported filled.
    New,
    /// Partially filled.
    PartiallyFilled,
    /// Fully filled.
    Filled,
    /// Cancelled.
    Canceled,
    /// Rejected by the venue.
    Rejected,
    /// Expired.
    Expired,
}

impl OrderStatus {
    /// Still working on the book.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }
}

/// Order placement request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-assigned order id.
    pub client_order_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub kind: OrderKind,
    /// Quantity. Ignored when `close_position` is set.
    pub quantity: Decimal,
    /// Limit price.
    pub price: Option<Decimal>,
    /// Trigger price for stop / take-profit orders.
    pub trigger_price: Option<Decimal>,
    /// Only reduce an existing position.
    pub reduce_only: bool,
    /// Close whatever remains of the position when triggered.
    pub close_position: bool,
}

impl OrderRequest {
    fn base(symbol: &str, side: OrderSide, kind: OrderKind, quantity: Decimal) -> Self {
        Self {
            client_order_id: format!("pe-{}", uuid::Uuid::new_v4().simple()),
            symbol: symbol.to_string(),
            side,
            kind,
            quantity,
            price: None,
            trigger_price: None,
            reduce_only: false,
            close_position: false,
        }
    }

    /// Market order.
    #[must_use]
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self::base(symbol, side, OrderKind::Market, quantity)
    }

    /// Limit order.
    #[must_use]
    pub fn limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            price: Some(price),
            ..Self::base(symbol, side, OrderKind::Limit, quantity)
        }
    }

    /// Stop-loss closing the entire remaining position of `position_side`.
    #[must_use]
    pub fn stop_loss(symbol: &str, position_side: Side, trigger: Decimal) -> Self {
        Self {
            trigger_price: Some(trigger),
            close_position: true,
            reduce_only: true,
            ..Self::base(symbol, position_side.exit_side(), OrderKind::StopMarket, Decimal::ZERO)
        }
    }

    /// Take-profit closing the entire remaining position of `position_side`.
    #[must_use]
    pub fn take_profit(symbol: &str, position_side: Side, trigger: Decimal) -> Self {
        Self {
            trigger_price: Some(trigger),
            close_position: true,
            reduce_only: true,
            ..Self::base(
                symbol,
                position_side.exit_side(),
                OrderKind::TakeProfitMarket,
                Decimal::ZERO,
            )
        }
    }

    /// Mark the order reduce-only.
    #[must_use]
    pub const fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Exchange view of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    /// Exchange order id.
    pub order_id: String,
    /// Client order id.
    pub client_order_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Order type.
    pub kind: OrderKind,
    /// Status.
    pub status: OrderStatus,
    /// Requested quantity.
    pub quantity: Decimal,
    /// Filled quantity.
    pub filled_qty: Decimal,
    /// Average fill price.
    pub avg_price: Option<Decimal>,
    /// Limit price.
    pub price: Option<Decimal>,
    /// Trigger price.
    pub trigger_price: Option<Decimal>,
    /// Reduce-only flag.
    pub reduce_only: bool,
    /// Close-position flag.
    pub close_position: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl OrderSnapshot {
    /// A live stop/take-profit order that would reduce a position of `side`.
    #[must_use]
    pub fn protects(&self, side: Side) -> bool {
        self.kind.is_protective() && self.status.is_open() && self.side == side.exit_side()
    }
}

/// Exchange view of a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePosition {
    /// Instrument symbol.
    pub symbol: String,
    /// Direction.
    pub side: Side,
    /// Absolute quantity.
    pub quantity: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Mark price.
    pub mark_price: Decimal,
    /// Leverage.
    pub leverage: u32,
    /// Unrealized PnL reported by the venue.
    pub unrealized_pnl: Decimal,
}

/// A confirmed trade from the fill history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Order that produced the fill.
    pub order_id: String,
    /// Instrument symbol.
    pub symbol: String,
    /// Buy or sell.
    pub side: OrderSide,
    /// Fill price.
    pub price: Decimal,
    /// Fill quantity.
    pub quantity: Decimal,
    /// Realized PnL reported by the venue.
    pub realized_pnl: Decimal,
    /// Fee charged.
    pub fee: Decimal,
    /// Fill time.
    pub time: DateTime<Utc>,
}

/// Account balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Wallet balance.
    pub total: Decimal,
    /// Balance available for new margin.
    pub available: Decimal,
}

/// Funding rate and next settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingInfo {
    /// Rate per settlement as a fraction (0.0001 = 0.01%).
    pub rate: Decimal,
    /// Next settlement time.
    pub next_funding_at: DateTime<Utc>,
}

/// Order gateway error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Network or connection failure.
    #[error("exchange connection error: {message}")]
    Connection {
        /// Error details.
        message: String,
    },

    /// Request timed out.
    #[error("exchange request timed out")]
    Timeout,

    /// Rate limited.
    #[error("rate limited by exchange")]
    RateLimited,

    /// Order rejected.
    #[error("order rejected: {reason}")]
    OrderRejected {
        /// Rejection reason.
        reason: String,
    },

    /// Order does not exist (already filled, cancelled or never placed).
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// The missing order id.
        order_id: String,
    },

    /// Not enough margin.
    #[error("insufficient margin")]
    InsufficientMargin,

    /// Anything else.
    #[error("exchange error: {message}")]
    Unknown {
        /// Error details.
        message: String,
    },
}

impl GatewayError {
    /// Retry classification.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } | Self::Timeout | Self::Unknown { .. } => {
                ErrorCategory::Retryable
            }
            Self::RateLimited => ErrorCategory::RateLimited,
            Self::OrderRejected { .. } | Self::OrderNotFound { .. } | Self::InsufficientMargin => {
                ErrorCategory::NonRetryable
            }
        }
    }
}

/// Port for exchange interactions.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Place an order.
    async fn place_order(&self, request: OrderRequest) -> Result<OrderSnapshot, GatewayError>;

    /// Cancel an order.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;

    /// Open orders for one symbol, or all symbols.
    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderSnapshot>, GatewayError>;

    /// All non-zero positions.
    async fn positions(&self) -> Result<Vec<ExchangePosition>, GatewayError>;

    /// Status of a specific order.
    async fn order_status(&self, symbol: &str, order_id: &str)
    -> Result<OrderSnapshot, GatewayError>;

    /// Most recent fills for a symbol, newest last.
    async fn recent_fills(&self, symbol: &str, limit: usize) -> Result<Vec<Fill>, GatewayError>;

    /// Account balance.
    async fn balance(&self) -> Result<Balance, GatewayError>;

    /// Funding rate, if the instrument has one.
    async fn funding(&self, symbol: &str) -> Result<Option<FundingInfo>, GatewayError>;

    /// Current mark price.
    async fn mark_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    /// Tick/lot rules.
    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, GatewayError>;
}

/// Cancel an order, treating "already gone" as success.
pub async fn cancel_idempotent<G: OrderGateway + ?Sized>(
    gateway: &G,
    symbol: &str,
    order_id: &str,
) -> Result<(), GatewayError> {
    match gateway.cancel_order(symbol, order_id).await {
        Ok(()) | Err(GatewayError::OrderNotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Per-symbol cache of instrument rules. Rules change rarely; the cache is
/// filled on first use and never expires.
#[derive(Debug, Default)]
pub struct RulesCache {
    rules: Mutex<HashMap<String, InstrumentRules>>,
}

impl RulesCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached rules for `symbol`, fetching them on a miss.
    pub async fn get<G: OrderGateway + ?Sized>(
        &self,
        gateway: &G,
        symbol: &str,
    ) -> Result<InstrumentRules, GatewayError> {
        if let Some(rules) = self.rules.lock().get(symbol).copied() {
            return Ok(rules);
        }
        let rules = gateway.instrument_rules(symbol).await?;
        self.rules.lock().insert(symbol.to_string(), rules);
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn stop_loss_request_closes_position_on_exit_side() {
        let req = OrderRequest::stop_loss("BTCUSDT", Side::Long, dec!(98));
        assert_eq!(req.side, OrderSide::Sell);
        assert_eq!(req.kind, OrderKind::StopMarket);
        assert!(req.close_position);
        assert_eq!(req.trigger_price, Some(dec!(98)));
    }

    #[test]
    fn short_take_profit_buys_back() {
        let req = OrderRequest::take_profit("BTCUSDT", Side::Short, dec!(90));
        assert_eq!(req.side, OrderSide::Buy);
        assert!(req.kind.is_protective());
    }

    #[test]
    fn client_order_ids_are_unique() {
        let a = OrderRequest::market("X", OrderSide::Buy, dec!(1));
        let b = OrderRequest::market("X", OrderSide::Buy, dec!(1));
        assert_ne!(a.client_order_id, b.client_order_id);
    }

    #[test]
    fn error_categories() {
        assert_eq!(GatewayError::Timeout.category(), ErrorCategory::Retryable);
        assert_eq!(GatewayError::RateLimited.category(), ErrorCategory::RateLimited);
        assert_eq!(
            GatewayError::InsufficientMargin.category(),
            ErrorCategory::NonRetryable
        );
    }

    #[tokio::test]
    async fn cancel_idempotent_swallows_not_found() {
        let exchange = SimulatedExchange::new();
        let result = cancel_idempotent(&exchange, "BTCUSDT", "does-not-exist").await;
        assert!(result.is_ok());
    }
}
