//! In-memory exchange for paper trading and tests.
//!
//! Market orders fill immediately at the mark price. Limit orders rest until
//! the mark crosses them or they are filled explicitly. Stop and take-profit
//! orders rest until [`SimulatedExchange::trigger_conditionals`] is called, so
//! tests decide when exchange-side protection fires. Faults can be queued per
//! operation to exercise retry and healing paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{
    Balance, ExchangePosition, Fill, FundingInfo, GatewayError, OrderGateway, OrderKind,
    OrderRequest, OrderSnapshot, OrderStatus,
};
use crate::domain::{InstrumentRules, OrderSide, Side};

/// Gateway operation, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    /// `place_order`.
    PlaceOrder,
    /// `cancel_order`.
    CancelOrder,
    /// `open_orders`.
    OpenOrders,
    /// `positions`.
    Positions,
    /// `order_status`.
    OrderStatus,
    /// `recent_fills`.
    RecentFills,
    /// `balance`.
    Balance,
    /// `funding`.
    Funding,
    /// `mark_price`.
    MarkPrice,
    /// `instrument_rules`.
    InstrumentRules,
}

#[derive(Debug)]
struct State {
    positions: HashMap<(String, Side), ExchangePosition>,
    orders: HashMap<String, OrderSnapshot>,
    fills: Vec<Fill>,
    marks: HashMap<String, Decimal>,
    rules: HashMap<String, InstrumentRules>,
    funding: HashMap<String, FundingInfo>,
    balance: Balance,
    faults: HashMap<GatewayOp, VecDeque<GatewayError>>,
    status_lag: u32,
    lagging: HashMap<String, u32>,
    fill_market_orders: bool,
    default_leverage: u32,
    taker_fee_rate: Decimal,
}

impl State {
    fn take_fault(&mut self, op: GatewayOp) -> Result<(), GatewayError> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn mark(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.marks
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Unknown {
                message: format!("no mark price for {symbol}"),
            })
    }

    /// Apply a fill to the position book. Returns the quantity actually filled.
    fn apply_fill(
        &mut self,
        order_id: &str,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        reduce_only: bool,
    ) -> Result<Decimal, GatewayError> {
        let fee = price * qty * self.taker_fee_rate;
        let (filled, realized) = if reduce_only {
            let pos_side = match side {
                OrderSide::Sell => Side::Long,
                OrderSide::Buy => Side::Short,
            };
            let key = (symbol.to_string(), pos_side);
            let Some(pos) = self.positions.get_mut(&key) else {
                return Err(GatewayError::OrderRejected {
                    reason: "reduce-only order would open a position".to_string(),
                });
            };
            let filled = qty.min(pos.quantity);
            let realized = (price - pos.entry_price) * filled * pos_side.sign();
            pos.quantity -= filled;
            if pos.quantity <= Decimal::ZERO {
                self.positions.remove(&key);
            }
            (filled, realized)
        } else {
            let pos_side = match side {
                OrderSide::Buy => Side::Long,
                OrderSide::Sell => Side::Short,
            };
            let leverage = self.default_leverage;
            let pos = self
                .positions
                .entry((symbol.to_string(), pos_side))
                .or_insert_with(|| ExchangePosition {
                    symbol: symbol.to_string(),
                    side: pos_side,
                    quantity: Decimal::ZERO,
                    entry_price: price,
                    mark_price: price,
                    leverage,
                    unrealized_pnl: Decimal::ZERO,
                });
            let new_qty = pos.quantity + qty;
            pos.entry_price = (pos.entry_price * pos.quantity + price * qty) / new_qty;
            pos.quantity = new_qty;
            (qty, Decimal::ZERO)
        };

        self.balance.total += realized - fee;
        self.balance.available += realized - fee;
        self.fills.push(Fill {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side,
            price,
            quantity: filled,
            realized_pnl: realized,
            fee,
            time: Utc::now(),
        });
        Ok(filled)
    }

    fn position_qty(&self, symbol: &str, side: Side) -> Decimal {
        self.positions
            .get(&(symbol.to_string(), side))
            .map_or(Decimal::ZERO, |p| p.quantity)
    }
}

/// In-memory exchange.
#[derive(Debug)]
pub struct SimulatedExchange {
    state: Mutex<State>,
    order_counter: AtomicU64,
}

impl Default for SimulatedExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExchange {
    /// Empty exchange with a 10,000 balance.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                positions: HashMap::new(),
                orders: HashMap::new(),
                fills: Vec::new(),
                marks: HashMap::new(),
                rules: HashMap::new(),
                funding: HashMap::new(),
                balance: Balance {
                    total: dec!(10000),
                    available: dec!(10000),
                },
                faults: HashMap::new(),
                status_lag: 0,
                lagging: HashMap::new(),
                fill_market_orders: true,
                default_leverage: 10,
                taker_fee_rate: dec!(0.0004),
            }),
            order_counter: AtomicU64::new(1),
        }
    }

    fn next_order_id(&self) -> String {
        format!("sim-{}", self.order_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Set the mark price. Resting limit entries that the new price crosses fill.
    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock();
        state.marks.insert(symbol.to_string(), price);

        let crossing: Vec<OrderSnapshot> = state
            .orders
            .values()
            .filter(|o| {
                o.symbol == symbol
                    && o.kind == OrderKind::Limit
                    && o.status.is_open()
                    && o.price.is_some_and(|limit| match o.side {
                        OrderSide::Buy => price <= limit,
                        OrderSide::Sell => price >= limit,
                    })
            })
            .cloned()
            .collect();

        for order in crossing {
            let limit = order.price.unwrap_or(price);
            let qty = order.quantity - order.filled_qty;
            if let Ok(filled) =
                state.apply_fill(&order.order_id, symbol, order.side, qty, limit, order.reduce_only)
                && let Some(stored) = state.orders.get_mut(&order.order_id)
            {
                stored.filled_qty += filled;
                stored.avg_price = Some(limit);
                stored.status = OrderStatus::Filled;
            }
        }
    }

    /// Override tick/lot rules for a symbol.
    pub fn set_rules(&self, symbol: &str, rules: InstrumentRules) {
        self.state.lock().rules.insert(symbol.to_string(), rules);
    }

    /// Set funding for a symbol.
    pub fn set_funding(&self, symbol: &str, funding: FundingInfo) {
        self.state.lock().funding.insert(symbol.to_string(), funding);
    }

    /// Set the account balance.
    pub fn set_balance(&self, total: Decimal, available: Decimal) {
        self.state.lock().balance = Balance { total, available };
    }

    /// Leverage assigned to positions opened through this exchange.
    pub fn set_default_leverage(&self, leverage: u32) {
        self.state.lock().default_leverage = leverage;
    }

    /// Report fresh market fills as `New` for the next `polls` status queries.
    pub fn set_status_lag(&self, polls: u32) {
        self.state.lock().status_lag = polls;
    }

    /// When disabled, market orders are accepted but never fill.
    pub fn set_market_fills(&self, enabled: bool) {
        self.state.lock().fill_market_orders = enabled;
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: GatewayOp, error: GatewayError) {
        self.fail_times(op, 1, error);
    }

    /// Fail the next `times` calls of `op` with `error`.
    pub fn fail_times(&self, op: GatewayOp, times: usize, error: GatewayError) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Create a position as if it had been opened outside the engine.
    pub fn inject_position(&self, position: ExchangePosition) {
        let mut state = self.state.lock();
        state.marks.entry(position.symbol.clone()).or_insert(position.mark_price);
        state
            .positions
            .insert((position.symbol.clone(), position.side), position);
    }

    /// Close a position outside the engine at the current mark.
    pub fn close_externally(&self, symbol: &str, side: Side) -> bool {
        let mut state = self.state.lock();
        let qty = state.position_qty(symbol, side);
        if qty.is_zero() {
            return false;
        }
        let Ok(price) = state.mark(symbol) else {
            return false;
        };
        let id = self.next_order_id();
        state
            .apply_fill(&id, symbol, side.exit_side(), qty, price, true)
            .is_ok()
    }

    /// Change a position's size outside the engine (missed partial close or
    /// manual addition). `entry_price` replaces the average entry when given.
    pub fn set_position_quantity(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        entry_price: Option<Decimal>,
    ) {
        let mut state = self.state.lock();
        if let Some(pos) = state.positions.get_mut(&(symbol.to_string(), side)) {
            pos.quantity = quantity;
            if let Some(entry) = entry_price {
                pos.entry_price = entry;
            }
        }
    }

    /// Remove an order as if it had been deleted by hand.
    pub fn delete_order(&self, order_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_open() => {
                order.status = OrderStatus::Canceled;
                true
            }
            _ => false,
        }
    }

    /// Fill (part of) a resting limit order at its limit price.
    pub fn fill_order(&self, order_id: &str, qty: Decimal) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::OrderNotFound {
                order_id: order_id.to_string(),
            })?;
        let price = match order.price {
            Some(p) => p,
            None => state.mark(&order.symbol)?,
        };
        let qty = qty.min(order.quantity - order.filled_qty);
        let filled = state.apply_fill(
            order_id,
            &order.symbol,
            order.side,
            qty,
            price,
            order.reduce_only,
        )?;
        if let Some(stored) = state.orders.get_mut(order_id) {
            stored.filled_qty += filled;
            stored.avg_price = Some(price);
            stored.status = if stored.filled_qty >= stored.quantity {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        }
        Ok(())
    }

    /// Fire every resting stop / take-profit order for `symbol` whose trigger
    /// the mark price has crossed. Returns how many fired.
    pub fn trigger_conditionals(&self, symbol: &str) -> usize {
        let mut state = self.state.lock();
        let Ok(mark) = state.mark(symbol) else {
            return 0;
        };
        let due: Vec<OrderSnapshot> = state
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.kind.is_protective() && o.status.is_open())
            .filter(|o| {
                o.trigger_price.is_some_and(|trigger| {
                    let long_protection = o.side == OrderSide::Sell;
                    match (o.kind, long_protection) {
                        (OrderKind::StopMarket, true) | (OrderKind::TakeProfitMarket, false) => {
                            mark <= trigger
                        }
                        _ => mark >= trigger,
                    }
                })
            })
            .cloned()
            .collect();

        let mut fired = 0;
        for order in due {
            let pos_side = match order.side {
                OrderSide::Sell => Side::Long,
                OrderSide::Buy => Side::Short,
            };
            let qty = if order.close_position {
                state.position_qty(symbol, pos_side)
            } else {
                order.quantity
            };
            if qty.is_zero() {
                continue;
            }
            if let Ok(filled) =
                state.apply_fill(&order.order_id, symbol, order.side, qty, mark, true)
                && let Some(stored) = state.orders.get_mut(&order.order_id)
            {
                stored.filled_qty = filled;
                stored.avg_price = Some(mark);
                stored.status = OrderStatus::Filled;
                fired += 1;
            }
        }
        fired
    }

    /// Exchange-side position, if open.
    #[must_use]
    pub fn position(&self, symbol: &str, side: Side) -> Option<ExchangePosition> {
        self.state
            .lock()
            .positions
            .get(&(symbol.to_string(), side))
            .cloned()
    }

    /// Open orders of `kind` for `symbol`.
    #[must_use]
    pub fn open_orders_of(&self, symbol: &str, kind: OrderKind) -> Vec<OrderSnapshot> {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && o.kind == kind && o.status.is_open())
            .cloned()
            .collect()
    }

    /// Every fill recorded for `symbol`, oldest first.
    #[must_use]
    pub fn fills_for(&self, symbol: &str) -> Vec<Fill> {
        self.state
            .lock()
            .fills
            .iter()
            .filter(|f| f.symbol == symbol)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrderGateway for SimulatedExchange {
    async fn place_order(&self, request: OrderRequest) -> Result<OrderSnapshot, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::PlaceOrder)?;

        let order_id = self.next_order_id();
        let mut snapshot = OrderSnapshot {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            kind: request.kind,
            status: OrderStatus::New,
            quantity: request.quantity,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            price: request.price,
            trigger_price: request.trigger_price,
            reduce_only: request.reduce_only,
            close_position: request.close_position,
            created_at: Utc::now(),
        };

        let fill_price = match request.kind {
            OrderKind::Market if state.fill_market_orders => Some(state.mark(&request.symbol)?),
            OrderKind::Limit => {
                let mark = state.mark(&request.symbol)?;
                let limit = request.price.unwrap_or(mark);
                let marketable = match request.side {
                    OrderSide::Buy => mark <= limit,
                    OrderSide::Sell => mark >= limit,
                };
                (request.reduce_only && marketable).then_some(mark)
            }
            _ => None,
        };

        if let Some(price) = fill_price {
            let filled = state.apply_fill(
                &order_id,
                &request.symbol,
                request.side,
                request.quantity,
                price,
                request.reduce_only,
            )?;
            snapshot.filled_qty = filled;
            snapshot.avg_price = Some(price);
            snapshot.status = OrderStatus::Filled;
        }

        state.orders.insert(order_id.clone(), snapshot.clone());

        if snapshot.status == OrderStatus::Filled && state.status_lag > 0 {
            let lag = state.status_lag;
            state.lagging.insert(order_id, lag);
            snapshot.status = OrderStatus::New;
            snapshot.filled_qty = Decimal::ZERO;
            snapshot.avg_price = None;
        }
        drop(state);

        Ok(snapshot)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::CancelOrder)?;
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_open() => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            _ => Err(GatewayError::OrderNotFound {
                order_id: order_id.to_string(),
            }),
        }
    }

    async fn open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderSnapshot>, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::OpenOrders)?;
        let mut orders: Vec<OrderSnapshot> = state
            .orders
            .values()
            .filter(|o| o.status.is_open() && symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.order_id.cmp(&b.order_id)));
        Ok(orders)
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::Positions)?;
        let marks = state.marks.clone();
        Ok(state
            .positions
            .values()
            .filter(|p| p.quantity > Decimal::ZERO)
            .map(|p| {
                let mut p = p.clone();
                if let Some(mark) = marks.get(&p.symbol) {
                    p.mark_price = *mark;
                    p.unrealized_pnl = (*mark - p.entry_price) * p.quantity * p.side.sign();
                }
                p
            })
            .collect())
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<OrderSnapshot, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::OrderStatus)?;
        let mut snapshot =
            state
                .orders
                .get(order_id)
                .cloned()
                .ok_or_else(|| GatewayError::OrderNotFound {
                    order_id: order_id.to_string(),
                })?;
        if let Some(remaining) = state.lagging.get_mut(order_id) {
            if *remaining > 0 {
                *remaining -= 1;
                snapshot.status = OrderStatus::New;
                snapshot.filled_qty = Decimal::ZERO;
                snapshot.avg_price = None;
            } else {
                state.lagging.remove(order_id);
            }
        }
        Ok(snapshot)
    }

    async fn recent_fills(&self, symbol: &str, limit: usize) -> Result<Vec<Fill>, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::RecentFills)?;
        let fills: Vec<Fill> = state
            .fills
            .iter()
            .filter(|f| f.symbol == symbol)
            .cloned()
            .collect();
        let skip = fills.len().saturating_sub(limit);
        Ok(fills.into_iter().skip(skip).collect())
    }

    async fn balance(&self) -> Result<Balance, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::Balance)?;
        Ok(state.balance)
    }

    async fn funding(&self, symbol: &str) -> Result<Option<FundingInfo>, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::Funding)?;
        Ok(state.funding.get(symbol).copied())
    }

    async fn mark_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::MarkPrice)?;
        state.mark(symbol)
    }

    async fn instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, GatewayError> {
        let mut state = self.state.lock();
        state.take_fault(GatewayOp::InstrumentRules)?;
        Ok(state.rules.get(symbol).copied().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> SimulatedExchange {
        let ex = SimulatedExchange::new();
        ex.set_mark_price("BTCUSDT", dec!(100));
        ex
    }

    #[tokio::test]
    async fn market_order_opens_position_at_mark() {
        let ex = exchange();
        let ack = ex
            .place_order(OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(2)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.avg_price, Some(dec!(100)));
        let pos = ex.position("BTCUSDT", Side::Long).unwrap();
        assert_eq!(pos.quantity, dec!(2));
    }

    #[tokio::test]
    async fn reduce_only_without_position_is_rejected() {
        let ex = exchange();
        let result = ex
            .place_order(OrderRequest::market("BTCUSDT", OrderSide::Sell, dec!(1)).reduce_only())
            .await;
        assert!(matches!(result, Err(GatewayError::OrderRejected { .. })));
    }

    #[tokio::test]
    async fn status_lag_reports_new_then_filled() {
        let ex = exchange();
        ex.set_status_lag(2);
        let ack = ex
            .place_order(OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        let s1 = ex.order_status("BTCUSDT", &ack.order_id).await.unwrap();
        let s2 = ex.order_status("BTCUSDT", &ack.order_id).await.unwrap();
        let s3 = ex.order_status("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(s1.status, OrderStatus::New);
        assert_eq!(s2.status, OrderStatus::New);
        assert_eq!(s3.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn stop_loss_fires_only_when_triggered() {
        let ex = exchange();
        ex.place_order(OrderRequest::market("BTCUSDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        ex.place_order(OrderRequest::stop_loss("BTCUSDT", Side::Long, dec!(98)))
            .await
            .unwrap();

        ex.set_mark_price("BTCUSDT", dec!(99));
        assert_eq!(ex.trigger_conditionals("BTCUSDT"), 0);

        ex.set_mark_price("BTCUSDT", dec!(97.5));
        assert_eq!(ex.trigger_conditionals("BTCUSDT"), 1);
        assert!(ex.position("BTCUSDT", Side::Long).is_none());
    }

    #[tokio::test]
    async fn resting_limit_fills_when_crossed() {
        let ex = exchange();
        let ack = ex
            .place_order(OrderRequest::limit("BTCUSDT", OrderSide::Buy, dec!(1), dec!(95)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::New);
        ex.set_mark_price("BTCUSDT", dec!(94));
        let status = ex.order_status("BTCUSDT", &ack.order_id).await.unwrap();
        assert_eq!(status.status, OrderStatus::Filled);
        assert_eq!(ex.position("BTCUSDT", Side::Long).unwrap().entry_price, dec!(95));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let ex = exchange();
        ex.fail_times(GatewayOp::Positions, 2, GatewayError::Timeout);
        assert!(ex.positions().await.is_err());
        assert!(ex.positions().await.is_err());
        assert!(ex.positions().await.is_ok());
    }

    #[tokio::test]
    async fn recent_fills_returns_newest_last() {
        let ex = exchange();
        for qty in [dec!(1), dec!(2), dec!(3)] {
            ex.place_order(OrderRequest::market("BTCUSDT", OrderSide::Buy, qty))
                .await
                .unwrap();
        }
        let fills = ex.recent_fills("BTCUSDT", 2).await.unwrap();
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[1].quantity, dec!(3));
    }
}
