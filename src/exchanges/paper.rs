//! Paper exchange - in-memory venue with simulated fills
//!
//! Market orders fill at the last price for the symbol. Limit, stop and
//! take-profit orders rest until a price update crosses them. Failure modes
//! (rejections, refused cancels, polling errors, latency) are switchable so
//! the lifecycle and unwind paths can be driven deterministically.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::core::{
    Balance, Error, ExchangeConnector, Order, OrderRequest, OrderStatus, OrderType, Result, Side,
    Symbol,
};

#[derive(Default)]
struct PaperState {
    next_id: u64,
    orders: HashMap<String, Order>,
    prices: HashMap<Symbol, Decimal>,
    balances: HashMap<String, Balance>,
    /// Submissions to refuse outright
    refuse_submissions: u32,
    /// Accept submissions but report them rejected
    reject_orders: bool,
    refuse_cancels: bool,
    fail_polls: bool,
    auto_fill: bool,
    placed: u32,
    cancel_requests: u32,
}

/// Simulated venue
pub struct PaperExchange {
    name: String,
    latency: Mutex<Duration>,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            name: "paper".to_string(),
            latency: Mutex::new(Duration::ZERO),
            state: Mutex::new(PaperState {
                auto_fill: true,
                ..Default::default()
            }),
        }
    }

    /// Set the last price and trigger any resting orders it crosses.
    pub fn set_price(&self, symbol: &Symbol, price: Decimal) {
        let mut state = self.state.lock();
        state.prices.insert(symbol.clone(), price);
        if !state.auto_fill {
            return;
        }
        for order in state.orders.values_mut() {
            if &order.symbol == symbol && order.status.is_active() {
                if let Some(fill) = trigger_price(order, price) {
                    fill_order(order, fill);
                    debug!("📄 Paper fill {} {} @ {}", order.id, order.symbol, fill);
                }
            }
        }
    }

    pub fn price(&self, symbol: &Symbol) -> Option<Decimal> {
        self.state.lock().prices.get(symbol).copied()
    }

    pub fn set_balance(&self, asset: &str, free: Decimal) {
        self.state.lock().balances.insert(
            asset.to_string(),
            Balance {
                asset: asset.to_string(),
                free,
                locked: Decimal::ZERO,
            },
        );
    }

    /// Refuse the next `n` submissions.
    pub fn refuse_next_submissions(&self, n: u32) {
        self.state.lock().refuse_submissions = n;
    }

    /// Report every new order as rejected by the venue.
    pub fn reject_orders(&self, on: bool) {
        self.state.lock().reject_orders = on;
    }

    pub fn refuse_cancels(&self, on: bool) {
        self.state.lock().refuse_cancels = on;
    }

    pub fn fail_polls(&self, on: bool) {
        self.state.lock().fail_polls = on;
    }

    /// When off, nothing fills until `fill` or `set_status` is called.
    pub fn auto_fill(&self, on: bool) {
        self.state.lock().auto_fill = on;
    }

    /// Delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Fill an order by hand.
    pub fn fill(&self, order_id: &str, price: Decimal) -> bool {
        match self.state.lock().orders.get_mut(order_id) {
            Some(order) if order.status.is_active() => {
                fill_order(order, price);
                true
            }
            _ => false,
        }
    }

    /// Fill part of an order by hand; it stays active.
    pub fn partial_fill(&self, order_id: &str, quantity: Decimal, price: Decimal) -> bool {
        match self.state.lock().orders.get_mut(order_id) {
            Some(order) if order.status.is_active() && quantity < order.quantity => {
                order.status = OrderStatus::PartiallyFilled;
                order.filled_quantity = quantity;
                order.filled_price = Some(price);
                order.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Force a venue-side status change.
    pub fn set_status(&self, order_id: &str, status: OrderStatus) -> bool {
        match self.state.lock().orders.get_mut(order_id) {
            Some(order) => {
                order.status = status;
                order.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.state.lock().orders.get(order_id).cloned()
    }

    /// Orders still active on the venue for a symbol
    pub fn open_orders(&self, symbol: &Symbol) -> Vec<Order> {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| &o.symbol == symbol && o.status.is_active())
            .cloned()
            .collect()
    }

    /// Submissions received, including refused ones
    pub fn placed_count(&self) -> u32 {
        self.state.lock().placed
    }

    pub fn cancel_requests(&self) -> u32 {
        self.state.lock().cancel_requests
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Price a resting order fills at when the market trades at `last`.
fn trigger_price(order: &Order, last: Decimal) -> Option<Decimal> {
    match (order.order_type, order.side, order.price) {
        (OrderType::Market, _, _) => Some(last),
        (OrderType::Limit, Side::Buy, Some(p)) if last <= p => Some(p),
        (OrderType::Limit, Side::Sell, Some(p)) if last >= p => Some(p),
        // Stops protect a position: a sell stop fires on the way down
        (OrderType::StopLoss, Side::Sell, Some(p)) if last <= p => Some(p),
        (OrderType::StopLoss, Side::Buy, Some(p)) if last >= p => Some(p),
        (OrderType::TakeProfit, Side::Sell, Some(p)) if last >= p => Some(p),
        (OrderType::TakeProfit, Side::Buy, Some(p)) if last <= p => Some(p),
        _ => None,
    }
}

fn fill_order(order: &mut Order, price: Decimal) {
    order.status = OrderStatus::Filled;
    order.filled_quantity = order.quantity;
    order.filled_price = Some(price);
    order.updated_at = Utc::now();
}

#[async_trait]
impl ExchangeConnector for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.placed += 1;

        if state.refuse_submissions > 0 {
            state.refuse_submissions -= 1;
            return Err(Error::VenueRejected(format!(
                "{} {} {} refused",
                request.side, request.quantity, request.symbol
            )));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(Error::VenueRejected(format!("invalid quantity {}", request.quantity)));
        }
        if request.order_type != OrderType::Market && request.price.is_none() {
            return Err(Error::VenueRejected(format!("{} order without price", request.order_type)));
        }

        state.next_id += 1;
        let now = Utc::now();
        let mut order = Order {
            id: format!("PAPER-{:06}", state.next_id),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            status: OrderStatus::Placed,
            filled_quantity: Decimal::ZERO,
            filled_price: None,
            created_at: now,
            updated_at: now,
        };

        if state.reject_orders {
            order.status = OrderStatus::Rejected;
        } else if state.auto_fill {
            if let Some(last) = state.prices.get(&order.symbol).copied() {
                if let Some(fill) = trigger_price(&order, last) {
                    fill_order(&mut order, fill);
                }
            }
        }

        debug!(
            "📄 Paper order {} {} {} {} -> {}",
            order.id, order.side, order.quantity, order.symbol, order.status
        );
        state.orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<bool> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.cancel_requests += 1;
        if state.refuse_cancels {
            return Ok(false);
        }
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_active() => {
                order.status = OrderStatus::Cancelled;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_order(&self, order_id: &str, _symbol: &Symbol) -> Result<Option<Order>> {
        self.simulate_latency().await;
        let state = self.state.lock();
        if state.fail_polls {
            return Err(Error::Venue("paper venue unavailable".into()));
        }
        Ok(state.orders.get(order_id).cloned())
    }

    async fn get_balance(&self) -> Result<HashMap<String, Balance>> {
        self.simulate_latency().await;
        Ok(self.state.lock().balances.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
