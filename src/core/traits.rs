//! Core traits - Capability contracts consumed by the engine

use async_trait::async_trait;
use std::collections::HashMap;

use crate::core::{Balance, Order, OrderRequest, Result, Symbol};

/// Exchange connector - the venue capability the engine trades against.
///
/// Every call is network I/O in a real implementation and may time out or be
/// rejected. Callers never assume a retry is idempotent without reading the
/// current order status first.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Submit an order. Rejections surface as `Error::VenueRejected`.
    async fn place_order(&self, request: &OrderRequest) -> Result<Order>;

    /// Request cancellation. `Ok(false)` when the venue refused.
    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<bool>;

    /// Current venue view of an order, `None` if the venue does not know it.
    async fn get_order(&self, order_id: &str, symbol: &Symbol) -> Result<Option<Order>>;

    /// Account balances keyed by asset
    async fn get_balance(&self) -> Result<HashMap<String, Balance>>;

    /// Exchange name
    fn name(&self) -> &str;
}

/// Cancellation of the orders hanging off a parent (brackets, pending exits).
#[async_trait]
pub trait ChildOrders: Send + Sync {
    /// Cancel every active child of `parent_order_id`; returns how many the
    /// venue confirmed.
    async fn cancel_children(&self, parent_order_id: &str) -> Result<usize>;
}
