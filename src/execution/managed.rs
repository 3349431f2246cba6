//! Managed orders - venue order plus local lifecycle metadata

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::{Order, OrderRequest, OrderStatus, OrderType, Side, Symbol};

/// What an order is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    /// Opens a position
    Entry,
    /// Bracket child protecting the position
    StopLoss,
    /// Bracket child taking profit
    TakeProfit,
    /// Closes a position outright
    Exit,
}

impl OrderRole {
    pub fn is_bracket(self) -> bool {
        matches!(self, OrderRole::StopLoss | OrderRole::TakeProfit)
    }

    /// Whether a fill of this role closes the parent's position.
    pub fn closes_position(self) -> bool {
        !matches!(self, OrderRole::Entry)
    }
}

/// Everything needed to (re)submit an order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub strategy: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub expire_after: Option<Duration>,
    pub role: OrderRole,
    pub parent_order_id: Option<String>,
    /// Stable across resubmission and amendment, unlike the venue id
    pub client_id: Option<String>,
}

impl OrderSpec {
    pub fn market(symbol: Symbol, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            strategy: String::new(),
            stop_loss: None,
            take_profit: None,
            expire_after: None,
            role: OrderRole::Entry,
            parent_order_id: None,
            client_id: None,
        }
    }

    pub fn limit(symbol: Symbol, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = strategy.into();
        self
    }

    pub fn with_brackets(
        mut self,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_expiry(mut self, expire_after: Duration) -> Self {
        self.expire_after = Some(expire_after);
        self
    }

    pub fn has_brackets(&self) -> bool {
        self.stop_loss.is_some() || self.take_profit.is_some()
    }

    /// Bracket child for a filled entry.
    pub fn bracket(
        &self,
        role: OrderRole,
        price: Decimal,
        quantity: Decimal,
        parent_id: &str,
    ) -> Self {
        let order_type = match role {
            OrderRole::TakeProfit => OrderType::TakeProfit,
            _ => OrderType::StopLoss,
        };
        Self {
            symbol: self.symbol.clone(),
            side: self.side.opposite(),
            order_type,
            quantity,
            price: Some(price),
            strategy: self.strategy.clone(),
            stop_loss: None,
            take_profit: None,
            expire_after: None,
            role,
            parent_order_id: Some(parent_id.to_string()),
            client_id: None,
        }
    }

    pub fn request(&self) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            quantity: self.quantity,
            price: self.price,
        }
    }
}

/// Order tracked by the lifecycle manager
#[derive(Debug, Clone)]
pub struct ManagedOrder {
    pub order: Order,
    pub spec: OrderSpec,
    pub retry_count: u32,
    pub max_retries: u32,
    pub placed_at: Instant,
    pub expires_at: Option<Instant>,
    /// Fills observed after this no longer arm brackets
    pub bracket_deadline: Instant,
}

impl ManagedOrder {
    pub fn id(&self) -> &str {
        &self.order.id
    }

    pub fn status(&self) -> OrderStatus {
        self.order.status
    }

    pub fn role(&self) -> OrderRole {
        self.spec.role
    }

    pub fn parent_order_id(&self) -> Option<&str> {
        self.spec.parent_order_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.order.status.is_active()
    }

    /// Quantity not filled yet
    pub fn remaining(&self) -> Decimal {
        (self.order.quantity - self.order.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Copy the venue's view; true when anything changed.
    pub(crate) fn absorb(&mut self, remote: &Order) -> bool {
        let changed = remote.status != self.order.status
            || remote.filled_quantity != self.order.filled_quantity;
        if changed {
            self.order.status = remote.status;
            self.order.filled_quantity = remote.filled_quantity;
            self.order.filled_price = remote.filled_price.or(self.order.filled_price);
            self.order.updated_at = remote.updated_at;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_children_take_the_other_side() {
        let entry = OrderSpec::market(Symbol::new("BTCUSDT"), Side::Buy, Decimal::ONE)
            .with_strategy("trend")
            .with_client_id("intent-1")
            .with_brackets(Some(Decimal::from(95)), Some(Decimal::from(110)));
        assert!(entry.has_brackets());

        let stop = entry.bracket(OrderRole::StopLoss, Decimal::from(95), Decimal::ONE, "parent");
        assert_eq!(stop.side, Side::Sell);
        assert_eq!(stop.order_type, OrderType::StopLoss);
        assert_eq!(stop.parent_order_id.as_deref(), Some("parent"));
        assert_eq!(stop.strategy, "trend");
        assert!(!stop.has_brackets());
        assert_eq!(stop.client_id, None);

        let tp = entry.bracket(OrderRole::TakeProfit, Decimal::from(110), Decimal::ONE, "parent");
        assert_eq!(tp.order_type, OrderType::TakeProfit);
        assert_eq!(tp.request().price, Some(Decimal::from(110)));
    }

    #[test]
    fn test_roles() {
        assert!(OrderRole::StopLoss.is_bracket());
        assert!(!OrderRole::Exit.is_bracket());
        assert!(OrderRole::Exit.closes_position());
        assert!(!OrderRole::Entry.closes_position());
    }
}
