//! Events - Typed messages exchanged over the bus
//!
//! Every component talks to the others through these events. Payloads are
//! decoded once into their own structs; subscribers match on `EventKind`.

pub mod bus;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{OrderType, Side, Symbol};
use crate::emergency::CloseReport;
use crate::execution::OrderRole;
use crate::portfolio::Position;

pub use bus::EventBus;

/// Subscription key, one per `EventKind` variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SignalGenerated,
    PriceUpdate,
    OrderPlaced,
    OrderFilled,
    OrderCancelled,
    OrderRejected,
    AdmissionDenied,
    PositionOpened,
    PositionClosed,
    RiskAlert,
    EmergencyStop,
    SystemError,
}

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    SignalGenerated(TradeIntent),
    PriceUpdate(PriceTick),
    OrderPlaced(OrderPlaced),
    OrderFilled(OrderFilled),
    OrderCancelled(OrderCancelled),
    OrderRejected(OrderRejected),
    AdmissionDenied(AdmissionDenied),
    PositionOpened(Position),
    PositionClosed(PositionClosed),
    RiskAlert(RiskAlert),
    EmergencyStop(CloseReport),
    SystemError(SystemError),
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::SignalGenerated(_) => EventType::SignalGenerated,
            EventKind::PriceUpdate(_) => EventType::PriceUpdate,
            EventKind::OrderPlaced(_) => EventType::OrderPlaced,
            EventKind::OrderFilled(_) => EventType::OrderFilled,
            EventKind::OrderCancelled(_) => EventType::OrderCancelled,
            EventKind::OrderRejected(_) => EventType::OrderRejected,
            EventKind::AdmissionDenied(_) => EventType::AdmissionDenied,
            EventKind::PositionOpened(_) => EventType::PositionOpened,
            EventKind::PositionClosed(_) => EventType::PositionClosed,
            EventKind::RiskAlert(_) => EventType::RiskAlert,
            EventKind::EmergencyStop(_) => EventType::EmergencyStop,
            EventKind::SystemError(_) => EventType::SystemError,
        }
    }
}

/// Immutable event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl Event {
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}

/// Trading intent produced by a signal source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: Symbol,
    pub side: Side,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Suggested size; the engine sizes from risk when absent
    pub quantity: Option<Decimal>,
    /// Market price the intent was formed at
    pub reference_price: Decimal,
    /// Rest a limit order at this price instead of trading at market
    pub limit_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub strategy: String,
}

/// Last traded / mark price for a symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub strategy: String,
    pub role: OrderRole,
    pub parent_order_id: Option<String>,
    pub retry_count: u32,
    /// Caller-assigned id that survives resubmission and amendment
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFilled {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub strategy: String,
    pub role: OrderRole,
    pub parent_order_id: Option<String>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Caller asked for it
    Requested,
    /// Venue cancelled on its own
    Venue,
    /// Expiry elapsed while active
    Expired,
    /// Cancel-and-replace
    Replaced,
    /// The other leg of the bracket filled
    SiblingFilled,
    /// The parent's position is being closed
    PositionClosing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: String,
    pub symbol: Symbol,
    pub reason: CancelReason,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Order abandoned after exhausting its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRejected {
    pub order_id: String,
    pub symbol: Symbol,
    pub strategy: String,
    pub retries: u32,
    pub reason: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionDenied {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub strategy: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionClosed {
    pub position: Position,
    pub close_price: Decimal,
    pub pnl: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighDrawdown,
    HighDailyLoss,
    CriticalRiskScore,
    TooManyPositions,
    LargePositionLoss,
    StopLossHit,
    /// A hard limit was crossed and intake is halted
    LimitBreached,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAlert {
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub symbol: Option<Symbol>,
}

impl RiskAlert {
    pub fn is_critical(&self) -> bool {
        self.level == AlertLevel::Critical
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemError {
    pub component: String,
    pub message: String,
    /// Critical errors trigger the emergency unwind
    pub critical: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::new(
            "test",
            EventKind::PriceUpdate(PriceTick {
                symbol: Symbol::new("btcusdt"),
                price: Decimal::from(45_000),
            }),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["data"]["symbol"], "BTCUSDT");
        assert_eq!(json["source"], "test");
        assert_eq!(event.event_type(), EventType::PriceUpdate);
    }
}
