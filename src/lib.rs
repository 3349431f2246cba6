//! AlephGate - Core Library
//! Order-lifecycle and risk-admission engine

// Public modules
pub mod config;
pub mod core;
pub mod emergency;
pub mod engine;
pub mod events;
pub mod exchanges;
pub mod execution;
pub mod portfolio;
pub mod risk;

// Re-exports
pub use config::Config;
pub use core::{Error, Result};
pub use emergency::{CloseReport, EmergencyCloser};
pub use engine::Engine;
pub use events::{Event, EventBus, EventKind, EventType};
pub use execution::{OrderManager, OrderSpec};
pub use portfolio::{Portfolio, Position};
pub use risk::{RiskGate, RiskMonitor};
