//! Error handling - One hierarchy for ledger, admission and venue failures

use rust_decimal::Decimal;
use thiserror::Error;

use crate::risk::Denial;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pre-trade risk check refused the position
    #[error("Admission denied: {0}")]
    AdmissionDenied(#[from] Denial),

    /// Not enough free quote balance to lock the notional
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    /// Position id is not in the ledger
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// Position id is already in the ledger
    #[error("Duplicate position: {0}")]
    DuplicatePosition(String),

    /// Negative or otherwise unusable amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Venue refused the submission
    #[error("Venue rejected: {0}")]
    VenueRejected(String),

    /// Venue call did not answer in time; outcome unknown
    #[error("Venue timeout: {0}")]
    VenueTimeout(String),

    /// Transient venue I/O failure
    #[error("Venue error: {0}")]
    Venue(String),

    /// Order id is not tracked
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// An emergency sweep is already running
    #[error("Emergency close already in progress")]
    EmergencyInProgress,

    /// Hard risk limit crossed; new admissions are halted
    #[error("Critical risk breach: {0}")]
    CriticalRiskBreach(String),

    /// Event bus no longer accepts events
    #[error("Event bus stopped")]
    BusStopped,

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Timeouts and transient I/O leave the remote state unknown.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::VenueTimeout(_) | Error::Venue(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unknown_outcomes_are_transient() {
        assert!(Error::VenueTimeout("get_order".into()).is_transient());
        assert!(Error::Venue("connection reset".into()).is_transient());
        assert!(!Error::VenueRejected("bad size".into()).is_transient());
        assert!(!Error::EmergencyInProgress.is_transient());
    }
}
