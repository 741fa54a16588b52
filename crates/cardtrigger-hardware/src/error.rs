//! Error types for smartcard subsystem operations.
//!
//! Transient and recoverable statuses (timeouts, cancellation, a stopped
//! service) are handled inside the tracker and never reach callers. What is
//! left here are the failures a caller has to act on.

use crate::types::StatusCode;

/// Result type alias for hardware operations.
pub type Result<T> = std::result::Result<T, HardwareError>;

/// Errors that can occur during smartcard operations.
#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    /// The native subsystem returned a status the caller cannot recover from.
    #[error("{operation} failed with status {status}")]
    Native {
        operation: &'static str,
        status: StatusCode,
    },

    /// No card type is registered for the ATR.
    #[error("Unsupported card (ATR {atr})")]
    UnsupportedCard { atr: String },

    /// More than one card type matches the ATR.
    #[error("Ambiguous card (ATR {atr}) matches {card_types:?}")]
    AmbiguousCard { atr: String, card_types: Vec<String> },

    /// The monitor thread panicked and its state was lost.
    #[error("Monitor thread panicked")]
    MonitorPanicked,

    /// A per-card operation failed.
    #[error("Card session error: {message}")]
    CardSession { message: String },

    /// Invalid data received from the card.
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Spawning a monitor thread failed.
    #[error("Failed to spawn monitor thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl HardwareError {
    /// Create a new native status error.
    pub fn native(operation: &'static str, status: StatusCode) -> Self {
        Self::Native { operation, status }
    }

    /// Create a new unsupported card error.
    pub fn unsupported_card(atr: &[u8]) -> Self {
        Self::UnsupportedCard {
            atr: hex::encode_upper(atr),
        }
    }

    /// Create a new ambiguous card error.
    pub fn ambiguous_card(atr: &[u8], card_types: Vec<String>) -> Self {
        Self::AmbiguousCard {
            atr: hex::encode_upper(atr),
            card_types,
        }
    }

    /// Create a new card session error.
    pub fn card_session(message: impl Into<String>) -> Self {
        Self::CardSession {
            message: message.into(),
        }
    }

    /// Create a new invalid data error.
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Native status code carried by this error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Native { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error() {
        let error = HardwareError::native("get_status_change", StatusCode::UNEXPECTED);
        assert_eq!(error.status(), Some(StatusCode::UNEXPECTED));
        assert_eq!(
            error.to_string(),
            "get_status_change failed with status 0x8010001F"
        );
    }

    #[test]
    fn test_unsupported_card_error() {
        let error = HardwareError::unsupported_card(&[0x3B, 0x8F, 0x80]);
        assert!(matches!(error, HardwareError::UnsupportedCard { .. }));
        assert_eq!(error.to_string(), "Unsupported card (ATR 3B8F80)");
        assert_eq!(error.status(), None);
    }

    #[test]
    fn test_ambiguous_card_error() {
        let error =
            HardwareError::ambiguous_card(&[0x3B, 0x01], vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            error.to_string(),
            "Ambiguous card (ATR 3B01) matches [\"A\", \"B\"]"
        );
    }
}
