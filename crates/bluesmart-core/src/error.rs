//! Error types for bluesmart-core.
//!
//! These are the API-level failures: bad preconditions, missing adapters,
//! malformed configuration. Per-action outcomes are deliberately *not*
//! errors: an action's failure is a value ([`crate::action::ActionResult`])
//! handed to its result handler, and never propagates as `Err` out of the
//! runner.

use thiserror::Error;

/// Errors surfaced by the bluesmart API.
///
/// Marked `#[non_exhaustive]` so new variants can be added without breaking
/// downstream matches.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth stack error from the btleplug backend.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is available.
    #[error("no Bluetooth adapter available")]
    NoAdapter,

    /// Operation attempted against an address the backend does not track.
    #[error("unknown device: {address}")]
    UnknownDevice {
        /// The address that was not found.
        address: String,
    },

    /// Operation attempted while the device has no active link.
    #[error("not connected to device")]
    NotConnected,

    /// Operation attempted against a characteristic with no resolved handle.
    #[error("characteristic {uuid} not resolved on this connection")]
    CharacteristicNotResolved {
        /// The characteristic UUID.
        uuid: String,
    },

    /// The device is in a state that forbids the requested mutation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A UUID literal could not be expanded.
    #[error(transparent)]
    Uuid(#[from] bluesmart_types::UuidError),

    /// Invalid configuration provided.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create an unknown-device error.
    pub fn unknown_device(address: impl Into<String>) -> Self {
        Self::UnknownDevice {
            address: address.into(),
        }
    }

    /// Create an unresolved-characteristic error.
    pub fn unresolved(uuid: impl ToString) -> Self {
        Self::CharacteristicNotResolved {
            uuid: uuid.to_string(),
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

/// Result type alias using bluesmart-core's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = Error::unknown_device("AA:BB:CC:DD:EE:FF");
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));

        let err = Error::NotConnected;
        assert_eq!(err.to_string(), "not connected to device");

        let err = Error::unresolved("0000feed-0000-1000-8000-00805f9b34fb");
        assert!(err.to_string().contains("feed"));
    }

    #[test]
    fn uuid_error_converts() {
        let err: Error = bluesmart_types::UuidError::BadLength(3).into();
        assert!(matches!(err, Error::Uuid(_)));
    }
}
