//! Core enums shared across the bluesmart crates.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Connection lifecycle of a remote peripheral.
///
/// The legal transitions are
/// `Disconnected -> Connecting -> Connected -> ServicesDiscovered -> Disconnected`.
/// A device holds an active link token exactly while it is in
/// [`Connected`](ConnectionState::Connected) or
/// [`ServicesDiscovered`](ConnectionState::ServicesDiscovered).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// No link; the device is only known from advertisements.
    #[default]
    Disconnected,
    /// A connection request has been issued and not yet resolved.
    Connecting,
    /// Link is up but the GATT table has not been resolved yet.
    Connected,
    /// Link is up and every registered characteristic has been resolved
    /// (or definitively left unresolved). This is the "ready" state.
    ServicesDiscovered,
}

impl ConnectionState {
    /// Whether this state carries an active link.
    pub fn is_linked(self) -> bool {
        matches!(self, Self::Connected | Self::ServicesDiscovered)
    }
}

/// Write mode for a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum WriteMode {
    /// Defer to the characteristic's configured default.
    #[default]
    Unset,
    /// Write with response (acknowledged).
    Default,
    /// Write without response.
    NoResponse,
    /// Signed write.
    Signed,
}

impl WriteMode {
    /// Resolve `Unset` against a characteristic-level default.
    pub fn or(self, fallback: WriteMode) -> WriteMode {
        match self {
            WriteMode::Unset => fallback,
            other => other,
        }
    }
}

/// Radio scan power mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ScanMode {
    /// Listen only; never initiate scan requests.
    Passive,
    /// Lowest duty cycle, background-friendly.
    LowPower,
    /// Default duty cycle.
    #[default]
    Balanced,
    /// Highest duty cycle, foreground scanning.
    LowLatency,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linked_states() {
        assert!(!ConnectionState::Disconnected.is_linked());
        assert!(!ConnectionState::Connecting.is_linked());
        assert!(ConnectionState::Connected.is_linked());
        assert!(ConnectionState::ServicesDiscovered.is_linked());
    }

    #[test]
    fn write_mode_fallback() {
        assert_eq!(WriteMode::Unset.or(WriteMode::NoResponse), WriteMode::NoResponse);
        assert_eq!(WriteMode::Signed.or(WriteMode::Default), WriteMode::Signed);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::ServicesDiscovered).unwrap();
        assert_eq!(json, "\"services_discovered\"");
    }
}
