//! Platform-agnostic types for the bluesmart BLE orchestration library.
//!
//! This crate provides the leaf types shared between the core library and
//! anything embedding it:
//!
//! - connection lifecycle, write-mode, and scan-mode enums
//! - Bluetooth UUID constants and short-literal expansion
//!
//! # Example
//!
//! ```
//! use bluesmart_types::{uuid::expand, ConnectionState, WriteMode};
//!
//! let battery_service = expand("180f").unwrap();
//! assert!(ConnectionState::ServicesDiscovered.is_linked());
//! assert_eq!(WriteMode::Unset.or(WriteMode::NoResponse), WriteMode::NoResponse);
//! let _ = battery_service;
//! ```

pub mod error;
pub mod types;
pub mod uuid;

pub use error::UuidError;
pub use types::{ConnectionState, ScanMode, WriteMode};
