//! BLE GATT client orchestration.
//!
//! Core building blocks:
//!
//! - [`radio::Radio`]: the platform boundary. Backends issue operations
//!   and report outcomes as events; [`backend::BtleplugRadio`] covers the
//!   system stack and [`mock::MockRadio`] covers tests.
//! - [`device::Device`]: per-peripheral connection state machine,
//!   characteristic table, and event broadcast.
//! - [`intent::Intent`]: an ordered queue of GATT actions run one at a
//!   time on the device's serialized executor.
//! - [`scanner::Scanner`] and [`identifier::Identifier`]: advertisement
//!   classification into typed devices.
//! - [`context::BleContext`]: owns the registry and the event dispatch
//!   loop that ties it all together.
//!
//! ```
//! use std::sync::Arc;
//!
//! use bluesmart_core::context::BleContext;
//! use bluesmart_core::device::Device;
//! use bluesmart_core::identifier::Identifier;
//! use bluesmart_core::mock::MockRadio;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (radio, events) = MockRadio::detached();
//! let context = BleContext::new(radio, events);
//!
//! context.add_identifier(
//!     Identifier::builder(Arc::new(|report, radio| {
//!         Ok(Device::new(report.address.clone(), radio))
//!     }))
//!     .name("Widget")
//!     .build()?,
//! );
//! context.start_scan().await?;
//! # context.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod action;
pub mod backend;
pub mod characteristic;
pub mod context;
pub mod device;
pub mod error;
pub mod identifier;
pub mod intent;
pub mod mock;
pub mod radio;
mod runner;
pub mod scanner;

pub use action::{ActionResult, DeviceCallback, ResultHandler};
pub use characteristic::{Characteristic, NotificationListener};
pub use context::{BleContext, ContextEvent};
pub use device::{Device, DeviceEvent};
pub use error::{Error, Result};
pub use identifier::{DeviceFactory, Identifier, PayloadPredicate};
pub use intent::Intent;
pub use radio::{event_channel, AdvertisementReport, EventSink, Radio, RadioEvent};
pub use scanner::{ScanConfig, Scanner};
