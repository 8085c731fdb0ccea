//! The platform radio boundary.
//!
//! Everything below the orchestration layer (the OS Bluetooth stack, a
//! vendor driver, or a test double) is reached through the [`Radio`] trait.
//! Calls on the trait only *issue* operations; outcomes arrive later as
//! [`RadioEvent`]s pushed through the [`EventSink`] the backend was
//! constructed with. [`crate::context::BleContext`] owns the receiving end
//! and routes each event to the device or scanner it belongs to.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use bluesmart_types::{ScanMode, WriteMode};

/// Opaque token identifying one established link.
///
/// A fresh token is minted for every successful connect; tokens are never
/// reused across reconnects.
pub type ConnectionToken = u64;

/// A characteristic as resolved by the backend during service discovery.
///
/// The `id` is the backend's identity for the attribute and is what
/// notification routing keys on; two characteristics may share a UUID
/// across services but never an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Backend-assigned attribute identity, unique within a connection.
    pub id: u64,
    /// UUID of the service containing this characteristic.
    pub service: Uuid,
    /// UUID of the characteristic itself.
    pub uuid: Uuid,
}

/// One GATT service and its characteristics, as reported by discovery.
#[derive(Debug, Clone)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics exposed by this service.
    pub characteristics: Vec<CharacteristicHandle>,
}

/// Status reported by the backend for a GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    /// The operation completed.
    Success,
    /// The operation failed for a generic reason.
    Failure,
    /// The peripheral rejected the operation for lack of
    /// authentication/encryption; a bonding flow may recover this.
    InsufficientSecurity,
}

/// One raw advertisement report from the scan session.
#[derive(Debug, Clone)]
pub struct AdvertisementReport {
    /// Peripheral address (or platform identifier where addresses are hidden).
    pub address: String,
    /// Advertised or bonded name, if any.
    pub local_name: Option<String>,
    /// Raw advertisement payload bytes.
    pub payload: Vec<u8>,
    /// Service UUIDs carried in the advertisement.
    pub service_uuids: Vec<Uuid>,
    /// Signal strength in dBm.
    pub rssi: i16,
}

/// Asynchronous events delivered by a radio backend.
///
/// Characteristic events carry the backend's attribute id (see
/// [`CharacteristicHandle::id`]) so listeners can filter on identity rather
/// than UUID.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// A link came up.
    Connected {
        address: String,
        connection: ConnectionToken,
    },
    /// A link went down, whether requested or lost.
    Disconnected { address: String },
    /// A connection attempt failed before the link came up.
    ConnectionFailed { address: String },
    /// Service discovery finished for a connected peripheral.
    ServicesDiscovered {
        address: String,
        services: Vec<GattService>,
    },
    /// Service discovery failed.
    DiscoveryFailed { address: String },
    /// A characteristic read resolved.
    CharacteristicRead {
        address: String,
        handle: u64,
        status: GattStatus,
        value: Vec<u8>,
    },
    /// A characteristic write resolved.
    CharacteristicWritten {
        address: String,
        handle: u64,
        status: GattStatus,
    },
    /// A descriptor write resolved.
    DescriptorWritten {
        address: String,
        handle: u64,
        status: GattStatus,
    },
    /// Unsolicited notification or indication.
    CharacteristicChanged {
        address: String,
        handle: u64,
        value: Vec<u8>,
    },
    /// A scan report arrived.
    ScanReport(AdvertisementReport),
}

impl RadioEvent {
    /// The peripheral address this event concerns, if it is device-scoped.
    pub fn address(&self) -> Option<&str> {
        match self {
            RadioEvent::Connected { address, .. }
            | RadioEvent::Disconnected { address }
            | RadioEvent::ConnectionFailed { address }
            | RadioEvent::ServicesDiscovered { address, .. }
            | RadioEvent::DiscoveryFailed { address }
            | RadioEvent::CharacteristicRead { address, .. }
            | RadioEvent::CharacteristicWritten { address, .. }
            | RadioEvent::DescriptorWritten { address, .. }
            | RadioEvent::CharacteristicChanged { address, .. } => Some(address),
            RadioEvent::ScanReport(_) => None,
        }
    }
}

/// The sink a backend delivers its events into.
///
/// Cloneable; backends hold one and call [`EventSink::deliver`] from
/// whatever context their platform callbacks run on.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RadioEvent>,
}

impl EventSink {
    /// Deliver an event. Silently dropped if the owning context is gone.
    pub fn deliver(&self, event: RadioEvent) {
        let _ = self.tx.send(event);
    }
}

/// Create the event channel a backend and a [`crate::context::BleContext`]
/// share.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<RadioEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

/// The platform Bluetooth collaborator.
///
/// Every method issues an operation and returns once the backend has
/// accepted it; completion is reported through the backend's [`EventSink`].
/// Backends must tolerate operations against addresses they no longer track
/// by reporting the matching failure event rather than panicking.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Initiate a connection to a peripheral.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Tear down the link to a peripheral.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Start service discovery on a connected peripheral.
    async fn discover_services(&self, address: &str) -> Result<()>;

    /// Issue a characteristic read.
    async fn read_characteristic(&self, address: &str, handle: &CharacteristicHandle)
        -> Result<()>;

    /// Issue a characteristic write.
    async fn write_characteristic(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Issue a descriptor write on a characteristic.
    async fn write_descriptor(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()>;

    /// Toggle platform-level notification delivery for a characteristic.
    async fn set_characteristic_notification(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
        enable: bool,
    ) -> Result<()>;

    /// Start the scan session.
    async fn start_scan(&self, mode: ScanMode, report_delay: Duration) -> Result<()>;

    /// Stop the scan session.
    async fn stop_scan(&self) -> Result<()>;
}
