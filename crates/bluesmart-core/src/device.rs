//! Per-device connection state machine and event fan-out.
//!
//! A [`Device`] tracks one peripheral through the connection lifecycle
//! (`Disconnected → Connecting → Connected → ServicesDiscovered`), owns the
//! characteristics declared for it, and re-broadcasts everything the radio
//! reports about it as [`DeviceEvent`]s. State only changes on the event
//! path, driven by [`crate::context::BleContext`]; actions and application
//! code observe it through [`Device::subscribe`] and the state accessors.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::error::{Error, Result};
use crate::intent::Intent;
use crate::radio::{
    AdvertisementReport, ConnectionToken, GattService, GattStatus, Radio, RadioEvent,
};
use crate::runner::ActionRunner;
use bluesmart_types::ConnectionState;

/// Broadcast capacity per device. Slow subscribers lag rather than block
/// the event path.
const EVENT_CAPACITY: usize = 64;

/// Events re-broadcast by a device to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    /// The link came up. Services are not yet discovered.
    Connected,
    /// A connection attempt failed before the link came up.
    ConnectionFailed,
    /// The link went down. Characteristic handles and notification
    /// listeners were already invalidated when this is observed.
    Disconnected,
    /// Service discovery finished and declared characteristics were
    /// re-resolved. The device is now ready.
    ServicesDiscovered,
    /// Service discovery failed. The device tears the link down rather
    /// than staying half-initialized; `Disconnected` follows.
    DiscoveryFailed,
    /// A characteristic read resolved.
    Read {
        handle: u64,
        success: bool,
        bonding_required: bool,
        value: Vec<u8>,
    },
    /// A characteristic write resolved.
    Written {
        handle: u64,
        success: bool,
        bonding_required: bool,
    },
    /// A descriptor write resolved.
    DescriptorWritten {
        handle: u64,
        success: bool,
        bonding_required: bool,
    },
    /// A notification or indication arrived.
    Notification { handle: u64, value: Vec<u8> },
    /// An advertisement was seen for this device.
    Advertisement { rssi: i16 },
    /// A beacon frame was seen for this device.
    Beacon { rssi: i16 },
}

fn flags(status: GattStatus) -> (bool, bool) {
    match status {
        GattStatus::Success => (true, false),
        GattStatus::Failure => (false, false),
        GattStatus::InsufficientSecurity => (false, true),
    }
}

struct LinkState {
    state: ConnectionState,
    connection: Option<ConnectionToken>,
}

struct Presence {
    name: Option<String>,
    rssi: i16,
    last_seen: Instant,
}

/// One tracked peripheral.
///
/// Constructed by a [`crate::identifier::Identifier`] factory during
/// classification or injected directly through the context. Shared as
/// `Arc<Device>`.
pub struct Device {
    address: String,
    radio: Arc<dyn Radio>,
    link: Mutex<LinkState>,
    presence: Mutex<Presence>,
    characteristics: Mutex<Vec<Arc<Characteristic>>>,
    events: broadcast::Sender<DeviceEvent>,
    runner: ActionRunner,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Create a device for `address`, issuing its operations through `radio`.
    pub fn new(address: impl Into<String>, radio: Arc<dyn Radio>) -> Arc<Self> {
        Self::with_idle_timeout(address, radio, None)
    }

    /// Create a device whose action executor disconnects the link and parks
    /// itself after sitting idle for `idle_timeout`.
    pub fn with_idle_timeout(
        address: impl Into<String>,
        radio: Arc<dyn Radio>,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            address: address.into(),
            radio,
            link: Mutex::new(LinkState {
                state: ConnectionState::Disconnected,
                connection: None,
            }),
            presence: Mutex::new(Presence {
                name: None,
                rssi: i16::MIN,
                last_seen: Instant::now(),
            }),
            characteristics: Mutex::new(Vec::new()),
            events,
            runner: ActionRunner::new(idle_timeout),
        })
    }

    /// The peripheral address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The last advertised or assigned name.
    pub fn name(&self) -> Option<String> {
        self.presence.lock().unwrap().name.clone()
    }

    /// Assign a name, normally from a bonded-name lookup.
    pub fn set_name(&self, name: impl Into<String>) {
        self.presence.lock().unwrap().name = Some(name.into());
    }

    /// Signal strength from the most recent advertisement, in dBm.
    pub fn rssi(&self) -> i16 {
        self.presence.lock().unwrap().rssi
    }

    /// When this device was last seen on the air.
    pub fn last_seen(&self) -> Instant {
        self.presence.lock().unwrap().last_seen
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.link.lock().unwrap().state
    }

    /// Whether a link is up, ready or not.
    pub fn is_linked(&self) -> bool {
        self.state().is_linked()
    }

    /// Whether the device can serve GATT operations: connected with services
    /// discovered.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::ServicesDiscovered
    }

    /// Token of the live connection, if any.
    pub fn connection(&self) -> Option<ConnectionToken> {
        self.link.lock().unwrap().connection
    }

    pub(crate) fn radio(&self) -> &Arc<dyn Radio> {
        &self.radio
    }

    /// Subscribe to this device's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Declare the characteristics this device exposes.
    ///
    /// Only legal while disconnected; the set must be stable across a
    /// connection so discovery can resolve it.
    pub fn register_characteristics(
        &self,
        characteristics: Vec<Arc<Characteristic>>,
    ) -> Result<()> {
        if self.is_linked() {
            return Err(Error::invalid_state(
                "characteristics cannot change while connected",
            ));
        }
        *self.characteristics.lock().unwrap() = characteristics;
        Ok(())
    }

    /// Look up a declared characteristic by service and characteristic UUID.
    pub fn characteristic(&self, service: Uuid, uuid: Uuid) -> Option<Arc<Characteristic>> {
        self.characteristics
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.service_uuid() == service && c.uuid() == uuid)
            .cloned()
    }

    /// Declared characteristics, in registration order.
    pub fn characteristics(&self) -> Vec<Arc<Characteristic>> {
        self.characteristics.lock().unwrap().clone()
    }

    fn characteristic_by_handle(&self, id: u64) -> Option<Arc<Characteristic>> {
        self.characteristics
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.matches_handle(id))
            .cloned()
    }

    /// Queue an intent on this device's serialized executor.
    ///
    /// Queues run one at a time in submission order; within a queue, a
    /// failed action aborts the remainder unless its handler elects to
    /// continue.
    pub fn enqueue(self: &Arc<Self>, intent: Intent) {
        self.runner.submit(Arc::clone(self), intent);
    }

    /// Number of queues waiting on (or running in) the executor.
    pub fn pending_queues(&self) -> usize {
        self.runner.pending()
    }

    /// Ask the radio to tear down the link. The state change arrives later
    /// through the event path.
    pub async fn disconnect(&self) -> Result<()> {
        self.radio.disconnect(&self.address).await
    }

    /// Fold an advertisement report into presence state and notify
    /// subscribers.
    pub(crate) fn update_advertisement(&self, report: &AdvertisementReport) {
        {
            let mut presence = self.presence.lock().unwrap();
            if let Some(name) = &report.local_name {
                presence.name = Some(name.clone());
            }
            presence.rssi = report.rssi;
            presence.last_seen = Instant::now();
        }
        self.emit(DeviceEvent::Advertisement { rssi: report.rssi });
    }

    /// Record a beacon sighting and notify subscribers.
    pub(crate) fn on_beacon(&self, rssi: i16) {
        {
            let mut presence = self.presence.lock().unwrap();
            presence.rssi = rssi;
            presence.last_seen = Instant::now();
        }
        self.emit(DeviceEvent::Beacon { rssi });
    }

    pub(crate) fn mark_connecting(&self) {
        self.link.lock().unwrap().state = ConnectionState::Connecting;
    }

    pub(crate) fn mark_disconnected(&self) {
        let mut link = self.link.lock().unwrap();
        link.state = ConnectionState::Disconnected;
        link.connection = None;
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is normal between actions.
        let _ = self.events.send(event);
    }

    /// Apply one radio event for this device.
    ///
    /// Invariant: internal state is fully updated before the matching
    /// [`DeviceEvent`] is broadcast, so any subscriber that observes the
    /// event observes consistent state.
    pub(crate) async fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::Connected { connection, .. } => {
                {
                    let mut link = self.link.lock().unwrap();
                    link.state = ConnectionState::Connected;
                    link.connection = Some(connection);
                }
                debug!(address = %self.address, connection, "link up");
                self.emit(DeviceEvent::Connected);
                // Discovery starts immediately; the device is not usable
                // until it completes.
                if let Err(err) = self.radio.discover_services(&self.address).await {
                    warn!(address = %self.address, error = %err, "discovery request failed");
                    self.fail_discovery().await;
                }
            }
            RadioEvent::ConnectionFailed { .. } => {
                self.mark_disconnected();
                debug!(address = %self.address, "connection failed");
                self.emit(DeviceEvent::ConnectionFailed);
            }
            RadioEvent::Disconnected { .. } => {
                self.invalidate();
                debug!(address = %self.address, "link down");
                self.emit(DeviceEvent::Disconnected);
            }
            RadioEvent::ServicesDiscovered { services, .. } => {
                // Discovery runs detached in the backend and can complete
                // after the link dropped; a dead link must not come back
                // ready.
                if self.state() != ConnectionState::Connected {
                    debug!(address = %self.address, "discovery result for a dead link ignored");
                    return;
                }
                self.resolve_characteristics(&services);
                self.link.lock().unwrap().state = ConnectionState::ServicesDiscovered;
                debug!(address = %self.address, services = services.len(), "ready");
                self.emit(DeviceEvent::ServicesDiscovered);
            }
            RadioEvent::DiscoveryFailed { .. } => {
                warn!(address = %self.address, "service discovery failed");
                self.fail_discovery().await;
            }
            RadioEvent::CharacteristicRead {
                handle,
                status,
                value,
                ..
            } => {
                let (success, bonding_required) = flags(status);
                if success {
                    if let Some(characteristic) = self.characteristic_by_handle(handle) {
                        characteristic.set_value(&value);
                    }
                }
                self.emit(DeviceEvent::Read {
                    handle,
                    success,
                    bonding_required,
                    value,
                });
            }
            RadioEvent::CharacteristicWritten { handle, status, .. } => {
                let (success, bonding_required) = flags(status);
                self.emit(DeviceEvent::Written {
                    handle,
                    success,
                    bonding_required,
                });
            }
            RadioEvent::DescriptorWritten { handle, status, .. } => {
                let (success, bonding_required) = flags(status);
                self.emit(DeviceEvent::DescriptorWritten {
                    handle,
                    success,
                    bonding_required,
                });
            }
            RadioEvent::CharacteristicChanged { handle, value, .. } => {
                if let Some(characteristic) = self.characteristic_by_handle(handle) {
                    characteristic.notify(&value);
                } else {
                    debug!(address = %self.address, handle, "notification for unresolved handle");
                }
                self.emit(DeviceEvent::Notification { handle, value });
            }
            RadioEvent::ScanReport(_) => {}
        }
    }

    /// A device that cannot discover services is unusable; tear the link
    /// down instead of staying half-initialized. `Disconnected` arrives
    /// through the event path once the radio confirms.
    async fn fail_discovery(&self) {
        self.emit(DeviceEvent::DiscoveryFailed);
        if let Err(err) = self.disconnect().await {
            warn!(address = %self.address, error = %err, "teardown after failed discovery");
            self.invalidate();
            self.emit(DeviceEvent::Disconnected);
        }
    }

    /// Tear down connection-scoped state. Handles and listeners are gone
    /// before any subscriber can observe `Disconnected`.
    fn invalidate(&self) {
        for characteristic in self.characteristics.lock().unwrap().iter() {
            characteristic.reset();
            characteristic.clear_listeners();
        }
        let mut link = self.link.lock().unwrap();
        link.state = ConnectionState::Disconnected;
        link.connection = None;
    }

    /// Match declared characteristics against the discovered GATT table.
    ///
    /// The declared service is tried first; if the peripheral moved the
    /// characteristic (or advertised it under a different service), any
    /// service with a matching characteristic UUID is accepted.
    fn resolve_characteristics(&self, services: &[GattService]) {
        for characteristic in self.characteristics.lock().unwrap().iter() {
            let declared = services
                .iter()
                .find(|s| s.uuid == characteristic.service_uuid())
                .and_then(|s| {
                    s.characteristics
                        .iter()
                        .find(|h| h.uuid == characteristic.uuid())
                });
            let found = declared.or_else(|| {
                services
                    .iter()
                    .flat_map(|s| s.characteristics.iter())
                    .find(|h| h.uuid == characteristic.uuid())
            });
            match found {
                Some(handle) => characteristic.resolve(handle.clone()),
                None => {
                    debug!(
                        address = %self.address,
                        uuid = %characteristic.uuid(),
                        "characteristic absent from discovered services"
                    );
                    characteristic.reset();
                }
            }
        }
    }
}
