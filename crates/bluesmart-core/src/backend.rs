//! btleplug-backed radio.
//!
//! [`BtleplugRadio`] adapts the platform Bluetooth stack to the [`Radio`]
//! boundary. btleplug completes GATT calls inline, so each operation is
//! spawned and its outcome re-delivered through the event sink; attribute
//! ids are minted during service discovery and mapped back to platform
//! characteristics on use.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic as PlatformCharacteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::radio::{
    AdvertisementReport, CharacteristicHandle, EventSink, GattService, GattStatus, Radio,
    RadioEvent,
};
use bluesmart_types::{ScanMode, WriteMode};

#[derive(Default)]
struct BackendState {
    peripherals: HashMap<String, Peripheral>,
    attributes: HashMap<u64, PlatformCharacteristic>,
    notification_ids: HashMap<String, HashMap<Uuid, u64>>,
    connected: HashSet<String>,
    pumping: HashSet<String>,
}

struct Shared {
    sink: EventSink,
    state: Mutex<BackendState>,
    next_attribute: AtomicU64,
}

/// [`Radio`] implementation over the system Bluetooth stack.
pub struct BtleplugRadio {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl BtleplugRadio {
    /// Open the first available adapter and start forwarding its events
    /// into `sink`.
    pub async fn new(sink: EventSink) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::NoAdapter)?;
        let shared = Arc::new(Shared {
            sink,
            state: Mutex::new(BackendState::default()),
            next_attribute: AtomicU64::new(1),
        });

        let mut events = adapter.events().await?;
        let pump_adapter = adapter.clone();
        let pump_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                pump_central_event(&pump_adapter, &pump_shared, event).await;
            }
            debug!("adapter event stream ended");
        });

        Ok(Self { adapter, shared })
    }

    /// Locate the platform peripheral for `address`, caching it.
    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self
            .shared
            .state
            .lock()
            .unwrap()
            .peripherals
            .get(address)
            .cloned()
        {
            return Ok(peripheral);
        }
        for peripheral in self.adapter.peripherals().await? {
            if let Ok(Some(properties)) = peripheral.properties().await {
                if properties.address.to_string() == address {
                    self.shared
                        .state
                        .lock()
                        .unwrap()
                        .peripherals
                        .insert(address.to_string(), peripheral.clone());
                    return Ok(peripheral);
                }
            }
        }
        Err(Error::unknown_device(address))
    }

    /// GATT traffic requires a live link; a dropped one fails here rather
    /// than inside btleplug with a platform-specific error.
    fn ensure_connected(&self, address: &str) -> Result<()> {
        if self.shared.state.lock().unwrap().connected.contains(address) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn attribute(&self, handle: &CharacteristicHandle) -> Result<PlatformCharacteristic> {
        self.shared
            .state
            .lock()
            .unwrap()
            .attributes
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::unresolved(handle.uuid))
    }
}

async fn pump_central_event(adapter: &Adapter, shared: &Arc<Shared>, event: CentralEvent) {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            let Ok(peripheral) = adapter.peripheral(&id).await else {
                return;
            };
            let Ok(Some(properties)) = peripheral.properties().await else {
                return;
            };
            let address = properties.address.to_string();
            shared
                .state
                .lock()
                .unwrap()
                .peripherals
                .insert(address.clone(), peripheral);

            let mut payload = Vec::new();
            for (company, data) in &properties.manufacturer_data {
                payload.extend_from_slice(&company.to_le_bytes());
                payload.extend_from_slice(data);
            }
            shared.sink.deliver(RadioEvent::ScanReport(AdvertisementReport {
                address,
                local_name: properties.local_name,
                payload,
                service_uuids: properties.services,
                rssi: properties.rssi.unwrap_or(i16::MIN),
            }));
        }
        CentralEvent::DeviceDisconnected(id) => {
            let Ok(peripheral) = adapter.peripheral(&id).await else {
                return;
            };
            let Ok(Some(properties)) = peripheral.properties().await else {
                return;
            };
            let address = properties.address.to_string();
            // Requested disconnects already reported; only forward losses.
            let was_connected = shared.state.lock().unwrap().connected.remove(&address);
            if was_connected {
                shared.sink.deliver(RadioEvent::Disconnected { address });
            }
        }
        _ => {}
    }
}

/// Forward the peripheral's notification stream until it ends.
async fn pump_notifications(shared: Arc<Shared>, peripheral: Peripheral, address: String) {
    let mut stream = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%address, error = %err, "notification stream unavailable");
            shared.state.lock().unwrap().pumping.remove(&address);
            return;
        }
    };
    while let Some(notification) = stream.next().await {
        // The platform reports notifications by UUID; map back to the id
        // assigned at discovery.
        let id = shared
            .state
            .lock()
            .unwrap()
            .notification_ids
            .get(&address)
            .and_then(|ids| ids.get(&notification.uuid))
            .copied();
        match id {
            Some(handle) => shared.sink.deliver(RadioEvent::CharacteristicChanged {
                address: address.clone(),
                handle,
                value: notification.value,
            }),
            None => {
                debug!(%address, uuid = %notification.uuid, "notification before discovery");
            }
        }
    }
    shared.state.lock().unwrap().pumping.remove(&address);
}

fn write_type(mode: WriteMode) -> WriteType {
    match mode {
        WriteMode::NoResponse => WriteType::WithoutResponse,
        _ => WriteType::WithResponse,
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = match self.peripheral(address).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                self.shared.sink.deliver(RadioEvent::ConnectionFailed {
                    address: address.to_string(),
                });
                return Err(err);
            }
        };
        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    let start_pump = {
                        let mut state = shared.state.lock().unwrap();
                        state.connected.insert(address.clone());
                        state.pumping.insert(address.clone())
                    };
                    if start_pump {
                        tokio::spawn(pump_notifications(
                            Arc::clone(&shared),
                            peripheral,
                            address.clone(),
                        ));
                    }
                    shared.sink.deliver(RadioEvent::Connected {
                        address,
                        connection: rand::random(),
                    });
                }
                Err(err) => {
                    warn!(%address, error = %err, "connect failed");
                    shared
                        .sink
                        .deliver(RadioEvent::ConnectionFailed { address });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address).await?;
        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        tokio::spawn(async move {
            if let Err(err) = peripheral.disconnect().await {
                warn!(%address, error = %err, "disconnect failed");
            }
            let was_connected = shared.state.lock().unwrap().connected.remove(&address);
            if was_connected {
                shared.sink.deliver(RadioEvent::Disconnected { address });
            }
        });
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<()> {
        self.ensure_connected(address)?;
        let peripheral = self.peripheral(address).await?;
        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        tokio::spawn(async move {
            if let Err(err) = peripheral.discover_services().await {
                warn!(%address, error = %err, "service discovery failed");
                shared.sink.deliver(RadioEvent::DiscoveryFailed { address });
                return;
            }
            let mut services: Vec<GattService> = Vec::new();
            {
                let mut state = shared.state.lock().unwrap();
                let mut uuid_ids = HashMap::new();
                for service in peripheral.services() {
                    let mut characteristics = Vec::new();
                    for characteristic in &service.characteristics {
                        let id = shared.next_attribute.fetch_add(1, Ordering::SeqCst);
                        characteristics.push(CharacteristicHandle {
                            id,
                            service: service.uuid,
                            uuid: characteristic.uuid,
                        });
                        uuid_ids.insert(characteristic.uuid, id);
                        state.attributes.insert(id, characteristic.clone());
                    }
                    services.push(GattService {
                        uuid: service.uuid,
                        characteristics,
                    });
                }
                state.notification_ids.insert(address.clone(), uuid_ids);
            }
            shared
                .sink
                .deliver(RadioEvent::ServicesDiscovered { address, services });
        });
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
    ) -> Result<()> {
        self.ensure_connected(address)?;
        let peripheral = self.peripheral(address).await?;
        let characteristic = self.attribute(handle)?;
        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        let id = handle.id;
        tokio::spawn(async move {
            let event = match peripheral.read(&characteristic).await {
                Ok(value) => RadioEvent::CharacteristicRead {
                    address,
                    handle: id,
                    status: GattStatus::Success,
                    value,
                },
                Err(err) => {
                    warn!(%address, handle = id, error = %err, "read failed");
                    RadioEvent::CharacteristicRead {
                        address,
                        handle: id,
                        status: GattStatus::Failure,
                        value: Vec::new(),
                    }
                }
            };
            shared.sink.deliver(event);
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        self.ensure_connected(address)?;
        let peripheral = self.peripheral(address).await?;
        let characteristic = self.attribute(handle)?;
        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        let id = handle.id;
        let value = value.to_vec();
        tokio::spawn(async move {
            let status = match peripheral
                .write(&characteristic, &value, write_type(mode))
                .await
            {
                Ok(()) => GattStatus::Success,
                Err(err) => {
                    warn!(%address, handle = id, error = %err, "write failed");
                    GattStatus::Failure
                }
            };
            shared.sink.deliver(RadioEvent::CharacteristicWritten {
                address,
                handle: id,
                status,
            });
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<()> {
        self.ensure_connected(address)?;
        let peripheral = self.peripheral(address).await?;
        let characteristic = self.attribute(handle)?;
        let shared = Arc::clone(&self.shared);
        let address = address.to_string();
        let id = handle.id;
        let value = value.to_vec();
        tokio::spawn(async move {
            let target = characteristic
                .descriptors
                .iter()
                .find(|d| d.uuid == descriptor)
                .cloned();
            let status = match target {
                Some(target) => match peripheral.write_descriptor(&target, &value).await {
                    Ok(()) => GattStatus::Success,
                    Err(err) => {
                        warn!(%address, handle = id, error = %err, "descriptor write failed");
                        GattStatus::Failure
                    }
                },
                // Platforms that manage the config descriptor inside
                // subscribe() do not expose it; the subscription call
                // already did the work.
                None => GattStatus::Success,
            };
            shared.sink.deliver(RadioEvent::DescriptorWritten {
                address,
                handle: id,
                status,
            });
        });
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
        enable: bool,
    ) -> Result<()> {
        self.ensure_connected(address)?;
        let peripheral = self.peripheral(address).await?;
        let characteristic = self.attribute(handle)?;
        if enable {
            peripheral.subscribe(&characteristic).await?;
        } else {
            peripheral.unsubscribe(&characteristic).await?;
        }
        Ok(())
    }

    async fn start_scan(&self, mode: ScanMode, _report_delay: Duration) -> Result<()> {
        // The platform API has no duty-cycle control; the mode is recorded
        // for logs only.
        debug!(?mode, "starting platform scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        Ok(())
    }
}
