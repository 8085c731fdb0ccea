//! Scripted radio backend for tests.
//!
//! [`MockRadio`] implements [`Radio`] against an in-memory peripheral
//! table. Operations are recorded in a command log and answered
//! synchronously through the event sink, so tests drive the full event
//! path without a Bluetooth stack. Failure injection is per peripheral;
//! [`MockRadio::go_silent`] swallows replies entirely to exercise
//! timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::radio::{
    event_channel, AdvertisementReport, CharacteristicHandle, EventSink, GattService, GattStatus,
    Radio, RadioEvent,
};
use bluesmart_types::{ScanMode, WriteMode};

/// One operation the mock was asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    Connect {
        address: String,
    },
    Disconnect {
        address: String,
    },
    DiscoverServices {
        address: String,
    },
    Read {
        address: String,
        handle: u64,
    },
    Write {
        address: String,
        handle: u64,
        value: Vec<u8>,
        mode: WriteMode,
    },
    WriteDescriptor {
        address: String,
        handle: u64,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    SetNotification {
        address: String,
        handle: u64,
        enable: bool,
    },
    StartScan {
        mode: ScanMode,
    },
    StopScan,
}

/// A scripted peripheral.
#[derive(Debug, Default, Clone)]
pub struct MockPeripheral {
    services: Vec<GattService>,
    values: HashMap<u64, Vec<u8>>,
    fail_connect: bool,
    fail_discovery: bool,
    read_status: HashMap<u64, GattStatus>,
    write_status: HashMap<u64, GattStatus>,
}

impl MockPeripheral {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service to the discovery table.
    #[must_use]
    pub fn service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    /// Preload the value a read of `handle` returns.
    #[must_use]
    pub fn value(mut self, handle: u64, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert(handle, value.into());
        self
    }

    /// Make connection attempts fail.
    #[must_use]
    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Make service discovery fail after a successful connect.
    #[must_use]
    pub fn fail_discovery(mut self) -> Self {
        self.fail_discovery = true;
        self
    }

    /// Fix the status reads of `handle` report.
    #[must_use]
    pub fn read_status(mut self, handle: u64, status: GattStatus) -> Self {
        self.read_status.insert(handle, status);
        self
    }

    /// Fix the status writes of `handle` report.
    #[must_use]
    pub fn write_status(mut self, handle: u64, status: GattStatus) -> Self {
        self.write_status.insert(handle, status);
        self
    }
}

#[derive(Default)]
struct MockState {
    peripherals: HashMap<String, MockPeripheral>,
    connected: HashSet<String>,
    commands: Vec<MockCommand>,
    silent: bool,
    scanning: bool,
}

/// In-memory [`Radio`] implementation.
pub struct MockRadio {
    sink: EventSink,
    state: Mutex<MockState>,
    next_token: AtomicU64,
}

impl MockRadio {
    /// Build a mock delivering into `sink`.
    pub fn new(sink: EventSink) -> Arc<Self> {
        Arc::new(Self {
            sink,
            state: Mutex::new(MockState::default()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Build a mock with its own event channel, returning the receiving
    /// half for wiring into a context (or dropping when the test drives
    /// device state directly).
    pub fn detached() -> (
        Arc<Self>,
        tokio::sync::mpsc::UnboundedReceiver<RadioEvent>,
    ) {
        let (sink, rx) = event_channel();
        (Self::new(sink), rx)
    }

    /// Script a peripheral at `address`.
    pub fn add_peripheral(&self, address: impl Into<String>, peripheral: MockPeripheral) {
        self.state
            .lock()
            .unwrap()
            .peripherals
            .insert(address.into(), peripheral);
    }

    /// Deliver a scan report, as the radio would during a scan session.
    pub fn advertise(&self, report: AdvertisementReport) {
        self.sink.deliver(RadioEvent::ScanReport(report));
    }

    /// Deliver an unsolicited notification frame.
    pub fn push_notification(&self, address: impl Into<String>, handle: u64, value: Vec<u8>) {
        self.sink.deliver(RadioEvent::CharacteristicChanged {
            address: address.into(),
            handle,
            value,
        });
    }

    /// Drop the link to `address` as if the peripheral walked away.
    pub fn drop_link(&self, address: &str) {
        self.state.lock().unwrap().connected.remove(address);
        self.sink.deliver(RadioEvent::Disconnected {
            address: address.to_string(),
        });
    }

    /// Deliver a raw event.
    pub fn deliver(&self, event: RadioEvent) {
        self.sink.deliver(event);
    }

    /// When silent, operations are accepted and logged but never answered.
    pub fn go_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Whether a scan session is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().unwrap().scanning
    }

    /// Every operation issued so far, in order.
    pub fn commands(&self) -> Vec<MockCommand> {
        self.state.lock().unwrap().commands.clone()
    }

    fn record(&self, command: MockCommand) -> bool {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command);
        state.silent
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn connect(&self, address: &str) -> Result<()> {
        let silent = self.record(MockCommand::Connect {
            address: address.to_string(),
        });
        if silent {
            return Ok(());
        }
        let accepted = {
            let mut state = self.state.lock().unwrap();
            match state.peripherals.get(address) {
                Some(peripheral) if !peripheral.fail_connect => {
                    state.connected.insert(address.to_string());
                    true
                }
                _ => false,
            }
        };
        if accepted {
            self.sink.deliver(RadioEvent::Connected {
                address: address.to_string(),
                connection: self.next_token.fetch_add(1, Ordering::SeqCst),
            });
        } else {
            self.sink.deliver(RadioEvent::ConnectionFailed {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let silent = self.record(MockCommand::Disconnect {
            address: address.to_string(),
        });
        if silent {
            return Ok(());
        }
        let was_connected = self.state.lock().unwrap().connected.remove(address);
        if was_connected {
            self.sink.deliver(RadioEvent::Disconnected {
                address: address.to_string(),
            });
        }
        Ok(())
    }

    async fn discover_services(&self, address: &str) -> Result<()> {
        let silent = self.record(MockCommand::DiscoverServices {
            address: address.to_string(),
        });
        if silent {
            return Ok(());
        }
        let services = {
            let state = self.state.lock().unwrap();
            state
                .peripherals
                .get(address)
                .filter(|p| !p.fail_discovery)
                .map(|p| p.services.clone())
        };
        match services {
            Some(services) => self.sink.deliver(RadioEvent::ServicesDiscovered {
                address: address.to_string(),
                services,
            }),
            None => self.sink.deliver(RadioEvent::DiscoveryFailed {
                address: address.to_string(),
            }),
        }
        Ok(())
    }

    async fn read_characteristic(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
    ) -> Result<()> {
        let silent = self.record(MockCommand::Read {
            address: address.to_string(),
            handle: handle.id,
        });
        if silent {
            return Ok(());
        }
        let (status, value) = {
            let state = self.state.lock().unwrap();
            match state.peripherals.get(address) {
                Some(peripheral) => (
                    peripheral
                        .read_status
                        .get(&handle.id)
                        .copied()
                        .unwrap_or(GattStatus::Success),
                    peripheral.values.get(&handle.id).cloned().unwrap_or_default(),
                ),
                None => (GattStatus::Failure, Vec::new()),
            }
        };
        self.sink.deliver(RadioEvent::CharacteristicRead {
            address: address.to_string(),
            handle: handle.id,
            status,
            value: if status == GattStatus::Success {
                value
            } else {
                Vec::new()
            },
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
        let silent = self.record(MockCommand::Write {
            address: address.to_string(),
            handle: handle.id,
            value: value.to_vec(),
            mode,
        });
        if silent {
            return Ok(());
        }
        let status = {
            let mut state = self.state.lock().unwrap();
            match state.peripherals.get_mut(address) {
                Some(peripheral) => {
                    let status = peripheral
                        .write_status
                        .get(&handle.id)
                        .copied()
                        .unwrap_or(GattStatus::Success);
                    if status == GattStatus::Success {
                        peripheral.values.insert(handle.id, value.to_vec());
                    }
                    status
                }
                None => GattStatus::Failure,
            }
        };
        self.sink.deliver(RadioEvent::CharacteristicWritten {
            address: address.to_string(),
            handle: handle.id,
            status,
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
        let silent = self.record(MockCommand::WriteDescriptor {
            address: address.to_string(),
            handle: handle.id,
            descriptor,
            value: value.to_vec(),
        });
        if silent {
            return Ok(());
        }
        let known = self.state.lock().unwrap().peripherals.contains_key(address);
        self.sink.deliver(RadioEvent::DescriptorWritten {
            address: address.to_string(),
            handle: handle.id,
            status: if known {
                GattStatus::Success
            } else {
                GattStatus::Failure
            },
        });
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        address: &str,
        handle: &CharacteristicHandle,
        enable: bool,
    ) -> Result<()> {
        self.record(MockCommand::SetNotification {
            address: address.to_string(),
            handle: handle.id,
            enable,
        });
        Ok(())
    }

    async fn start_scan(&self, mode: ScanMode, _report_delay: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(MockCommand::StartScan { mode });
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(MockCommand::StopScan);
        state.scanning = false;
        Ok(())
    }
}
