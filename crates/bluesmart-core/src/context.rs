//! Orchestration context.
//!
//! [`BleContext`] ties one radio backend to the device registry and the
//! scanner. It owns the dispatch task that drains the backend's event
//! channel sequentially: device-scoped events are routed to their device's
//! state machine, scan reports go through presence tracking and
//! classification. Sequential dispatch is what gives every device a single
//! writer for its state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::device::Device;
use crate::identifier::Identifier;
use crate::radio::{AdvertisementReport, Radio, RadioEvent};
use crate::scanner::{is_beacon_frame, ScanConfig, Scanner};

const EVENT_CAPACITY: usize = 64;

/// Registry-level events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextEvent {
    /// A device entered the registry, by classification or injection.
    DeviceDiscovered { address: String },
    /// A device left the registry.
    DeviceForgotten { address: String },
}

/// The top-level orchestrator. Shared as `Arc<BleContext>`.
pub struct BleContext {
    radio: Arc<dyn Radio>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
    scanner: Scanner,
    events: broadcast::Sender<ContextEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleContext")
            .field("devices", &self.devices.lock().unwrap().len())
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

impl BleContext {
    /// Build a context over `radio`, draining `events` until shutdown.
    ///
    /// `events` is the receiving half of the channel the backend was
    /// constructed with; see [`crate::radio::event_channel`].
    pub fn new(radio: Arc<dyn Radio>, events: mpsc::UnboundedReceiver<RadioEvent>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let context = Arc::new(Self {
            scanner: Scanner::new(Arc::clone(&radio)),
            radio,
            devices: Mutex::new(HashMap::new()),
            events: tx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        let handle = tokio::spawn(dispatch(
            Arc::downgrade(&context),
            events,
            context.cancel.clone(),
        ));
        context.tasks.lock().unwrap().push(handle);
        context
    }

    /// The radio this context drives.
    pub fn radio(&self) -> &Arc<dyn Radio> {
        &self.radio
    }

    /// The scanner and its classification state.
    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    /// Register a classification rule. See [`Scanner::add_identifier`].
    pub fn add_identifier(&self, identifier: Identifier) {
        self.scanner.add_identifier(identifier);
    }

    /// Start the scan session.
    pub async fn start_scan(&self) -> crate::error::Result<()> {
        self.scanner.start().await
    }

    /// Stop the scan session.
    pub async fn stop_scan(&self) -> crate::error::Result<()> {
        self.scanner.stop().await
    }

    /// Replace scan parameters, restarting a running session.
    pub async fn set_scan_config(&self, config: ScanConfig) -> crate::error::Result<()> {
        self.scanner.set_config(config).await
    }

    /// Look up a tracked device.
    pub fn device(&self, address: &str) -> Option<Arc<Device>> {
        self.devices.lock().unwrap().get(address).cloned()
    }

    /// Every tracked device.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().unwrap().values().cloned().collect()
    }

    /// Number of tracked devices.
    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    /// Add a device built outside classification, replacing any existing
    /// entry for its address.
    pub fn inject_device(&self, device: Arc<Device>) {
        let address = device.address().to_string();
        self.devices
            .lock()
            .unwrap()
            .insert(address.clone(), device);
        info!(%address, "device injected");
        let _ = self.events.send(ContextEvent::DeviceDiscovered { address });
    }

    /// Drop a device from the registry and the rejected-address cache.
    /// Its link, if any, is untouched.
    pub fn forget_device(&self, address: &str) -> Option<Arc<Device>> {
        let removed = self.devices.lock().unwrap().remove(address);
        if removed.is_some() {
            self.scanner.forget(address);
            info!(%address, "device forgotten");
            let _ = self.events.send(ContextEvent::DeviceForgotten {
                address: address.to_string(),
            });
        }
        removed
    }

    /// Drop every disconnected device not seen on the air for
    /// `stale_after`. Returns how many were dropped.
    pub fn sweep_stale(&self, stale_after: Duration) -> usize {
        let stale: Vec<String> = self
            .devices
            .lock()
            .unwrap()
            .values()
            .filter(|device| !device.is_linked() && device.last_seen().elapsed() >= stale_after)
            .map(|device| device.address().to_string())
            .collect();
        for address in &stale {
            self.forget_device(address);
        }
        stale.len()
    }

    /// Run [`Self::sweep_stale`] every `interval` until shutdown.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration, stale_after: Duration) {
        let context = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(context) = context.upgrade() else {
                    break;
                };
                let swept = context.sweep_stale(stale_after);
                if swept > 0 {
                    debug!(swept, "stale devices swept");
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Stop the dispatch and sweeper tasks. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    async fn route(&self, event: RadioEvent) {
        match event {
            RadioEvent::ScanReport(report) => self.handle_report(report),
            event => {
                let device = event.address().and_then(|address| self.device(address));
                match device {
                    Some(device) => device.handle_event(event).await,
                    None => {
                        debug!(address = ?event.address(), "event for untracked device");
                    }
                }
            }
        }
    }

    fn handle_report(&self, report: AdvertisementReport) {
        if let Some(device) = self.device(&report.address) {
            if is_beacon_frame(&report.payload) {
                device.on_beacon(report.rssi);
            } else {
                device.update_advertisement(&report);
            }
            return;
        }
        if let Some(device) = self.scanner.classify(&report) {
            let address = device.address().to_string();
            self.devices
                .lock()
                .unwrap()
                .insert(address.clone(), device);
            info!(%address, "device discovered");
            let _ = self.events.send(ContextEvent::DeviceDiscovered { address });
        }
    }
}

impl Drop for BleContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn dispatch(
    context: std::sync::Weak<BleContext>,
    mut events: mpsc::UnboundedReceiver<RadioEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(context) = context.upgrade() else {
            break;
        };
        context.route(event).await;
    }
}
