//! GATT actions.
//!
//! An [`Action`] is one step of an [`crate::intent::Intent`]: a connection
//! change, a characteristic operation, or an application callback. Actions
//! are executed one at a time by the device's runner; each subscribes to the
//! device event stream *before* issuing its radio operation, then waits for
//! the terminal event under a deadline. Missing the terminal event is
//! therefore impossible short of the timeout firing.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::characteristic::{Characteristic, NotificationListener};
use crate::device::{Device, DeviceEvent};
use bluesmart_types::uuid::{
    CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use bluesmart_types::WriteMode;

/// Default deadline for connect and disconnect actions.
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal result of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    /// No result was produced; the event stream ended underneath the action.
    Unknown,
    /// The deadline elapsed before the terminal event arrived.
    TimedOut,
    /// The device was not in a state that could serve the action.
    NotReady,
    /// The action completed.
    Ok,
    /// The radio reported failure, or the link dropped mid-action.
    Failed,
    /// The peripheral demands bonding before it will serve the operation.
    BondingRequired,
    /// A preceding action in the queue failed and this one never ran.
    Cancelled,
}

impl ActionResult {
    /// Whether this result lets a queue proceed by default.
    pub fn is_ok(self) -> bool {
        self == ActionResult::Ok
    }
}

/// Per-action result handler. Receives the action's result and returns
/// whether the rest of the queue should run.
pub type ResultHandler = Arc<dyn Fn(ActionResult) -> bool + Send + Sync>;

/// Application callback run as a queue step. The result it returns is
/// adopted as the step's result.
pub type DeviceCallback = Arc<dyn Fn(&Arc<Device>) -> ActionResult + Send + Sync>;

#[derive(Clone)]
pub(crate) enum ActionKind {
    Connect,
    Disconnect,
    Read {
        characteristic: Arc<Characteristic>,
    },
    Write {
        characteristic: Arc<Characteristic>,
        value: Vec<u8>,
        mode: WriteMode,
    },
    SetNotification {
        characteristic: Arc<Characteristic>,
        enable: bool,
        listener: Option<NotificationListener>,
    },
    Callback {
        callback: DeviceCallback,
    },
}

impl ActionKind {
    fn describe(&self) -> &'static str {
        match self {
            ActionKind::Connect => "connect",
            ActionKind::Disconnect => "disconnect",
            ActionKind::Read { .. } => "read",
            ActionKind::Write { .. } => "write",
            ActionKind::SetNotification { enable: true, .. } => "enable_notifications",
            ActionKind::SetNotification { enable: false, .. } => "disable_notifications",
            ActionKind::Callback { .. } => "callback",
        }
    }
}

/// One queue step. Cheap to clone; reusing an [`crate::intent::Intent`]
/// re-runs the same actions.
#[derive(Clone)]
pub struct Action {
    kind: ActionKind,
    timeout: Option<Duration>,
    handler: Option<ResultHandler>,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind.describe())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Action {
    pub(crate) fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            timeout: None,
            handler: None,
        }
    }

    pub(crate) fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub(crate) fn set_handler(&mut self, handler: ResultHandler) {
        self.handler = Some(handler);
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        self.kind.describe()
    }

    /// Deadline for this action: explicit override, else the target
    /// characteristic's default, else the link default.
    fn deadline(&self) -> Duration {
        if let Some(timeout) = self.timeout {
            return timeout;
        }
        match &self.kind {
            ActionKind::Read { characteristic }
            | ActionKind::Write { characteristic, .. }
            | ActionKind::SetNotification { characteristic, .. } => {
                characteristic.default_timeout()
            }
            _ => DEFAULT_LINK_TIMEOUT,
        }
    }

    /// Run the handler (or the default fail-fast rule) for `result`,
    /// returning whether the queue continues.
    pub(crate) fn report(&self, result: ActionResult) -> bool {
        match &self.handler {
            Some(handler) => handler(result),
            None => result.is_ok(),
        }
    }

    /// Execute against `device`, driving the radio and waiting for the
    /// terminal event.
    pub(crate) async fn execute(&self, device: &Arc<Device>) -> ActionResult {
        debug!(address = %device.address(), action = self.name(), "executing");
        match &self.kind {
            ActionKind::Connect => self.run_connect(device).await,
            ActionKind::Disconnect => self.run_disconnect(device).await,
            ActionKind::Read { characteristic } => self.run_read(device, characteristic).await,
            ActionKind::Write {
                characteristic,
                value,
                mode,
            } => self.run_write(device, characteristic, value, *mode).await,
            ActionKind::SetNotification {
                characteristic,
                enable,
                listener,
            } => {
                self.run_set_notification(device, characteristic, *enable, listener.as_ref())
                    .await
            }
            ActionKind::Callback { callback } => callback(device),
        }
    }

    async fn run_connect(&self, device: &Arc<Device>) -> ActionResult {
        // Subscribe before the state check: a transition landing between
        // the two is then observed as an event instead of slipping by.
        let mut events = device.subscribe();
        if device.is_ready() {
            return ActionResult::Ok;
        }
        if !device.is_linked() {
            device.mark_connecting();
            if device.radio().connect(device.address()).await.is_err() {
                device.mark_disconnected();
                return ActionResult::Failed;
            }
        }
        // A link may already be up with discovery in flight; either way the
        // terminal event is ServicesDiscovered.
        await_terminal(&mut events, self.deadline(), |event| match event {
            DeviceEvent::ServicesDiscovered => Some(ActionResult::Ok),
            DeviceEvent::ConnectionFailed
            | DeviceEvent::DiscoveryFailed
            | DeviceEvent::Disconnected => Some(ActionResult::Failed),
            _ => None,
        })
        .await
    }

    async fn run_disconnect(&self, device: &Arc<Device>) -> ActionResult {
        let mut events = device.subscribe();
        if !device.is_linked() {
            return ActionResult::Ok;
        }
        if device.disconnect().await.is_err() {
            return ActionResult::Failed;
        }
        await_terminal(&mut events, self.deadline(), |event| match event {
            DeviceEvent::Disconnected => Some(ActionResult::Ok),
            _ => None,
        })
        .await
    }

    async fn run_read(
        &self,
        device: &Arc<Device>,
        characteristic: &Arc<Characteristic>,
    ) -> ActionResult {
        if !device.is_ready() {
            return ActionResult::NotReady;
        }
        let handle = match characteristic.handle() {
            Some(handle) => handle,
            None => return ActionResult::NotReady,
        };
        let mut events = device.subscribe();
        if device
            .radio()
            .read_characteristic(device.address(), &handle)
            .await
            .is_err()
        {
            return ActionResult::Failed;
        }
        let id = handle.id;
        await_terminal(&mut events, self.deadline(), move |event| match event {
            DeviceEvent::Read {
                handle,
                success,
                bonding_required,
                ..
            } if *handle == id => Some(outcome(*success, *bonding_required)),
            DeviceEvent::Disconnected => Some(ActionResult::Failed),
            _ => None,
        })
        .await
    }

    async fn run_write(
        &self,
        device: &Arc<Device>,
        characteristic: &Arc<Characteristic>,
        value: &[u8],
        mode: WriteMode,
    ) -> ActionResult {
        if !device.is_ready() {
            return ActionResult::NotReady;
        }
        let handle = match characteristic.handle() {
            Some(handle) => handle,
            None => return ActionResult::NotReady,
        };
        let mode = mode.or(characteristic.default_write_mode());
        // Stage the outgoing value so observers see it while the write is
        // in flight.
        characteristic.set_value(value);
        let mut events = device.subscribe();
        if device
            .radio()
            .write_characteristic(device.address(), &handle, value, mode)
            .await
            .is_err()
        {
            return ActionResult::Failed;
        }
        let id = handle.id;
        await_terminal(&mut events, self.deadline(), move |event| match event {
            DeviceEvent::Written {
                handle,
                success,
                bonding_required,
            } if *handle == id => Some(outcome(*success, *bonding_required)),
            DeviceEvent::Disconnected => Some(ActionResult::Failed),
            _ => None,
        })
        .await
    }

    async fn run_set_notification(
        &self,
        device: &Arc<Device>,
        characteristic: &Arc<Characteristic>,
        enable: bool,
        listener: Option<&NotificationListener>,
    ) -> ActionResult {
        if !device.is_ready() {
            return ActionResult::NotReady;
        }
        let handle = match characteristic.handle() {
            Some(handle) => handle,
            None => return ActionResult::NotReady,
        };
        let mut events = device.subscribe();
        let value = if enable {
            ENABLE_NOTIFICATION_VALUE
        } else {
            DISABLE_NOTIFICATION_VALUE
        };
        if device
            .radio()
            .write_descriptor(
                device.address(),
                &handle,
                CLIENT_CHARACTERISTIC_CONFIG,
                &value,
            )
            .await
            .is_err()
        {
            return ActionResult::Failed;
        }
        let id = handle.id;
        let result = await_terminal(&mut events, self.deadline(), move |event| match event {
            DeviceEvent::DescriptorWritten {
                handle,
                success,
                bonding_required,
            } if *handle == id => Some(outcome(*success, *bonding_required)),
            DeviceEvent::Disconnected => Some(ActionResult::Failed),
            _ => None,
        })
        .await;
        if result != ActionResult::Ok {
            return result;
        }
        // Flag and listener changes wait for the peripheral's
        // acknowledgement of the subscription.
        if device
            .radio()
            .set_characteristic_notification(device.address(), &handle, enable)
            .await
            .is_err()
        {
            return ActionResult::Failed;
        }
        if enable {
            if let Some(listener) = listener {
                characteristic.add_listener(listener);
            }
        } else if let Some(listener) = listener {
            characteristic.remove_listener(listener);
        }
        ActionResult::Ok
    }
}

fn outcome(success: bool, bonding_required: bool) -> ActionResult {
    if success {
        ActionResult::Ok
    } else if bonding_required {
        ActionResult::BondingRequired
    } else {
        ActionResult::Failed
    }
}

/// Wait on the event stream until `classify` produces a terminal result or
/// the deadline elapses. Lagged receivers resubscribe implicitly by
/// continuing; a closed stream yields `Unknown`.
async fn await_terminal<F>(
    events: &mut broadcast::Receiver<DeviceEvent>,
    deadline: Duration,
    mut classify: F,
) -> ActionResult
where
    F: FnMut(&DeviceEvent) -> Option<ActionResult>,
{
    let until = tokio::time::Instant::now() + deadline;
    loop {
        match tokio::time::timeout_at(until, events.recv()).await {
            Err(_) => return ActionResult::TimedOut,
            Ok(Err(broadcast::error::RecvError::Closed)) => return ActionResult::Unknown,
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(skipped, "event stream lagged during action");
            }
            Ok(Ok(event)) => {
                if let Some(result) = classify(&event) {
                    return result;
                }
            }
        }
    }
}
