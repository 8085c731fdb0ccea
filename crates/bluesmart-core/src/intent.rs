//! Fluent construction of action queues.
//!
//! An [`Intent`] is an ordered list of actions submitted to a device as one
//! unit. Queues are cloneable and reusable; submitting the same intent twice
//! runs the same steps twice.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bluesmart_core::characteristic::Characteristic;
//! use bluesmart_core::intent::Intent;
//!
//! let battery = Arc::new(Characteristic::from_literals("180f", "2a19").unwrap());
//! let poll = Intent::new()
//!     .connect()
//!     .read(&battery)
//!     .timeout(Duration::from_secs(2))
//!     .disconnect();
//! assert_eq!(poll.len(), 3);
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::action::{Action, ActionKind, ActionResult, DeviceCallback, ResultHandler};
use crate::characteristic::{Characteristic, NotificationListener};
use crate::device::Device;
use bluesmart_types::WriteMode;

/// An ordered, reusable queue of actions.
#[derive(Clone, Default)]
pub struct Intent {
    actions: Vec<Action>,
}

impl std::fmt::Debug for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(Action::name))
            .finish()
    }
}

impl Intent {
    /// Start an empty intent.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a connect step. Succeeds once services are discovered; a
    /// no-op when the device is already ready.
    #[must_use]
    pub fn connect(mut self) -> Self {
        self.actions.push(Action::new(ActionKind::Connect));
        self
    }

    /// Append a disconnect step. A no-op when no link is up.
    #[must_use]
    pub fn disconnect(mut self) -> Self {
        self.actions.push(Action::new(ActionKind::Disconnect));
        self
    }

    /// Append a characteristic read. The value lands on the characteristic
    /// and in the device's `Read` event.
    #[must_use]
    pub fn read(mut self, characteristic: &Arc<Characteristic>) -> Self {
        self.actions.push(Action::new(ActionKind::Read {
            characteristic: Arc::clone(characteristic),
        }));
        self
    }

    /// Append a characteristic write using the characteristic's default
    /// write mode.
    #[must_use]
    pub fn write(self, characteristic: &Arc<Characteristic>, value: impl Into<Vec<u8>>) -> Self {
        self.write_with_mode(characteristic, value, WriteMode::Unset)
    }

    /// Append a characteristic write with an explicit write mode.
    #[must_use]
    pub fn write_with_mode(
        mut self,
        characteristic: &Arc<Characteristic>,
        value: impl Into<Vec<u8>>,
        mode: WriteMode,
    ) -> Self {
        self.actions.push(Action::new(ActionKind::Write {
            characteristic: Arc::clone(characteristic),
            value: value.into(),
            mode,
        }));
        self
    }

    /// Append a step that turns notifications on and registers `listener`
    /// for them. The listener is registered only once the peripheral has
    /// acknowledged the subscription.
    #[must_use]
    pub fn enable_notifications(
        mut self,
        characteristic: &Arc<Characteristic>,
        listener: &NotificationListener,
    ) -> Self {
        self.actions.push(Action::new(ActionKind::SetNotification {
            characteristic: Arc::clone(characteristic),
            enable: true,
            listener: Some(Arc::clone(listener)),
        }));
        self
    }

    /// Append a step that turns notifications off. Passing the listener that
    /// was registered removes it; passing `None` leaves listeners in place.
    #[must_use]
    pub fn disable_notifications(
        mut self,
        characteristic: &Arc<Characteristic>,
        listener: Option<&NotificationListener>,
    ) -> Self {
        self.actions.push(Action::new(ActionKind::SetNotification {
            characteristic: Arc::clone(characteristic),
            enable: false,
            listener: listener.map(Arc::clone),
        }));
        self
    }

    /// Append an application callback step. The result the callback returns
    /// becomes the step's result.
    #[must_use]
    pub fn callback(
        mut self,
        callback: impl Fn(&Arc<Device>) -> ActionResult + Send + Sync + 'static,
    ) -> Self {
        let callback: DeviceCallback = Arc::new(callback);
        self.actions.push(Action::new(ActionKind::Callback { callback }));
        self
    }

    /// Override the deadline of the most recently appended action. Ignored
    /// on an empty intent.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(action) = self.actions.last_mut() {
            action.set_timeout(timeout);
        }
        self
    }

    /// Attach a result handler to the most recently appended action. The
    /// handler receives the action's result and decides whether the rest of
    /// the queue runs. Ignored on an empty intent.
    #[must_use]
    pub fn on_result(
        mut self,
        handler: impl Fn(ActionResult) -> bool + Send + Sync + 'static,
    ) -> Self {
        if let Some(action) = self.actions.last_mut() {
            let handler: ResultHandler = Arc::new(handler);
            action.set_handler(handler);
        }
        self
    }

    /// Append every action of `other`, preserving order.
    #[must_use]
    pub fn append(mut self, other: Intent) -> Self {
        self.actions.extend(other.actions);
        self
    }

    /// Number of queued actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the intent holds no actions.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn into_actions(self) -> Vec<Action> {
        self.actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_in_order() {
        let battery = Arc::new(Characteristic::from_literals("180f", "2a19").unwrap());
        let intent = Intent::new()
            .connect()
            .read(&battery)
            .write(&battery, vec![1])
            .disconnect();
        let names: Vec<_> = intent.into_actions().iter().map(Action::name).collect();
        assert_eq!(names, ["connect", "read", "write", "disconnect"]);
    }

    #[test]
    fn append_preserves_order() {
        let first = Intent::new().connect();
        let second = Intent::new().disconnect();
        let merged = first.append(second);
        let names: Vec<_> = merged.into_actions().iter().map(Action::name).collect();
        assert_eq!(names, ["connect", "disconnect"]);
    }

    #[test]
    fn timeout_on_empty_intent_is_ignored() {
        let intent = Intent::new().timeout(Duration::from_secs(1));
        assert!(intent.is_empty());
    }
}
