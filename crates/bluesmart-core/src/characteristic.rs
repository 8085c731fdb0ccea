//! Characteristic model.
//!
//! A [`Characteristic`] is declared up front by (service UUID,
//! characteristic UUID) and resolved against the live GATT table on every
//! service discovery pass. The resolved handle is only valid for the
//! connection that produced it: it is cleared on disconnect and never
//! reused across reconnects.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::error::Result;
use crate::radio::CharacteristicHandle;
use bluesmart_types::uuid::expand;
use bluesmart_types::WriteMode;

/// Default per-characteristic operation timeout.
pub const DEFAULT_CHARACTERISTIC_TIMEOUT: Duration = Duration::from_millis(5000);

/// A notification listener.
///
/// Listener identity is the `Arc` allocation: registering a clone of an
/// already-registered listener is a no-op, and removal takes the same `Arc`.
pub type NotificationListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct ResolvedState {
    handle: Option<CharacteristicHandle>,
    value: Vec<u8>,
    listeners: Vec<NotificationListener>,
}

/// A declared characteristic and its per-connection resolution state.
///
/// Shared as `Arc<Characteristic>` between the owning device (which resolves
/// and resets it from the event path) and actions (which read it from the
/// runner task).
pub struct Characteristic {
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    timeout: Duration,
    write_mode: WriteMode,
    state: Mutex<ResolvedState>,
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("service", &self.service_uuid)
            .field("uuid", &self.characteristic_uuid)
            .field("resolved", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl Characteristic {
    /// Declare a characteristic by full service and characteristic UUIDs.
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service_uuid: service,
            characteristic_uuid: characteristic,
            timeout: DEFAULT_CHARACTERISTIC_TIMEOUT,
            write_mode: WriteMode::Default,
            state: Mutex::new(ResolvedState::default()),
        }
    }

    /// Declare a characteristic from UUID literals, expanding short forms.
    ///
    /// # Example
    ///
    /// ```
    /// use bluesmart_core::characteristic::Characteristic;
    ///
    /// let battery = Characteristic::from_literals("180f", "2a19").unwrap();
    /// ```
    pub fn from_literals(service: &str, characteristic: &str) -> Result<Self> {
        Ok(Self::new(expand(service)?, expand(characteristic)?))
    }

    /// Set the default operation timeout for actions against this
    /// characteristic.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the default write mode used when a write action leaves its mode
    /// unset.
    #[must_use]
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    /// The declared service UUID.
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// The declared characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    /// Default timeout for actions against this characteristic.
    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Default write mode, applied when an action's mode is
    /// [`WriteMode::Unset`].
    pub fn default_write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Whether the characteristic holds a handle for the current connection.
    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().handle.is_some()
    }

    /// The resolved handle, if any.
    pub fn handle(&self) -> Option<CharacteristicHandle> {
        self.state.lock().unwrap().handle.clone()
    }

    /// Whether this characteristic resolved to the given attribute id.
    pub fn matches_handle(&self, id: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .handle
            .as_ref()
            .map(|h| h.id == id)
            .unwrap_or(false)
    }

    /// The last value read from, staged for, or notified on this
    /// characteristic.
    pub fn value(&self) -> Vec<u8> {
        self.state.lock().unwrap().value.clone()
    }

    pub(crate) fn set_value(&self, value: &[u8]) {
        self.state.lock().unwrap().value = value.to_vec();
    }

    pub(crate) fn resolve(&self, handle: CharacteristicHandle) {
        self.state.lock().unwrap().handle = Some(handle);
    }

    /// Drop the resolved handle. Called on every disconnect; the handle is
    /// re-resolved by the next discovery pass.
    pub(crate) fn reset(&self) {
        self.state.lock().unwrap().handle = None;
    }

    /// Register a notification listener. Duplicate registrations of the same
    /// `Arc` are ignored.
    pub fn add_listener(&self, listener: &NotificationListener) {
        let mut state = self.state.lock().unwrap();
        if !state.listeners.iter().any(|l| Arc::ptr_eq(l, listener)) {
            state.listeners.push(Arc::clone(listener));
        }
    }

    /// Remove a previously registered listener.
    pub fn remove_listener(&self, listener: &NotificationListener) {
        let mut state = self.state.lock().unwrap();
        state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Drop every registered listener. Called on disconnect.
    pub(crate) fn clear_listeners(&self) {
        self.state.lock().unwrap().listeners.clear();
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().unwrap().listeners.len()
    }

    /// Deliver a notification payload to every registered listener.
    ///
    /// Listeners are invoked outside the lock so a listener may re-enter
    /// the characteristic (e.g. to deregister itself).
    pub(crate) fn notify(&self, value: &[u8]) {
        let listeners: Vec<NotificationListener> = {
            let mut state = self.state.lock().unwrap();
            state.value = value.to_vec();
            state.listeners.clone()
        };
        for listener in listeners {
            listener(value);
        }
    }
}
