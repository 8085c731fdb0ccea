//! Advertisement classification.
//!
//! The [`Scanner`] owns the scan session parameters, the ordered
//! [`Identifier`] list, and the rejected-address cache. Classification of
//! each report is a single ordered pass over the identifiers; addresses no
//! identifier wants are cached and skipped until the identifier set
//! changes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::Device;
use crate::identifier::Identifier;
use crate::radio::{AdvertisementReport, Radio};
use bluesmart_types::ScanMode;

/// Manufacturer prefix that marks a beacon frame, at its fixed payload
/// offset.
const BEACON_PREFIX: [u8; 2] = [0x4C, 0x00];
const BEACON_PREFIX_OFFSET: usize = 5;

/// Scan session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    mode: ScanMode,
    report_delay: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::Balanced,
            report_delay: Duration::ZERO,
        }
    }
}

impl ScanConfig {
    /// Scan with `mode` and immediate report delivery.
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            report_delay: Duration::ZERO,
        }
    }

    /// Let the radio batch reports for up to `delay` before delivery.
    #[must_use]
    pub fn report_delay(mut self, delay: Duration) -> Self {
        self.report_delay = delay;
        self
    }

    /// The configured scan mode.
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// The configured report batching delay.
    pub fn delay(&self) -> Duration {
        self.report_delay
    }
}

/// Whether a raw payload is a beacon frame.
pub(crate) fn is_beacon_frame(payload: &[u8]) -> bool {
    payload
        .get(BEACON_PREFIX_OFFSET..BEACON_PREFIX_OFFSET + BEACON_PREFIX.len())
        .map(|bytes| bytes == BEACON_PREFIX)
        .unwrap_or(false)
}

struct ScanState {
    config: ScanConfig,
    active: bool,
}

/// Classifier for the scan session.
pub struct Scanner {
    radio: Arc<dyn Radio>,
    identifiers: Mutex<Vec<Arc<Identifier>>>,
    rejected: Mutex<HashSet<String>>,
    state: Mutex<ScanState>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("identifiers", &self.identifiers.lock().unwrap().len())
            .field("rejected", &self.rejected.lock().unwrap().len())
            .field("active", &self.is_scanning())
            .finish_non_exhaustive()
    }
}

impl Scanner {
    pub(crate) fn new(radio: Arc<dyn Radio>) -> Self {
        Self {
            radio,
            identifiers: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            state: Mutex::new(ScanState {
                config: ScanConfig::default(),
                active: false,
            }),
        }
    }

    /// Register a classification rule.
    ///
    /// Every rejected address becomes eligible again: a report the old rule
    /// set refused may match the new one.
    pub fn add_identifier(&self, identifier: Identifier) {
        self.identifiers.lock().unwrap().push(Arc::new(identifier));
        self.rejected.lock().unwrap().clear();
    }

    /// Number of registered identifiers.
    pub fn identifier_count(&self) -> usize {
        self.identifiers.lock().unwrap().len()
    }

    /// Whether `address` is cached as rejected.
    pub fn is_rejected(&self, address: &str) -> bool {
        self.rejected.lock().unwrap().contains(address)
    }

    /// Whether a scan session is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().unwrap().active
    }

    /// Current scan parameters.
    pub fn config(&self) -> ScanConfig {
        self.state.lock().unwrap().config.clone()
    }

    /// Start the scan session with the stored parameters.
    pub async fn start(&self) -> crate::error::Result<()> {
        let config = {
            let mut state = self.state.lock().unwrap();
            state.active = true;
            state.config.clone()
        };
        debug!(mode = ?config.mode(), "starting scan");
        self.radio.start_scan(config.mode(), config.delay()).await
    }

    /// Stop the scan session.
    pub async fn stop(&self) -> crate::error::Result<()> {
        self.state.lock().unwrap().active = false;
        debug!("stopping scan");
        self.radio.stop_scan().await
    }

    /// Replace the scan parameters, restarting the session if one is
    /// running.
    pub async fn set_config(&self, config: ScanConfig) -> crate::error::Result<()> {
        let restart = {
            let mut state = self.state.lock().unwrap();
            let changed = state.config != config;
            state.config = config;
            changed && state.active
        };
        if restart {
            self.radio.stop_scan().await?;
            self.start().await?;
        }
        Ok(())
    }

    /// Drop `address` from the rejected cache so it can be classified
    /// again.
    pub(crate) fn forget(&self, address: &str) {
        self.rejected.lock().unwrap().remove(address);
    }

    /// Classify a report from an unknown address.
    ///
    /// Returns the new device on a match. `None` means the report was
    /// skipped: no scan session running, address already rejected, no
    /// identifier matched (the address joins the rejected cache), or the
    /// matching factory failed (the address stays eligible).
    pub(crate) fn classify(&self, report: &AdvertisementReport) -> Option<Arc<Device>> {
        if !self.is_scanning() || self.is_rejected(&report.address) {
            return None;
        }
        let identifiers = self.identifiers.lock().unwrap().clone();
        for identifier in &identifiers {
            if !identifier.matches(report) {
                continue;
            }
            match identifier.instantiate(report, Arc::clone(&self.radio)) {
                Ok(device) => {
                    device.update_advertisement(report);
                    debug!(address = %report.address, "classified new device");
                    return Some(device);
                }
                Err(err) => {
                    warn!(address = %report.address, error = %err, "device factory failed");
                    return None;
                }
            }
        }
        self.rejected.lock().unwrap().insert(report.address.clone());
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::identifier::DeviceFactory;
    use crate::mock::MockRadio;

    fn factory() -> DeviceFactory {
        Arc::new(|report, radio| Ok(Device::new(report.address.clone(), radio)))
    }

    fn widget_report(address: &str) -> AdvertisementReport {
        AdvertisementReport {
            address: address.into(),
            local_name: Some("Widget".into()),
            payload: vec![],
            service_uuids: vec![],
            rssi: -40,
        }
    }

    fn scanner() -> Scanner {
        let (radio, _rx) = MockRadio::detached();
        Scanner::new(radio)
    }

    #[test]
    fn beacon_frame_detection() {
        let mut payload = vec![0u8; 8];
        payload[5] = 0x4C;
        payload[6] = 0x00;
        assert!(is_beacon_frame(&payload));

        payload[6] = 0x01;
        assert!(!is_beacon_frame(&payload));
        assert!(!is_beacon_frame(&[0x4C, 0x00]));
    }

    #[tokio::test]
    async fn classification_requires_an_active_session() {
        let scanner = scanner();
        scanner.add_identifier(
            Identifier::builder(factory()).name("Widget").build().unwrap(),
        );

        assert!(scanner.classify(&widget_report("11:22:33:44:55:66")).is_none());
        assert!(!scanner.is_rejected("11:22:33:44:55:66"));

        scanner.start().await.unwrap();
        assert!(scanner.classify(&widget_report("11:22:33:44:55:66")).is_some());
    }

    #[tokio::test]
    async fn unmatched_address_joins_rejected_cache() {
        let scanner = scanner();
        scanner.start().await.unwrap();
        scanner.add_identifier(
            Identifier::builder(factory()).name("Widget").build().unwrap(),
        );

        let report = AdvertisementReport {
            local_name: Some("Gadget".into()),
            ..widget_report("11:22:33:44:55:66")
        };
        assert!(scanner.classify(&report).is_none());
        assert!(scanner.is_rejected("11:22:33:44:55:66"));

        // Cached rejection short-circuits, even for a now-matching report.
        assert!(scanner.classify(&widget_report("11:22:33:44:55:66")).is_none());
    }

    #[tokio::test]
    async fn add_identifier_clears_rejected_cache() {
        let scanner = scanner();
        scanner.start().await.unwrap();
        scanner.add_identifier(
            Identifier::builder(factory()).name("Gadget").build().unwrap(),
        );
        assert!(scanner.classify(&widget_report("11:22:33:44:55:66")).is_none());
        assert!(scanner.is_rejected("11:22:33:44:55:66"));

        scanner.add_identifier(
            Identifier::builder(factory()).name("Widget").build().unwrap(),
        );
        assert!(!scanner.is_rejected("11:22:33:44:55:66"));
        assert!(scanner.classify(&widget_report("11:22:33:44:55:66")).is_some());
    }

    #[tokio::test]
    async fn first_matching_identifier_wins() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let scanner = scanner();
        scanner.start().await.unwrap();
        let first_ran = Arc::new(AtomicBool::new(false));
        let second_ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&first_ran);
        let first: DeviceFactory = Arc::new(move |report, radio| {
            flag.store(true, Ordering::SeqCst);
            Ok(Device::new(report.address.clone(), radio))
        });
        let flag = Arc::clone(&second_ran);
        let second: DeviceFactory = Arc::new(move |report, radio| {
            flag.store(true, Ordering::SeqCst);
            Ok(Device::new(report.address.clone(), radio))
        });
        scanner.add_identifier(Identifier::builder(first).name("Widget").build().unwrap());
        scanner.add_identifier(Identifier::builder(second).name("Widget").build().unwrap());

        assert!(scanner.classify(&widget_report("11:22:33:44:55:66")).is_some());
        assert!(first_ran.load(Ordering::SeqCst));
        assert!(!second_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn factory_failure_does_not_reject_address() {
        let scanner = scanner();
        scanner.start().await.unwrap();
        let failing: DeviceFactory =
            Arc::new(|_, _| Err(Error::invalid_state("characteristics unavailable")));
        scanner.add_identifier(Identifier::builder(failing).name("Widget").build().unwrap());

        assert!(scanner.classify(&widget_report("11:22:33:44:55:66")).is_none());
        assert!(!scanner.is_rejected("11:22:33:44:55:66"));
    }
}
