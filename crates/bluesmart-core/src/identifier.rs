//! Device classification rules.
//!
//! An [`Identifier`] pairs match criteria (advertised name, required
//! service UUIDs, raw-payload predicate) with a factory that builds the
//! typed [`Device`] for peripherals that satisfy them. The scanner tries
//! identifiers in registration order and the first match wins.

use std::sync::Arc;

use uuid::Uuid;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::radio::{AdvertisementReport, Radio};
use bluesmart_types::uuid::expand;

/// Factory producing a configured device for a matched advertisement.
///
/// The factory typically builds the device, registers its characteristics,
/// and attaches whatever typed wrapper the application uses. A factory
/// error discards the report; the address stays eligible for later
/// classification.
pub type DeviceFactory =
    Arc<dyn Fn(&AdvertisementReport, Arc<dyn Radio>) -> Result<Arc<Device>> + Send + Sync>;

/// Predicate over the raw advertisement payload.
pub type PayloadPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// One classification rule.
pub struct Identifier {
    name: Option<String>,
    services: Vec<Uuid>,
    payload: Option<PayloadPredicate>,
    factory: DeviceFactory,
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identifier")
            .field("name", &self.name)
            .field("services", &self.services)
            .field("payload_predicate", &self.payload.is_some())
            .finish_non_exhaustive()
    }
}

impl Identifier {
    /// Start building an identifier around `factory`.
    pub fn builder(factory: DeviceFactory) -> IdentifierBuilder {
        IdentifierBuilder {
            name: None,
            services: Vec::new(),
            payload: None,
            factory,
        }
    }

    /// Whether `report` satisfies every configured criterion.
    pub fn matches(&self, report: &AdvertisementReport) -> bool {
        if let Some(name) = &self.name {
            let advertised = match &report.local_name {
                Some(advertised) => advertised,
                None => return false,
            };
            if advertised != name {
                return false;
            }
        }
        if !self
            .services
            .iter()
            .all(|service| report.service_uuids.contains(service))
        {
            return false;
        }
        if let Some(predicate) = &self.payload {
            if !predicate(&report.payload) {
                return false;
            }
        }
        true
    }

    /// Build the device for a matched report.
    pub(crate) fn instantiate(
        &self,
        report: &AdvertisementReport,
        radio: Arc<dyn Radio>,
    ) -> Result<Arc<Device>> {
        (self.factory)(report, radio)
    }
}

/// Builder for [`Identifier`]. At least one criterion must be set.
pub struct IdentifierBuilder {
    name: Option<String>,
    services: Vec<Uuid>,
    payload: Option<PayloadPredicate>,
    factory: DeviceFactory,
}

impl IdentifierBuilder {
    /// Require an exact advertised-name match.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require the advertisement to carry this service UUID. May be
    /// repeated; every required UUID must appear.
    #[must_use]
    pub fn service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    /// Require the advertisement to carry the service UUID given as a
    /// literal, expanding 16- and 32-bit short forms.
    pub fn service_literal(mut self, literal: &str) -> Result<Self> {
        self.services.push(expand(literal)?);
        Ok(self)
    }

    /// Require `predicate` to accept the raw advertisement payload.
    #[must_use]
    pub fn payload(mut self, predicate: PayloadPredicate) -> Self {
        self.payload = Some(predicate);
        self
    }

    /// Require the raw payload to contain this byte id, as beacon frames
    /// carry it.
    #[must_use]
    pub fn beacon_id(self, id: impl Into<Vec<u8>>) -> Self {
        let id = id.into();
        self.payload(Arc::new(move |payload| payload_contains(payload, &id)))
    }

    /// Finish the identifier.
    pub fn build(self) -> Result<Identifier> {
        if self.name.is_none() && self.services.is_empty() && self.payload.is_none() {
            return Err(Error::InvalidConfig(
                "identifier needs at least one match criterion".into(),
            ));
        }
        Ok(Identifier {
            name: self.name,
            services: self.services,
            payload: self.payload,
            factory: self.factory,
        })
    }
}

fn payload_contains(payload: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || payload.len() < needle.len() {
        return false;
    }
    payload.windows(needle.len()).any(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;

    fn factory() -> DeviceFactory {
        Arc::new(|report, radio| Ok(Device::new(report.address.clone(), radio)))
    }

    fn report(name: Option<&str>, services: Vec<Uuid>, payload: Vec<u8>) -> AdvertisementReport {
        AdvertisementReport {
            address: "AA:BB:CC:DD:EE:FF".into(),
            local_name: name.map(Into::into),
            payload,
            service_uuids: services,
            rssi: -50,
        }
    }

    #[test]
    fn all_criteria_must_hold() {
        let feed = expand("feed").unwrap();
        let identifier = Identifier::builder(factory())
            .name("Widget")
            .service(feed)
            .build()
            .unwrap();

        assert!(identifier.matches(&report(Some("Widget"), vec![feed], vec![])));
        assert!(!identifier.matches(&report(Some("Widget"), vec![], vec![])));
        assert!(!identifier.matches(&report(Some("Gadget"), vec![feed], vec![])));
        assert!(!identifier.matches(&report(None, vec![feed], vec![])));
    }

    #[test]
    fn every_required_service_must_appear() {
        let feed = expand("feed").unwrap();
        let beef = expand("beef").unwrap();
        let identifier = Identifier::builder(factory())
            .service(feed)
            .service(beef)
            .build()
            .unwrap();

        assert!(identifier.matches(&report(None, vec![beef, feed], vec![])));
        assert!(!identifier.matches(&report(None, vec![feed], vec![])));
    }

    #[test]
    fn beacon_id_matches_anywhere_in_payload() {
        let identifier = Identifier::builder(factory())
            .beacon_id(vec![0xDE, 0xAD])
            .build()
            .unwrap();

        assert!(identifier.matches(&report(None, vec![], vec![0x02, 0x01, 0xDE, 0xAD, 0x00])));
        assert!(!identifier.matches(&report(None, vec![], vec![0x02, 0x01, 0xDE])));
    }

    #[test]
    fn payload_predicate_is_consulted() {
        let identifier = Identifier::builder(factory())
            .payload(Arc::new(|payload| payload.first() == Some(&0x99)))
            .build()
            .unwrap();

        assert!(identifier.matches(&report(None, vec![], vec![0x99, 0x00])));
        assert!(!identifier.matches(&report(None, vec![], vec![0x00, 0x99])));
    }

    #[test]
    fn criterionless_identifier_is_rejected() {
        assert!(Identifier::builder(factory()).build().is_err());
    }

    #[test]
    fn factory_builds_device_for_report() {
        let (radio, _rx) = MockRadio::detached();
        let identifier = Identifier::builder(factory()).name("Widget").build().unwrap();
        let device = identifier
            .instantiate(&report(Some("Widget"), vec![], vec![]), radio)
            .unwrap();
        assert_eq!(device.address(), "AA:BB:CC:DD:EE:FF");
    }
}
