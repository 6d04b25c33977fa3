//! Security catalog and subscriber rights
//!
//! The catalog is the publisher's view of subscribers, measurements and
//! access rules. It is immutable once built; updates replace the whole
//! catalog through [`CatalogHandle`] and are followed by a rights refresh.
//!
//! Rights resolution for one `(subscriber, signal)`:
//! 1. Explicit per-subscriber rules win. Every matching explicit rule must allow.
//! 2. Otherwise group rules of every group the subscriber belongs to apply:
//!    any deny refuses, else any allow grants.
//! 3. Otherwise the signal is refused.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use gateway_codec::connection_string::parse_list;
use gateway_network::CertificateFingerprint;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PublisherError, Result};

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub id: Uuid,
    pub acronym: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub shared_secret: String,
    #[serde(default)]
    pub auth_key: String,
    /// `;` or `,` separated addresses
    #[serde(default)]
    pub valid_ip_addresses: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Hex SHA-256 of the subscriber's DER certificate
    #[serde(default)]
    pub certificate_fingerprint: Option<String>,
}

impl SubscriberRecord {
    pub fn ip_addresses(&self) -> Vec<IpAddr> {
        parse_list(&self.valid_ip_addresses)
            .iter()
            .filter_map(|ip| ip.parse().ok())
            .collect()
    }

    pub fn fingerprint(&self) -> Option<CertificateFingerprint> {
        self.certificate_fingerprint
            .as_deref()
            .and_then(CertificateFingerprint::from_hex)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub signal_id: Uuid,
    pub source: String,
    pub id: u32,
    #[serde(default)]
    pub point_tag: String,
    #[serde(default)]
    pub node_id: Uuid,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub signal_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub internal: bool,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl MeasurementRecord {
    /// `SOURCE:ID` form of the measurement key
    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub unique_id: Uuid,
    pub acronym: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node_id: Uuid,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub frames_per_second: i64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasorRecord {
    pub device: String,
    pub label: String,
    #[serde(default)]
    pub phasor_type: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub source_index: i64,
}

/// Explicit allow or deny of one signal for one subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplicitRule {
    pub subscriber_id: Uuid,
    pub signal_id: Uuid,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRule {
    pub signal_id: Uuid,
    pub allowed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberGroup {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: Vec<Uuid>,
    #[serde(default)]
    pub rules: Vec<GroupRule>,
}

/// Answers whether a subscriber may receive a signal
pub trait RightsSource: Send + Sync {
    fn has_rights(&self, subscriber_id: Uuid, signal_id: Uuid) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityCatalog {
    pub subscribers: Vec<SubscriberRecord>,
    pub measurements: Vec<MeasurementRecord>,
    pub devices: Vec<DeviceRecord>,
    pub phasors: Vec<PhasorRecord>,
    pub rules: Vec<ExplicitRule>,
    pub groups: Vec<SubscriberGroup>,
}

impl SecurityCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PublisherError::catalog(format!("cannot read {}: {e}", path.display()))
        })?;
        let catalog = Self::from_toml(&text)?;
        debug!(
            path = %path.display(),
            subscribers = catalog.subscribers.len(),
            measurements = catalog.measurements.len(),
            "Security catalog loaded"
        );
        Ok(catalog)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PublisherError::catalog(e.to_string()))
    }

    pub fn subscriber(&self, id: &Uuid) -> Option<&SubscriberRecord> {
        self.subscribers.iter().find(|s| s.id == *id)
    }

    /// First enabled subscriber registered for `ip`.
    pub fn subscriber_by_ip(&self, ip: IpAddr) -> Option<&SubscriberRecord> {
        let ip = canonical_ip(ip);
        self.subscribers
            .iter()
            .filter(|s| s.enabled)
            .find(|s| s.ip_addresses().into_iter().any(|candidate| canonical_ip(candidate) == ip))
    }

    pub fn subscriber_by_fingerprint(&self, fingerprint: &CertificateFingerprint) -> Option<&SubscriberRecord> {
        self.subscribers
            .iter()
            .filter(|s| s.enabled)
            .find(|s| s.fingerprint().as_ref() == Some(fingerprint))
    }

    /// Fingerprints of every enabled subscriber certificate
    pub fn trusted_fingerprints(&self) -> Vec<CertificateFingerprint> {
        self.subscribers
            .iter()
            .filter(|s| s.enabled)
            .filter_map(SubscriberRecord::fingerprint)
            .collect()
    }

    pub fn measurement(&self, signal_id: &Uuid) -> Option<&MeasurementRecord> {
        self.measurements.iter().find(|m| m.signal_id == *signal_id)
    }

    /// Resolves an input key given as a GUID, `SOURCE:ID`, or point tag.
    pub fn resolve_key(&self, key: &str) -> Option<&MeasurementRecord> {
        let key = key.trim();
        if let Ok(signal_id) = Uuid::parse_str(key) {
            if let Some(found) = self.measurement(&signal_id) {
                return Some(found);
            }
        }
        if let Some((source, id)) = key.rsplit_once(':') {
            if let Ok(id) = id.trim().parse::<u32>() {
                let source = source.trim();
                if let Some(found) = self
                    .measurements
                    .iter()
                    .find(|m| m.id == id && m.source.eq_ignore_ascii_case(source))
                {
                    return Some(found);
                }
            }
        }
        self.measurements
            .iter()
            .find(|m| !m.point_tag.is_empty() && m.point_tag.eq_ignore_ascii_case(key))
    }

    /// Resolves every key, logging and skipping the ones that match nothing.
    pub fn resolve_keys<'a>(&'a self, keys: &[String]) -> Vec<&'a MeasurementRecord> {
        let mut resolved: Vec<&MeasurementRecord> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.resolve_key(key) {
                Some(record) if !resolved.iter().any(|r| r.signal_id == record.signal_id) => {
                    resolved.push(record)
                }
                Some(_) => {}
                None => warn!(key = %key, "Input measurement key did not resolve to a known signal"),
            }
        }
        resolved
    }
}

impl RightsSource for SecurityCatalog {
    fn has_rights(&self, subscriber_id: Uuid, signal_id: Uuid) -> bool {
        let mut explicit = self
            .rules
            .iter()
            .filter(|rule| rule.subscriber_id == subscriber_id && rule.signal_id == signal_id)
            .peekable();
        if explicit.peek().is_some() {
            return explicit.all(|rule| rule.allowed);
        }

        let mut granted = false;
        for group in self.groups.iter().filter(|g| g.members.contains(&subscriber_id)) {
            for rule in group.rules.iter().filter(|r| r.signal_id == signal_id) {
                if !rule.allowed {
                    return false;
                }
                granted = true;
            }
        }
        granted
    }
}

/// Shared, replaceable reference to the current catalog
#[derive(Debug, Clone, Default)]
pub struct CatalogHandle {
    current: Arc<RwLock<Arc<SecurityCatalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: SecurityCatalog) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    pub fn current(&self) -> Arc<SecurityCatalog> {
        self.current.read().clone()
    }

    pub fn replace(&self, catalog: SecurityCatalog) {
        *self.current.write() = Arc::new(catalog);
    }
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn catalog() -> SecurityCatalog {
        SecurityCatalog::from_toml(
            r#"
[[subscribers]]
id = "00000000-0000-0000-0000-0000000000aa"
acronym = "SUB1"
name = "Subscriber One"
shared_secret = "secret"
auth_key = "key"
valid_ip_addresses = "10.0.0.5; 127.0.0.1"

[[subscribers]]
id = "00000000-0000-0000-0000-0000000000bb"
acronym = "OFF"
valid_ip_addresses = "127.0.0.1"
enabled = false

[[measurements]]
signal_id = "00000000-0000-0000-0000-000000000001"
source = "PPA"
id = 1
point_tag = "GW:FREQ"

[[measurements]]
signal_id = "00000000-0000-0000-0000-000000000002"
source = "PPA"
id = 2
point_tag = "GW:VPHM"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_key_resolution_order() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_key("00000000-0000-0000-0000-000000000002").unwrap().id, 2);
        assert_eq!(catalog.resolve_key("ppa:1").unwrap().signal_id, signal(1));
        assert_eq!(catalog.resolve_key("GW:VPHM").unwrap().signal_id, signal(2));
        assert!(catalog.resolve_key("PPA:99").is_none());

        let keys = vec!["PPA:1".to_string(), "missing".to_string(), "GW:FREQ".to_string()];
        let resolved = catalog.resolve_keys(&keys);
        assert_eq!(resolved.len(), 1, "duplicates collapse and unknown keys are skipped");
    }

    #[test]
    fn test_subscriber_lookup_by_ip_skips_disabled() {
        let catalog = catalog();
        let found = catalog.subscriber_by_ip("127.0.0.1".parse().unwrap()).unwrap();
        assert_eq!(found.acronym, "SUB1");
        let mapped = catalog.subscriber_by_ip("::ffff:10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(mapped.acronym, "SUB1");
        assert!(catalog.subscriber_by_ip("192.168.1.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_explicit_deny_overrides_group_grants() {
        let subscriber = signal(0xaa);
        let mut catalog = catalog();
        for n in 0..3 {
            catalog.groups.push(SubscriberGroup {
                id: signal(0x100 + n),
                name: format!("group{n}"),
                members: vec![subscriber],
                rules: vec![GroupRule { signal_id: signal(1), allowed: true }],
            });
        }
        assert!(catalog.has_rights(subscriber, signal(1)));

        catalog.rules.push(ExplicitRule {
            subscriber_id: subscriber,
            signal_id: signal(1),
            allowed: false,
        });
        assert!(!catalog.has_rights(subscriber, signal(1)));
    }

    #[test]
    fn test_group_deny_and_default_refusal() {
        let subscriber = signal(0xaa);
        let mut catalog = catalog();
        catalog.groups.push(SubscriberGroup {
            id: signal(0x200),
            name: "allow".into(),
            members: vec![subscriber],
            rules: vec![GroupRule { signal_id: signal(2), allowed: true }],
        });
        catalog.groups.push(SubscriberGroup {
            id: signal(0x201),
            name: "deny".into(),
            members: vec![subscriber],
            rules: vec![GroupRule { signal_id: signal(2), allowed: false }],
        });
        assert!(!catalog.has_rights(subscriber, signal(2)));
        assert!(!catalog.has_rights(subscriber, signal(1)), "no rule means no rights");

        catalog.rules.push(ExplicitRule {
            subscriber_id: subscriber,
            signal_id: signal(2),
            allowed: true,
        });
        assert!(catalog.has_rights(subscriber, signal(2)), "explicit allow wins over group deny");
    }

    #[test]
    fn test_catalog_handle_replace() {
        let handle = CatalogHandle::new(catalog());
        let before = handle.current();
        handle.replace(SecurityCatalog::default());
        assert_eq!(before.subscribers.len(), 2);
        assert!(handle.current().subscribers.is_empty());
    }

    mod rights_properties {
        use super::*;
        use proptest::prelude::*;

        fn catalog_with(explicit_deny: bool, group_grants: &[bool]) -> (SecurityCatalog, Uuid, Uuid) {
            let subscriber = signal(0xaa);
            let target = signal(7);
            let mut catalog = SecurityCatalog::default();
            if explicit_deny {
                catalog.rules.push(ExplicitRule {
                    subscriber_id: subscriber,
                    signal_id: target,
                    allowed: false,
                });
            }
            for (n, allowed) in group_grants.iter().enumerate() {
                catalog.groups.push(SubscriberGroup {
                    id: signal(0x300 + n as u128),
                    name: format!("group{n}"),
                    members: vec![subscriber],
                    rules: vec![GroupRule { signal_id: target, allowed: *allowed }],
                });
            }
            (catalog, subscriber, target)
        }

        proptest! {
            #[test]
            fn explicit_deny_overrides_any_group_grants(grants in prop::collection::vec(any::<bool>(), 0..16)) {
                let (catalog, subscriber, target) = catalog_with(true, &grants);
                prop_assert!(!catalog.has_rights(subscriber, target));
            }

            #[test]
            fn group_rights_need_a_grant_and_no_deny(grants in prop::collection::vec(any::<bool>(), 0..16)) {
                let (catalog, subscriber, target) = catalog_with(false, &grants);
                let expected = grants.contains(&true) && !grants.contains(&false);
                prop_assert_eq!(catalog.has_rights(subscriber, target), expected);
            }
        }
    }
}
