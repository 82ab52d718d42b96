//! Device fingerprinting: the stable identity used to look up quirks and
//! learned profiles.

use serde::{Deserialize, Serialize};

use crate::transport::TransportDescriptor;

/// Everything descriptor-derived that identifies "this kind of device on
/// this kind of interface". Any change here must invalidate learned state,
/// which falls out of using [`Fingerprint::hash_string`] as the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub vid: u16,
    pub pid: u16,
    pub bcd_device: Option<u16>,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub ep_in: u8,
    pub ep_out: u8,
    pub ep_event: Option<u8>,
}

impl Fingerprint {
    pub fn from_descriptor(d: &TransportDescriptor) -> Self {
        Self {
            vid: d.vid,
            pid: d.pid,
            bcd_device: d.bcd_device,
            interface_class: d.interface_class,
            interface_subclass: d.interface_subclass,
            interface_protocol: d.interface_protocol,
            ep_in: d.ep_in,
            ep_out: d.ep_out,
            ep_event: d.ep_event,
        }
    }

    /// Deterministic string form: identity fields joined with a stable
    /// separator, all hex lowercase. Used as the learned-profile key and in
    /// probe receipts.
    pub fn hash_string(&self) -> String {
        let bcd = match self.bcd_device {
            Some(v) => format!("{v:04x}"),
            None => "----".to_string(),
        };
        let ep_event = match self.ep_event {
            Some(v) => format!("{v:02x}"),
            None => "--".to_string(),
        };
        format!(
            "{:04x}:{:04x}:{}|{:02x}.{:02x}.{:02x}|{:02x}:{:02x}:{}",
            self.vid,
            self.pid,
            bcd,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            self.ep_in,
            self.ep_out,
            ep_event,
        )
    }
}

/// The coarse discovery-time fingerprint: `"vvvv:pppp"` lowercase, or
/// `"unknown"` when either id is missing.
pub fn summary_fingerprint(vid: Option<u16>, pid: Option<u16>) -> String {
    match (vid, pid) {
        (Some(v), Some(p)) => format!("{v:04x}:{p:04x}"),
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TransportDescriptor {
        TransportDescriptor {
            vid: 0x18D1,
            pid: 0x4EE1,
            bcd_device: Some(0x0440),
            interface_class: 0x06,
            interface_subclass: 0x01,
            interface_protocol: 0x01,
            ep_in: 0x81,
            ep_out: 0x01,
            ep_event: Some(0x82),
        }
    }

    #[test]
    fn test_hash_string_deterministic_and_lowercase() {
        let fp = Fingerprint::from_descriptor(&descriptor());
        let hash = fp.hash_string();
        assert_eq!(hash, "18d1:4ee1:0440|06.01.01|81:01:82");
        assert_eq!(hash, fp.hash_string());
    }

    #[test]
    fn test_hash_string_placeholders_for_missing_fields() {
        let mut d = descriptor();
        d.bcd_device = None;
        d.ep_event = None;
        let hash = Fingerprint::from_descriptor(&d).hash_string();
        assert_eq!(hash, "18d1:4ee1:----|06.01.01|81:01:--");
    }

    #[test]
    fn test_hash_changes_with_identity() {
        let base = Fingerprint::from_descriptor(&descriptor());
        let mut other = base.clone();
        other.bcd_device = Some(0x0441);
        assert_ne!(base.hash_string(), other.hash_string());
    }

    #[test]
    fn test_summary_fingerprint() {
        assert_eq!(summary_fingerprint(Some(0x18D1), Some(0x4EE1)), "18d1:4ee1");
        assert_eq!(summary_fingerprint(None, Some(1)), "unknown");
        assert_eq!(summary_fingerprint(Some(1), None), "unknown");
    }
}
