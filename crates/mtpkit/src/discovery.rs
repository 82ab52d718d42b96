//! Device discovery types: summaries of attached devices and the
//! attach/detach stream the registry monitors.

use serde::{Deserialize, Serialize};

use crate::quirks::summary_fingerprint;

/// Stable identifier for one attached device: `mtp-{bus}-{address}`.
pub type DeviceId = String;

/// What discovery knows about a device before a session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    /// Format: `mtp-{bus}-{address}`. Stable for a given port until replug.
    pub id: DeviceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    pub bus: String,
    pub address: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_serial: Option<String>,
}

impl DeviceSummary {
    pub fn make_id(bus: &str, address: u8) -> DeviceId {
        format!("mtp-{bus}-{address}")
    }

    /// The coarse quirk-lookup fingerprint: `"vvvv:pppp"` or `"unknown"`.
    pub fn fingerprint(&self) -> String {
        summary_fingerprint(self.vendor_id, self.product_id)
    }

    /// Display name: model, else manufacturer, else ids.
    pub fn display_name(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        if let Some(manufacturer) = &self.manufacturer {
            return format!("{manufacturer} device");
        }
        match (self.vendor_id, self.product_id) {
            (Some(v), Some(p)) => format!("MTP device ({v:04x}:{p:04x})"),
            _ => "MTP device".to_string(),
        }
    }
}

/// One change on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Attached(DeviceSummary),
    Detached(DeviceId),
}
