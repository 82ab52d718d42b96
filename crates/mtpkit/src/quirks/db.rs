//! The static quirk database: JSON records describing how specific devices
//! deviate from the spec and what to do about it.

use std::collections::BTreeMap;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::fingerprint::Fingerprint;
use super::policy::FlagOverlay;
use super::tuning::{PhaseHook, TuningOverlay};
use crate::error::Error;

/// Schema versions this build understands. Anything else fails the load:
/// silently dropping fields from a future schema is how quirks stop working.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0", "2.0"];

/// How much field evidence backs a quirk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Lifecycle of a quirk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuirkStatus {
    Experimental,
    Stable,
    Promoted,
}

/// Interface-triple match criteria; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfaceMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subclass: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u8>,
}

/// What a quirk matches on. The vendor id is always required; everything
/// else narrows the match and raises specificity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCriteria {
    #[serde(with = "hex_u16")]
    pub vid: u16,
    #[serde(default, with = "hex_u16_opt", skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    #[serde(default, with = "hex_u16_opt", skip_serializing_if = "Option::is_none")]
    pub bcd_device: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iface: Option<IfaceMatch>,
}

impl MatchCriteria {
    /// Count of populated match fields; the specificity score.
    pub fn specificity(&self) -> u32 {
        let iface = self.iface.as_ref();
        1 + u32::from(self.pid.is_some())
            + u32::from(self.bcd_device.is_some())
            + iface.map_or(0, |i| {
                u32::from(i.class.is_some())
                    + u32::from(i.subclass.is_some())
                    + u32::from(i.protocol.is_some())
            })
    }

    pub fn matches(&self, fp: &Fingerprint) -> bool {
        if self.vid != fp.vid {
            return false;
        }
        if self.pid.is_some_and(|pid| pid != fp.pid) {
            return false;
        }
        if self.bcd_device.is_some() && self.bcd_device != fp.bcd_device {
            return false;
        }
        if let Some(iface) = &self.iface {
            if iface.class.is_some_and(|c| c != fp.interface_class) {
                return false;
            }
            if iface.subclass.is_some_and(|s| s != fp.interface_subclass) {
                return false;
            }
            if iface.protocol.is_some_and(|p| p != fp.interface_protocol) {
                return false;
            }
        }
        true
    }
}

/// One quirk database record. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceQuirk {
    pub id: String,
    #[serde(rename = "match")]
    pub match_on: MatchCriteria,
    #[serde(default, skip_serializing_if = "TuningOverlay::is_empty")]
    pub tuning: TuningOverlay,
    #[serde(default, skip_serializing_if = "FlagOverlay::is_empty")]
    pub flags: FlagOverlay,
    /// Per-operation capability overrides, keyed by operation name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub operations: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<PhaseHook>,
    pub confidence: Confidence,
    pub status: QuirkStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_required: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verified_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuirkFile {
    schema_version: String,
    entries: Vec<DeviceQuirk>,
}

/// The loaded database. Read-only; every device holds a shared reference.
#[derive(Debug, Default)]
pub struct QuirkDatabase {
    entries: Vec<DeviceQuirk>,
}

impl QuirkDatabase {
    /// An empty database: no quirks, heuristics only.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The curated database shipped with the crate.
    pub fn builtin() -> Self {
        Self::from_json_str(include_str!("../../data/quirks.json"))
            .expect("bundled quirk database must parse")
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let file: QuirkFile = serde_json::from_str(json)
            .map_err(|e| Error::Malformed(format!("quirk database: {e}")))?;
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&file.schema_version.as_str()) {
            return Err(Error::Malformed(format!(
                "quirk database schema version {:?} is not supported",
                file.schema_version
            )));
        }
        for entry in &file.entries {
            if entry.status == QuirkStatus::Promoted
                && (entry.evidence_required.is_empty()
                    || entry.last_verified_date.is_none()
                    || entry.last_verified_by.is_none())
            {
                return Err(Error::Malformed(format!(
                    "promoted quirk {:?} is missing verification metadata",
                    entry.id
                )));
            }
        }
        info!("quirk database loaded: {} entries", file.entries.len());
        Ok(Self { entries: file.entries })
    }

    pub async fn load(path: &Path) -> Result<Self, Error> {
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[DeviceQuirk] {
        &self.entries
    }

    /// The matching record with the highest specificity score. Ties keep
    /// the earlier record. `denied` ids are skipped entirely.
    pub fn find_match(&self, fp: &Fingerprint, denied: &[String]) -> Option<&DeviceQuirk> {
        let mut best: Option<(&DeviceQuirk, u32)> = None;
        for entry in &self.entries {
            if denied.iter().any(|d| d == &entry.id) {
                debug!("quirk {} denied by user, skipping", entry.id);
                continue;
            }
            if !entry.match_on.matches(fp) {
                continue;
            }
            let score = entry.match_on.specificity();
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((entry, score)),
            }
        }
        if let Some((entry, score)) = best {
            debug!("quirk match: {} (specificity {score})", entry.id);
        }
        best.map(|(entry, _)| entry)
    }
}

/// Hex-string (de)serialization for USB ids: `"04e8"`, optionally `0x`-prefixed.
mod hex_u16 {
    use super::*;

    pub fn serialize<S: Serializer>(value: &u16, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format!("{value:04x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<u16, D::Error> {
        let s = String::deserialize(de)?;
        parse_hex(&s).ok_or_else(|| serde::de::Error::custom(format!("bad hex id {s:?}")))
    }

    pub(super) fn parse_hex(s: &str) -> Option<u16> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        u16::from_str_radix(digits, 16).ok()
    }
}

mod hex_u16_opt {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u16>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => ser.serialize_some(&format!("{v:04x}")),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u16>, D::Error> {
        let s: Option<String> = Option::deserialize(de)?;
        match s {
            None => Ok(None),
            Some(s) => super::hex_u16::parse_hex(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("bad hex id {s:?}"))),
        }
    }
}
