//! Device policy: flags, fallback selections, the layered tuning merge, and
//! probe receipts.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::db::{DeviceQuirk, QuirkDatabase};
use super::fingerprint::Fingerprint;
use super::learned::LearnedProfile;
use super::tuning::{CHUNK_BYTES_MAX, EffectiveTuning, TuningOverlay};
use crate::discovery::DeviceSummary;

/// USB interface class 0x06: Still Image Capture (PTP).
pub const USB_CLASS_STILL_IMAGE: u8 = 0x06;

/// Behavior flags for one device session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuirkFlags {
    pub supports_get_object_prop_list: bool,
    pub supports_get_partial_object64: bool,
    pub supports_send_partial_object: bool,
    pub requires_kernel_detach: bool,
    pub reset_reopen_on_open_session_io_error: bool,
    pub require_stabilization: bool,
    pub write_to_subfolder_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_write_folder: Option<String>,
    pub skip_get_object_prop_value: bool,
    pub prefers_prop_list_enumeration: bool,
    pub supports_partial_read64: bool,
    pub allow_unknown_object_info_size_retry: bool,
}

/// Flag overrides from a quirk record; unset fields leave the merge result
/// alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_get_object_prop_list: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_get_partial_object64: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_send_partial_object: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_kernel_detach: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_reopen_on_open_session_io_error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_stabilization: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_to_subfolder_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_write_folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_get_object_prop_value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefers_prop_list_enumeration: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_partial_read64: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unknown_object_info_size_retry: Option<bool>,
}

impl FlagOverlay {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, flags: &mut QuirkFlags) {
        macro_rules! set {
            ($field:ident) => {
                if let Some(v) = self.$field.clone() {
                    flags.$field = v;
                }
            };
        }
        set!(supports_get_object_prop_list);
        set!(supports_get_partial_object64);
        set!(supports_send_partial_object);
        set!(requires_kernel_detach);
        set!(reset_reopen_on_open_session_io_error);
        set!(require_stabilization);
        set!(write_to_subfolder_only);
        if self.preferred_write_folder.is_some() {
            flags.preferred_write_folder = self.preferred_write_folder.clone();
        }
        set!(skip_get_object_prop_value);
        set!(prefers_prop_list_enumeration);
        set!(supports_partial_read64);
        set!(allow_unknown_object_info_size_retry);
    }
}

/// How to enumerate a directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnumerationStrategy {
    #[default]
    Unknown,
    PropList5,
    PropList3,
    HandlesThenInfo,
}

/// How to read object bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadStrategy {
    #[default]
    Unknown,
    Partial64,
    Partial32,
    WholeObject,
}

/// How to write object bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteStrategy {
    #[default]
    Unknown,
    Partial,
    WholeObject,
}

/// The strategies the fallback ladders have settled on so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackSelections {
    pub enumeration: EnumerationStrategy,
    pub read: ReadStrategy,
    pub write: WriteStrategy,
}

/// Capability booleans derived from cheap probes during session open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityProbe {
    pub partial_read64: bool,
    pub partial_write: bool,
    pub supports_large_transfers: bool,
    pub is_slow_device: bool,
    pub needs_stabilization: bool,
}

/// Where each part of a policy came from, for receipts and debugging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyProvenance {
    pub layers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quirk_id: Option<String>,
    pub safe_mode: bool,
    pub strict: bool,
}

/// The in-effect policy for one device session. Mutable: the actor may
/// auto-disable flags mid-session; a fresh connect builds a fresh value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePolicy {
    pub tuning: EffectiveTuning,
    pub flags: QuirkFlags,
    pub selections: FallbackSelections,
    /// Per-operation capability overrides from the quirk record, keyed by
    /// operation name (e.g. `"getObjectPropList"`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub operations: BTreeMap<String, bool>,
    pub provenance: PolicyProvenance,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            tuning: EffectiveTuning::default(),
            flags: QuirkFlags::default(),
            selections: FallbackSelections::default(),
            operations: BTreeMap::new(),
            provenance: PolicyProvenance::default(),
        }
    }
}

/// Inputs to the policy build beyond the probe layers themselves.
#[derive(Debug, Clone, Default)]
pub struct PolicyOptions {
    /// Skip the learned profile and quirk database layers.
    pub strict: bool,
    /// Overwrite the result with the safe-mode constants.
    pub safe_mode: bool,
    /// Quirk ids excluded from matching.
    pub denied_quirks: Vec<String>,
    /// User tuning overrides, the last merge layer.
    pub user_overrides: Option<TuningOverlay>,
}

/// Builds the effective policy for one session: a strict later-wins merge of
/// defaults, probe, learned profile, static quirk, and user overrides,
/// followed by safe mode and the clamps.
pub fn build_policy(
    fingerprint: &Fingerprint,
    probe: Option<&CapabilityProbe>,
    learned: Option<&LearnedProfile>,
    db: &QuirkDatabase,
    opts: &PolicyOptions,
) -> DevicePolicy {
    let mut tuning = EffectiveTuning::default();
    let mut flags = QuirkFlags::default();
    let mut operations = BTreeMap::new();
    let mut provenance = PolicyProvenance {
        layers: vec!["defaults".to_string()],
        quirk_id: None,
        safe_mode: opts.safe_mode,
        strict: opts.strict,
    };

    // Layer 2: capability probe. May raise flags and grow the chunk size by
    // at most 2x.
    if let Some(probe) = probe {
        apply_probe(probe, &mut tuning, &mut flags);
        provenance.layers.push("probe".to_string());
    }

    // Layer 3: learned profile, skipped in strict mode.
    if !opts.strict {
        if let Some(profile) = learned {
            apply_learned(profile, &mut tuning);
            provenance.layers.push("learned".to_string());
        }
    }

    // Layer 4: static quirk, skipped in strict mode; denied ids excluded.
    let mut quirk_matched = false;
    if !opts.strict {
        if let Some(quirk) = db.find_match(fingerprint, &opts.denied_quirks) {
            quirk.tuning.apply(&mut tuning);
            quirk.flags.apply(&mut flags);
            operations.extend(quirk.operations.clone());
            tuning.hooks.extend(quirk.hooks.iter().cloned());
            provenance.layers.push(format!("quirk:{}", quirk.id));
            provenance.quirk_id = Some(quirk.id.clone());
            quirk_matched = true;
        }
    }

    // Class heuristic when nothing matched: a 0x06 interface is a
    // spec-compliant PTP camera until proven otherwise; vendor-class and
    // unknown interfaces get conservative defaults.
    if !quirk_matched {
        if fingerprint.interface_class == USB_CLASS_STILL_IMAGE {
            flags.supports_get_object_prop_list = true;
            flags.prefers_prop_list_enumeration = true;
            flags.requires_kernel_detach = false;
            provenance.layers.push("heuristic:still-image".to_string());
        } else {
            provenance.layers.push("heuristic:conservative".to_string());
        }
    }

    // Layer 5: user overrides always win.
    if let Some(user) = &opts.user_overrides {
        if !user.is_empty() {
            user.apply(&mut tuning);
            provenance.layers.push("user".to_string());
        }
    }

    if opts.safe_mode {
        tuning.apply_safe_mode();
        flags.supports_get_partial_object64 = false;
        flags.supports_send_partial_object = false;
        flags.supports_partial_read64 = false;
        provenance.layers.push("safe-mode".to_string());
    }

    tuning.clamp();

    let policy = DevicePolicy {
        tuning,
        flags,
        selections: FallbackSelections::default(),
        operations,
        provenance,
    };
    info!(
        "policy for {}: layers=[{}] chunk={} ioTimeout={}ms",
        fingerprint.hash_string(),
        policy.provenance.layers.join(", "),
        policy.tuning.max_chunk_bytes,
        policy.tuning.io_timeout_ms,
    );
    policy
}

fn apply_probe(probe: &CapabilityProbe, tuning: &mut EffectiveTuning, flags: &mut QuirkFlags) {
    if probe.partial_read64 {
        flags.supports_get_partial_object64 = true;
        flags.supports_partial_read64 = true;
    }
    if probe.partial_write {
        flags.supports_send_partial_object = true;
    }
    if probe.supports_large_transfers {
        tuning.max_chunk_bytes = tuning.max_chunk_bytes.saturating_mul(2).min(CHUNK_BYTES_MAX);
    }
    if probe.is_slow_device {
        tuning.io_timeout_ms = tuning.io_timeout_ms.saturating_mul(2);
    }
    if probe.needs_stabilization {
        flags.require_stabilization = true;
        if tuning.stabilize_ms == 0 {
            tuning.stabilize_ms = 500;
        }
    }
    debug!("probe applied: {probe:?}");
}

fn apply_learned(profile: &LearnedProfile, tuning: &mut EffectiveTuning) {
    // Only trust a profile with a few sessions behind it.
    if profile.sample_count < 3 {
        debug!("learned profile ignored: only {} samples", profile.sample_count);
        return;
    }
    if profile.optimal_chunk_size > 0.0 {
        tuning.max_chunk_bytes = profile.optimal_chunk_size as u32;
    }
    if profile.optimal_io_timeout_ms > 0.0 {
        tuning.io_timeout_ms = profile.optimal_io_timeout_ms as u64;
    }
}

/// Diagnostic record of one session open, emitted for support tooling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReceipt {
    pub device: DeviceSummary,
    pub fingerprint: String,
    pub capabilities: CapabilityProbe,
    pub selections: FallbackSelections,
    /// Per-stage timings in milliseconds (usb-open, claim, probe, session).
    pub timings_ms: BTreeMap<String, u64>,
    /// What the pre-session (descriptor + GetDeviceInfo) probe concluded.
    pub interface_probe: String,
    /// What the post-open (wire) probe concluded.
    pub session_probe: String,
    pub policy: PolicySummary,
}

/// The policy facts worth echoing in a receipt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySummary {
    pub layers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quirk_id: Option<String>,
    pub max_chunk_bytes: u32,
    pub io_timeout_ms: u64,
    pub prop_list_enumeration: bool,
    pub partial_read64: bool,
    pub partial_write: bool,
}

impl PolicySummary {
    pub fn of(policy: &DevicePolicy) -> Self {
        Self {
            layers: policy.provenance.layers.clone(),
            quirk_id: policy.provenance.quirk_id.clone(),
            max_chunk_bytes: policy.tuning.max_chunk_bytes,
            io_timeout_ms: policy.tuning.io_timeout_ms,
            prop_list_enumeration: policy.flags.supports_get_object_prop_list,
            partial_read64: policy.flags.supports_get_partial_object64,
            partial_write: policy.flags.supports_send_partial_object,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quirks::tuning::{
        IO_TIMEOUT_MAX_MS, SAFE_IO_TIMEOUT_MS, SAFE_MAX_CHUNK_BYTES,
    };
    use crate::transport::TransportDescriptor;

    fn fingerprint(vid: u16, class: u8) -> Fingerprint {
        Fingerprint::from_descriptor(&TransportDescriptor {
            vid,
            pid: 0x6860,
            bcd_device: None,
            interface_class: class,
            interface_subclass: 1,
            interface_protocol: 1,
            ep_in: 0x81,
            ep_out: 0x01,
            ep_event: None,
        })
    }

    fn quirk_db() -> QuirkDatabase {
        QuirkDatabase::from_json_str(
            r#"{
                "schemaVersion": "2.0",
                "entries": [
                    {
                        "id": "samsung-chunky",
                        "match": { "vid": "04e8" },
                        "tuning": { "maxChunkBytes": 262144, "ioTimeoutMs": 25000 },
                        "flags": { "supportsGetObjectPropList": true },
                        "operations": { "getObjectPropList": true },
                        "confidence": "high",
                        "status": "stable"
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_layered_merge_later_wins() {
        let opts = PolicyOptions {
            user_overrides: TuningOverlay::parse("ioTimeoutMs=12000"),
            ..Default::default()
        };
        let policy = build_policy(&fingerprint(0x04E8, 6), None, None, &quirk_db(), &opts);
        // Quirk set both values; the user layer overrode one of them.
        assert_eq!(policy.tuning.max_chunk_bytes, 262_144);
        assert_eq!(policy.tuning.io_timeout_ms, 12_000);
        assert_eq!(policy.provenance.quirk_id.as_deref(), Some("samsung-chunky"));
        assert_eq!(policy.operations.get("getObjectPropList"), Some(&true));
    }

    #[test]
    fn test_strict_mode_skips_learned_and_quirk() {
        let learned = LearnedProfile {
            optimal_chunk_size: 4_194_304.0,
            avg_handshake_ms: 0.0,
            optimal_io_timeout_ms: 30_000.0,
            p95_read_throughput_mbps: 0.0,
            p95_write_throughput_mbps: 0.0,
            success_rate: 1.0,
            sample_count: 10,
        };
        let opts = PolicyOptions { strict: true, ..Default::default() };
        let policy =
            build_policy(&fingerprint(0x04E8, 6), None, Some(&learned), &quirk_db(), &opts);
        assert_eq!(policy.tuning.max_chunk_bytes, EffectiveTuning::default().max_chunk_bytes);
        assert!(policy.provenance.quirk_id.is_none());
        assert!(!policy.provenance.layers.iter().any(|l| l.starts_with("quirk")));
        assert!(!policy.provenance.layers.contains(&"learned".to_string()));
    }

    #[test]
    fn test_safe_mode_constants_and_flags() {
        let probe = CapabilityProbe {
            partial_read64: true,
            partial_write: true,
            supports_large_transfers: true,
            ..Default::default()
        };
        let opts = PolicyOptions { safe_mode: true, ..Default::default() };
        let policy = build_policy(
            &fingerprint(0x18D1, 6),
            Some(&probe),
            None,
            &QuirkDatabase::empty(),
            &opts,
        );
        assert_eq!(policy.tuning.max_chunk_bytes, SAFE_MAX_CHUNK_BYTES);
        assert_eq!(policy.tuning.io_timeout_ms, SAFE_IO_TIMEOUT_MS);
        assert_eq!(policy.tuning.handshake_timeout_ms, 15_000);
        assert_eq!(policy.tuning.inactivity_timeout_ms, 20_000);
        assert_eq!(policy.tuning.overall_deadline_ms, 300_000);
        assert!(!policy.flags.supports_get_partial_object64);
        assert!(!policy.flags.supports_send_partial_object);
        assert!(!policy.flags.supports_partial_read64);
    }

    #[test]
    fn test_clamps_always_hold() {
        let opts = PolicyOptions {
            user_overrides: TuningOverlay::parse("maxChunkBytes=1,ioTimeoutMs=999999"),
            ..Default::default()
        };
        let policy =
            build_policy(&fingerprint(0x1234, 0xFF), None, None, &QuirkDatabase::empty(), &opts);
        assert_eq!(policy.tuning.max_chunk_bytes, 131_072);
        assert_eq!(policy.tuning.io_timeout_ms, IO_TIMEOUT_MAX_MS);
    }

    #[test]
    fn test_still_image_heuristic_without_quirk() {
        let policy = build_policy(
            &fingerprint(0x04A9, 0x06),
            None,
            None,
            &QuirkDatabase::empty(),
            &PolicyOptions::default(),
        );
        assert!(policy.flags.supports_get_object_prop_list);
        assert!(policy.flags.prefers_prop_list_enumeration);
        assert!(!policy.flags.requires_kernel_detach);
    }

    #[test]
    fn test_vendor_class_gets_conservative_defaults() {
        let policy = build_policy(
            &fingerprint(0x2717, 0xFF),
            None,
            None,
            &QuirkDatabase::empty(),
            &PolicyOptions::default(),
        );
        assert!(!policy.flags.supports_get_object_prop_list);
        assert!(!policy.flags.prefers_prop_list_enumeration);
        assert!(!policy.flags.requires_kernel_detach);
    }

    #[test]
    fn test_quirk_suppresses_heuristic() {
        // The Samsung quirk matches, so the class heuristic must not run;
        // flags come from the quirk alone.
        let policy = build_policy(
            &fingerprint(0x04E8, 0xFF),
            None,
            None,
            &quirk_db(),
            &PolicyOptions::default(),
        );
        assert!(policy.flags.supports_get_object_prop_list);
        assert!(!policy.flags.prefers_prop_list_enumeration);
    }

    #[test]
    fn test_denied_quirk_falls_back_to_heuristic() {
        let opts = PolicyOptions {
            denied_quirks: vec!["samsung-chunky".to_string()],
            ..Default::default()
        };
        let policy = build_policy(&fingerprint(0x04E8, 0x06), None, None, &quirk_db(), &opts);
        assert!(policy.provenance.quirk_id.is_none());
        assert!(policy.flags.prefers_prop_list_enumeration);
    }

    #[test]
    fn test_probe_raises_chunk_at_most_2x() {
        let probe = CapabilityProbe { supports_large_transfers: true, ..Default::default() };
        let policy = build_policy(
            &fingerprint(0x18D1, 6),
            Some(&probe),
            None,
            &QuirkDatabase::empty(),
            &PolicyOptions::default(),
        );
        assert_eq!(policy.tuning.max_chunk_bytes, EffectiveTuning::default().max_chunk_bytes * 2);
    }

    #[test]
    fn test_learned_profile_needs_samples() {
        let thin = LearnedProfile {
            optimal_chunk_size: 8_000_000.0,
            avg_handshake_ms: 0.0,
            optimal_io_timeout_ms: 0.0,
            p95_read_throughput_mbps: 0.0,
            p95_write_throughput_mbps: 0.0,
            success_rate: 1.0,
            sample_count: 1,
        };
        let policy = build_policy(
            &fingerprint(0x18D1, 6),
            None,
            Some(&thin),
            &QuirkDatabase::empty(),
            &PolicyOptions::default(),
        );
        assert_eq!(policy.tuning.max_chunk_bytes, EffectiveTuning::default().max_chunk_bytes);
    }

    #[test]
    fn test_fresh_policy_restores_heuristic_defaults() {
        // Simulates the contract that in-session auto-disables don't persist:
        // building a new policy starts from the heuristic again.
        let fp = fingerprint(0x18D1, 0x06);
        let mut policy = build_policy(
            &fp,
            None,
            None,
            &QuirkDatabase::empty(),
            &PolicyOptions::default(),
        );
        policy.flags.supports_get_object_prop_list = false; // in-session auto-disable
        let fresh = build_policy(
            &fp,
            None,
            None,
            &QuirkDatabase::empty(),
            &PolicyOptions::default(),
        );
        assert!(fresh.flags.supports_get_object_prop_list);
    }
}
