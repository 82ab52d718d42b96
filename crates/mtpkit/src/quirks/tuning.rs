//! Effective tuning values and the layered merge that produces them.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

/// Clamping bounds, applied at the end of every merge and on every mutation.
pub const CHUNK_BYTES_MIN: u32 = 131_072;
pub const CHUNK_BYTES_MAX: u32 = 16_777_216;
pub const IO_TIMEOUT_MIN_MS: u64 = 1_000;
pub const IO_TIMEOUT_MAX_MS: u64 = 60_000;

/// Safe-mode constants. Chosen to work on everything ever seen, at the cost
/// of speed.
pub const SAFE_MAX_CHUNK_BYTES: u32 = 131_072;
pub const SAFE_IO_TIMEOUT_MS: u64 = 30_000;
pub const SAFE_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;
pub const SAFE_INACTIVITY_TIMEOUT_MS: u64 = 20_000;
pub const SAFE_OVERALL_DEADLINE_MS: u64 = 300_000;

/// Session-open phases a quirk hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuirkPhase {
    PostOpenUsb,
    PostClaimInterface,
    PostOpenSession,
    BeforeGetDeviceInfo,
    BeforeGetStorageIds,
    BeforeTransfer,
    AfterTransfer,
    OnDeviceBusy,
}

/// Backoff parameters a hook can override for busy handling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffSpec {
    pub retries: u32,
    pub base_ms: u64,
    pub jitter_pct: f64,
}

/// A phase-indexed hook from the quirk database: an extra settle delay, a
/// backoff override, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseHook {
    pub phase: QuirkPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_backoff: Option<BackoffSpec>,
}

/// The tuning values every I/O decision reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveTuning {
    pub max_chunk_bytes: u32,
    pub io_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub inactivity_timeout_ms: u64,
    pub overall_deadline_ms: u64,
    pub stabilize_ms: u64,
    pub post_claim_stabilize_ms: u64,
    pub post_probe_stabilize_ms: u64,
    pub reset_on_open: bool,
    pub disable_event_pump: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<PhaseHook>,
}

impl Default for EffectiveTuning {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 1_048_576,
            io_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            inactivity_timeout_ms: 10_000,
            overall_deadline_ms: 120_000,
            stabilize_ms: 0,
            post_claim_stabilize_ms: 0,
            post_probe_stabilize_ms: 0,
            reset_on_open: false,
            disable_event_pump: false,
            hooks: Vec::new(),
        }
    }
}

impl EffectiveTuning {
    /// Applies the clamping bounds in place. Must run after every merge and
    /// every mutation of a live policy.
    pub fn clamp(&mut self) {
        self.max_chunk_bytes = self.max_chunk_bytes.clamp(CHUNK_BYTES_MIN, CHUNK_BYTES_MAX);
        self.io_timeout_ms = self.io_timeout_ms.clamp(IO_TIMEOUT_MIN_MS, IO_TIMEOUT_MAX_MS);
        // The remaining timeouts only need to be non-negative, which u64
        // already guarantees; zero means "disabled" for the stabilize knobs.
    }

    /// Overwrites the throughput-relevant values with the safe-mode
    /// constants, keeping hooks and stabilize delays.
    pub fn apply_safe_mode(&mut self) {
        self.max_chunk_bytes = SAFE_MAX_CHUNK_BYTES;
        self.io_timeout_ms = SAFE_IO_TIMEOUT_MS;
        self.handshake_timeout_ms = SAFE_HANDSHAKE_TIMEOUT_MS;
        self.inactivity_timeout_ms = SAFE_INACTIVITY_TIMEOUT_MS;
        self.overall_deadline_ms = SAFE_OVERALL_DEADLINE_MS;
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn overall_deadline(&self) -> Duration {
        Duration::from_millis(self.overall_deadline_ms)
    }

    /// Hooks attached to `phase`, in database order.
    pub fn hooks_for(&self, phase: QuirkPhase) -> impl Iterator<Item = &PhaseHook> {
        self.hooks.iter().filter(move |h| h.phase == phase)
    }
}

/// One layer of the merge: only populated fields override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunk_bytes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactivity_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_deadline_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilize_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_claim_stabilize_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_probe_stabilize_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_on_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_event_pump: Option<bool>,
}

impl TuningOverlay {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Later-wins application onto `tuning`.
    pub fn apply(&self, tuning: &mut EffectiveTuning) {
        if let Some(v) = self.max_chunk_bytes {
            tuning.max_chunk_bytes = v;
        }
        if let Some(v) = self.io_timeout_ms {
            tuning.io_timeout_ms = v;
        }
        if let Some(v) = self.handshake_timeout_ms {
            tuning.handshake_timeout_ms = v;
        }
        if let Some(v) = self.inactivity_timeout_ms {
            tuning.inactivity_timeout_ms = v;
        }
        if let Some(v) = self.overall_deadline_ms {
            tuning.overall_deadline_ms = v;
        }
        if let Some(v) = self.stabilize_ms {
            tuning.stabilize_ms = v;
        }
        if let Some(v) = self.post_claim_stabilize_ms {
            tuning.post_claim_stabilize_ms = v;
        }
        if let Some(v) = self.post_probe_stabilize_ms {
            tuning.post_probe_stabilize_ms = v;
        }
        if let Some(v) = self.reset_on_open {
            tuning.reset_on_open = v;
        }
        if let Some(v) = self.disable_event_pump {
            tuning.disable_event_pump = v;
        }
    }

    /// Parses a `key=value,key=value` user-override string. Any malformed
    /// pair invalidates the whole string: half-applied overrides are worse
    /// than none.
    pub fn parse(s: &str) -> Option<TuningOverlay> {
        let mut overlay = TuningOverlay::default();
        if s.trim().is_empty() {
            return Some(overlay);
        }
        for pair in s.split(',') {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => {
                    warn!("tuning override ignored: malformed pair {pair:?}");
                    return None;
                }
            };
            let ok = match key {
                "maxChunkBytes" => parse_into(value, &mut overlay.max_chunk_bytes),
                "ioTimeoutMs" => parse_into(value, &mut overlay.io_timeout_ms),
                "handshakeTimeoutMs" => parse_into(value, &mut overlay.handshake_timeout_ms),
                "inactivityTimeoutMs" => parse_into(value, &mut overlay.inactivity_timeout_ms),
                "overallDeadlineMs" => parse_into(value, &mut overlay.overall_deadline_ms),
                "stabilizeMs" => parse_into(value, &mut overlay.stabilize_ms),
                "resetOnOpen" => parse_into(value, &mut overlay.reset_on_open),
                "disableEventPump" => parse_into(value, &mut overlay.disable_event_pump),
                _ => {
                    warn!("tuning override ignored: unknown key {key:?}");
                    false
                }
            };
            if !ok {
                return None;
            }
        }
        Some(overlay)
    }
}

fn parse_into<V: std::str::FromStr>(value: &str, slot: &mut Option<V>) -> bool {
    match value.parse() {
        Ok(v) => {
            *slot = Some(v);
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_bounds() {
        let mut t = EffectiveTuning { max_chunk_bytes: 1, io_timeout_ms: 1, ..Default::default() };
        t.clamp();
        assert_eq!(t.max_chunk_bytes, CHUNK_BYTES_MIN);
        assert_eq!(t.io_timeout_ms, IO_TIMEOUT_MIN_MS);

        let mut t = EffectiveTuning {
            max_chunk_bytes: u32::MAX,
            io_timeout_ms: u64::MAX,
            ..Default::default()
        };
        t.clamp();
        assert_eq!(t.max_chunk_bytes, CHUNK_BYTES_MAX);
        assert_eq!(t.io_timeout_ms, IO_TIMEOUT_MAX_MS);
    }

    #[test]
    fn test_safe_mode_constants_verbatim() {
        let mut t = EffectiveTuning {
            max_chunk_bytes: 8_388_608,
            io_timeout_ms: 5_000,
            handshake_timeout_ms: 2_000,
            inactivity_timeout_ms: 5_000,
            overall_deadline_ms: 60_000,
            ..Default::default()
        };
        t.apply_safe_mode();
        assert_eq!(t.max_chunk_bytes, 131_072);
        assert_eq!(t.io_timeout_ms, 30_000);
        assert_eq!(t.handshake_timeout_ms, 15_000);
        assert_eq!(t.inactivity_timeout_ms, 20_000);
        assert_eq!(t.overall_deadline_ms, 300_000);
    }

    #[test]
    fn test_overlay_later_wins_per_field() {
        let mut t = EffectiveTuning::default();
        let first = TuningOverlay {
            max_chunk_bytes: Some(262_144),
            io_timeout_ms: Some(20_000),
            ..Default::default()
        };
        let second =
            TuningOverlay { max_chunk_bytes: Some(524_288), ..Default::default() };
        first.apply(&mut t);
        second.apply(&mut t);
        // Field touched by the later layer takes its value; untouched field
        // keeps the earlier layer's.
        assert_eq!(t.max_chunk_bytes, 524_288);
        assert_eq!(t.io_timeout_ms, 20_000);
    }

    #[test]
    fn test_parse_overrides() {
        let overlay = TuningOverlay::parse("maxChunkBytes=2097152,ioTimeoutMs=20000").unwrap();
        assert_eq!(overlay.max_chunk_bytes, Some(2_097_152));
        assert_eq!(overlay.io_timeout_ms, Some(20_000));
        assert_eq!(overlay.handshake_timeout_ms, None);
    }

    #[test]
    fn test_parse_overrides_with_spaces() {
        let overlay = TuningOverlay::parse(" maxChunkBytes = 262144 , resetOnOpen = true ").unwrap();
        assert_eq!(overlay.max_chunk_bytes, Some(262_144));
        assert_eq!(overlay.reset_on_open, Some(true));
    }

    #[test]
    fn test_parse_malformed_yields_no_overrides() {
        assert_eq!(TuningOverlay::parse("maxChunkBytes"), None);
        assert_eq!(TuningOverlay::parse("maxChunkBytes=abc"), None);
        assert_eq!(TuningOverlay::parse("unknownKey=5"), None);
        // One bad pair poisons the lot.
        assert_eq!(TuningOverlay::parse("ioTimeoutMs=5000,maxChunkBytes=abc"), None);
    }

    #[test]
    fn test_parse_empty_is_empty_overlay() {
        let overlay = TuningOverlay::parse("").unwrap();
        assert!(overlay.is_empty());
    }

    #[test]
    fn test_hooks_for_filters_by_phase() {
        let t = EffectiveTuning {
            hooks: vec![
                PhaseHook { phase: QuirkPhase::PostOpenSession, delay_ms: Some(100), busy_backoff: None },
                PhaseHook { phase: QuirkPhase::BeforeTransfer, delay_ms: Some(50), busy_backoff: None },
                PhaseHook { phase: QuirkPhase::PostOpenSession, delay_ms: Some(200), busy_backoff: None },
            ],
            ..Default::default()
        };
        let delays: Vec<_> =
            t.hooks_for(QuirkPhase::PostOpenSession).map(|h| h.delay_ms.unwrap()).collect();
        assert_eq!(delays, vec![100, 200]);
    }
}
