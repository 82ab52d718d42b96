//! The quirk and tuning layer: fingerprinting, capability probes, learned
//! profiles, the static quirk database, and the layered policy builder.

pub mod db;
pub mod fingerprint;
pub mod learned;
pub mod policy;
pub mod tuning;

pub use db::{Confidence, DeviceQuirk, IfaceMatch, MatchCriteria, QuirkDatabase, QuirkStatus};
pub use fingerprint::{Fingerprint, summary_fingerprint};
pub use learned::{LearnedProfile, LearnedStore, SessionObservation};
pub use policy::{
    CapabilityProbe, DevicePolicy, EnumerationStrategy, FallbackSelections, FlagOverlay,
    PolicyOptions, PolicySummary, ProbeReceipt, QuirkFlags, ReadStrategy, WriteStrategy,
    build_policy,
};
pub use tuning::{BackoffSpec, EffectiveTuning, PhaseHook, QuirkPhase, TuningOverlay};
