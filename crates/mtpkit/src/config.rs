//! Runtime engine options, resolved once at startup from the environment.

use std::path::PathBuf;

use log::warn;

use crate::quirks::TuningOverlay;

/// Environment variables the engine recognizes.
pub mod env_var {
    /// Force the virtual transport; everything runs offline.
    pub const DEMO_MODE: &str = "MTPKIT_DEMO_MODE";
    /// Emit transport traces at debug level.
    pub const TRACE_USB: &str = "MTPKIT_TRACE_USB";
    /// `key=value,key=value` user tuning overrides.
    pub const TUNING_OVERRIDES: &str = "MTPKIT_TUNING_OVERRIDES";
    /// Comma-separated quirk ids to skip during the merge.
    pub const DENY_QUIRKS: &str = "MTPKIT_DENY_QUIRKS";
    /// Conservative tuning constants, partial transfers off.
    pub const SAFE_MODE: &str = "MTPKIT_SAFE_MODE";
    /// Strict merge: defaults + probe + user overrides only.
    pub const STRICT_TUNING: &str = "MTPKIT_STRICT_TUNING";
    /// Path to the quirk database JSON.
    pub const QUIRKS_PATH: &str = "MTPKIT_QUIRKS_PATH";
}

/// Engine-wide options. Passed at startup; no process-wide mutable state.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub demo_mode: bool,
    pub trace_usb: bool,
    pub safe_mode: bool,
    pub strict_tuning: bool,
    pub tuning_overrides: Option<TuningOverlay>,
    pub denied_quirks: Vec<String>,
    pub quirks_path: Option<PathBuf>,
    /// Re-read object info after every write and compare sizes.
    pub verify_after_write: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            demo_mode: false,
            trace_usb: false,
            safe_mode: false,
            strict_tuning: false,
            tuning_overrides: None,
            denied_quirks: Vec::new(),
            quirks_path: None,
            verify_after_write: true,
        }
    }
}

impl EngineOptions {
    /// Reads every recognized variable. Malformed values degrade to the
    /// default with a warning; the engine must come up regardless.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        opts.demo_mode = env_truthy(env_var::DEMO_MODE);
        opts.trace_usb = env_truthy(env_var::TRACE_USB);
        opts.safe_mode = env_truthy(env_var::SAFE_MODE);
        opts.strict_tuning = env_truthy(env_var::STRICT_TUNING);

        if let Ok(raw) = std::env::var(env_var::TUNING_OVERRIDES) {
            opts.tuning_overrides = TuningOverlay::parse(&raw);
            if opts.tuning_overrides.is_none() {
                warn!("{} is malformed, ignoring: {raw:?}", env_var::TUNING_OVERRIDES);
            }
        }
        if let Ok(raw) = std::env::var(env_var::DENY_QUIRKS) {
            opts.denied_quirks = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(raw) = std::env::var(env_var::QUIRKS_PATH) {
            if !raw.trim().is_empty() {
                opts.quirks_path = Some(PathBuf::from(raw));
            }
        }
        opts
    }
}

fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}
