//! Learned per-device profiles: rolling averages of what actually worked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Rolling averages for one fingerprint. Keyed by the full fingerprint hash,
/// so any change to vid/pid/bcdDevice/interface/endpoints starts a fresh
/// profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnedProfile {
    pub optimal_chunk_size: f64,
    pub avg_handshake_ms: f64,
    pub optimal_io_timeout_ms: f64,
    pub p95_read_throughput_mbps: f64,
    pub p95_write_throughput_mbps: f64,
    pub success_rate: f64,
    pub sample_count: u32,
}

/// What one session observed, fed into the rolling merge.
#[derive(Debug, Clone, Copy)]
pub struct SessionObservation {
    pub chunk_size: u32,
    pub handshake_ms: u64,
    pub io_timeout_ms: u64,
    pub read_throughput_mbps: f64,
    pub write_throughput_mbps: f64,
    pub success: bool,
}

impl LearnedProfile {
    pub fn first(obs: &SessionObservation) -> Self {
        let mut profile = Self {
            optimal_chunk_size: 0.0,
            avg_handshake_ms: 0.0,
            optimal_io_timeout_ms: 0.0,
            p95_read_throughput_mbps: 0.0,
            p95_write_throughput_mbps: 0.0,
            success_rate: 0.0,
            sample_count: 0,
        };
        profile.merge(obs);
        profile
    }

    /// Rolling merge with step `alpha = 1 / (sample_count + 1)`:
    /// `new = old * (1 - alpha) + observed * alpha`.
    pub fn merge(&mut self, obs: &SessionObservation) {
        let alpha = 1.0 / f64::from(self.sample_count + 1);
        let blend = |old: f64, observed: f64| old * (1.0 - alpha) + observed * alpha;

        self.optimal_chunk_size = blend(self.optimal_chunk_size, f64::from(obs.chunk_size));
        self.avg_handshake_ms = blend(self.avg_handshake_ms, obs.handshake_ms as f64);
        self.optimal_io_timeout_ms = blend(self.optimal_io_timeout_ms, obs.io_timeout_ms as f64);
        self.p95_read_throughput_mbps =
            blend(self.p95_read_throughput_mbps, obs.read_throughput_mbps);
        self.p95_write_throughput_mbps =
            blend(self.p95_write_throughput_mbps, obs.write_throughput_mbps);
        self.success_rate = blend(self.success_rate, if obs.success { 1.0 } else { 0.0 });
        self.sample_count += 1;
    }
}

/// On-disk cache of learned profiles, keyed by fingerprint hash.
#[derive(Debug, Default)]
pub struct LearnedStore {
    path: Option<PathBuf>,
    profiles: HashMap<String, LearnedProfile>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LearnedFile {
    profiles: HashMap<String, LearnedProfile>,
}

impl LearnedStore {
    /// An in-memory store that never persists. Used in tests and demo mode.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// The default cache location under the platform data dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map(|d| d.join("mtpkit").join("learned-profiles.json"))
    }

    /// Loads the cache, tolerating a missing or corrupt file: learned state
    /// is an optimization, never a requirement.
    pub async fn load(path: PathBuf) -> Self {
        let profiles = match tokio::fs::read_to_string(&path).await {
            Ok(json) => match serde_json::from_str::<LearnedFile>(&json) {
                Ok(file) => file.profiles,
                Err(e) => {
                    warn!("learned-profile cache unreadable, starting fresh: {e}");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!("learned-profile cache: {} profiles from {}", profiles.len(), path.display());
        Self { path: Some(path), profiles }
    }

    pub fn get(&self, fingerprint_hash: &str) -> Option<&LearnedProfile> {
        self.profiles.get(fingerprint_hash)
    }

    /// Folds one session's observation into the profile for a fingerprint.
    pub fn record(&mut self, fingerprint_hash: &str, obs: &SessionObservation) {
        match self.profiles.get_mut(fingerprint_hash) {
            Some(profile) => profile.merge(obs),
            None => {
                self.profiles.insert(fingerprint_hash.to_string(), LearnedProfile::first(obs));
            }
        }
    }

    /// Persists the cache, creating parent directories as needed.
    pub async fn save(&self) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(format!("{}: {e}", parent.display())))?;
        }
        let file = LearnedFile { profiles: self.profiles.clone() };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Io(format!("encode learned profiles: {e}")))?;
        write_atomically(path, json.as_bytes()).await
    }
}

/// Writes through a temp file and renames over the target, so a crash never
/// leaves a half-written cache.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| Error::Io(format!("{}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Io(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(chunk: u32, success: bool) -> SessionObservation {
        SessionObservation {
            chunk_size: chunk,
            handshake_ms: 120,
            io_timeout_ms: 10_000,
            read_throughput_mbps: 18.0,
            write_throughput_mbps: 11.0,
            success,
        }
    }

    #[test]
    fn test_first_observation_is_taken_verbatim() {
        let p = LearnedProfile::first(&obs(1_048_576, true));
        assert_eq!(p.sample_count, 1);
        assert_eq!(p.optimal_chunk_size, 1_048_576.0);
        assert_eq!(p.success_rate, 1.0);
        assert_eq!(p.avg_handshake_ms, 120.0);
    }

    #[test]
    fn test_merge_alpha_formula() {
        let mut p = LearnedProfile::first(&obs(1_000_000, true));
        // Second sample: alpha = 1/2.
        p.merge(&obs(2_000_000, true));
        assert_eq!(p.sample_count, 2);
        assert!((p.optimal_chunk_size - 1_500_000.0).abs() < 1e-6);
        // Third sample: alpha = 1/3.
        p.merge(&obs(3_000_000, false));
        assert_eq!(p.sample_count, 3);
        assert!((p.optimal_chunk_size - 2_000_000.0).abs() < 1e-6);
        assert!((p.success_rate - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_store_keys_by_fingerprint_hash() {
        let mut store = LearnedStore::in_memory();
        store.record("18d1:4ee1:0440|06.01.01|81:01:82", &obs(500_000, true));
        store.record("04e8:6860:----|06.01.01|81:01:--", &obs(250_000, true));
        assert_eq!(
            store.get("18d1:4ee1:0440|06.01.01|81:01:82").unwrap().optimal_chunk_size,
            500_000.0
        );
        assert_eq!(
            store.get("04e8:6860:----|06.01.01|81:01:--").unwrap().optimal_chunk_size,
            250_000.0
        );
        // A changed descriptor means a different hash, hence a fresh profile.
        assert!(store.get("18d1:4ee1:0441|06.01.01|81:01:82").is_none());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learned-profiles.json");

        let mut store = LearnedStore::load(path.clone()).await;
        store.record("aa:bb", &obs(750_000, true));
        store.save().await.unwrap();

        let reloaded = LearnedStore::load(path).await;
        let p = reloaded.get("aa:bb").unwrap();
        assert_eq!(p.optimal_chunk_size, 750_000.0);
        assert_eq!(p.sample_count, 1);
    }

    #[tokio::test]
    async fn test_load_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("learned-profiles.json");
        tokio::fs::write(&path, b"not json at all").await.unwrap();
        let store = LearnedStore::load(path).await;
        assert!(store.get("anything").is_none());
    }
}
