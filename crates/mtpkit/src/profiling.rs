//! Operation profiling and the redacting transaction log.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

/// Per-operation timing statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpStats {
    pub name: String,
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p95_ms: u64,
}

/// A full profiling report, one entry per measured operation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub operations: Vec<OpStats>,
}

/// Collects operation durations. Cheap enough to stay on in production.
#[derive(Default)]
pub struct ProfilingManager {
    samples: Mutex<HashMap<String, Vec<u64>>>,
}

impl ProfilingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times `body` and records the duration under `op_name`.
    pub async fn measure<T, F>(&self, op_name: &str, body: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let result = body.await;
        self.record(op_name, started.elapsed().as_millis() as u64);
        result
    }

    pub fn record(&self, op_name: &str, duration_ms: u64) {
        let mut samples = self.samples.lock().expect("profiler lock");
        samples.entry(op_name.to_string()).or_default().push(duration_ms);
    }

    /// Count / avg / min / max / p95 per operation, sorted by name.
    pub fn report(&self, device: Option<&str>) -> ProfilingReport {
        let samples = self.samples.lock().expect("profiler lock");
        let mut operations: Vec<OpStats> = samples
            .iter()
            .map(|(name, durations)| {
                let mut sorted = durations.clone();
                sorted.sort_unstable();
                let count = sorted.len();
                let sum: u64 = sorted.iter().sum();
                let p95_index = ((count as f64 * 0.95).ceil() as usize).saturating_sub(1);
                OpStats {
                    name: name.clone(),
                    count,
                    avg_ms: sum as f64 / count as f64,
                    min_ms: sorted[0],
                    max_ms: sorted[count - 1],
                    p95_ms: sorted[p95_index.min(count - 1)],
                }
            })
            .collect();
        operations.sort_by(|a, b| a.name.cmp(&b.name));
        ProfilingReport { device: device.map(str::to_string), operations }
    }
}

/// Outcome class of one transaction, for the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TxOutcome {
    Ok,
    DeviceError,
    Timeout,
    Stall,
    IoError,
    Cancelled,
}

/// One logged transaction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub txid: u32,
    pub opcode: u16,
    pub label: String,
    pub session_id: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub outcome: TxOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Default capacity of the transaction ring.
pub const DEFAULT_LOG_CAPACITY: usize = 512;

/// Bounded ring of recent transactions, dumpable with serial redaction for
/// attaching to bug reports.
pub struct TransactionLog {
    capacity: usize,
    entries: Mutex<VecDeque<TransactionRecord>>,
}

impl Default for TransactionLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl TransactionLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: Mutex::new(VecDeque::new()) }
    }

    /// Appends a record, evicting the oldest when full.
    pub fn append(&self, record: TransactionRecord) {
        let mut entries = self.entries.lock().expect("txlog lock");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("txlog lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One line per transaction, oldest first. With `redacting`, anything
    /// that looks like a serial number is masked.
    pub fn dump(&self, redacting: bool) -> Vec<String> {
        let entries = self.entries.lock().expect("txlog lock");
        entries
            .iter()
            .map(|r| {
                let mut line = format!(
                    "{} txid={} op=0x{:04X} {} session={} {}ms in={} out={} {:?}{}",
                    r.started_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    r.txid,
                    r.opcode,
                    r.label,
                    r.session_id,
                    r.duration_ms,
                    r.bytes_in,
                    r.bytes_out,
                    r.outcome,
                    match &r.error {
                        Some(e) => format!(" error={e}"),
                        None => String::new(),
                    },
                );
                if redacting {
                    line = redact_serials(&line);
                }
                line
            })
            .collect()
    }
}

/// Masks serial-number-like tokens: unbroken hex runs of 8+ characters.
pub fn redact_serials(text: &str) -> String {
    static SERIAL: OnceLock<Regex> = OnceLock::new();
    let re = SERIAL.get_or_init(|| {
        Regex::new(r"\b[0-9A-Fa-f]{8,}\b").expect("serial regex")
    });
    re.replace_all(text, "<redacted>").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_measure_records_and_passes_through() {
        let profiler = ProfilingManager::new();
        let value = profiler.measure("getStorageIDs", async { 41 + 1 }).await;
        assert_eq!(value, 42);
        let report = profiler.report(None);
        assert_eq!(report.operations.len(), 1);
        assert_eq!(report.operations[0].name, "getStorageIDs");
        assert_eq!(report.operations[0].count, 1);
    }

    #[test]
    fn test_report_statistics() {
        let profiler = ProfilingManager::new();
        for ms in [10, 20, 30, 40, 100] {
            profiler.record("read", ms);
        }
        let report = profiler.report(Some("Pixel 7"));
        let stats = &report.operations[0];
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min_ms, 10);
        assert_eq!(stats.max_ms, 100);
        assert_eq!(stats.avg_ms, 40.0);
        assert_eq!(stats.p95_ms, 100);
        assert_eq!(report.device.as_deref(), Some("Pixel 7"));
    }

    fn record(txid: u32, error: Option<&str>) -> TransactionRecord {
        TransactionRecord {
            txid,
            opcode: 0x1009,
            label: "read".to_string(),
            session_id: 1,
            started_at: Utc::now(),
            duration_ms: 12,
            bytes_in: 4096,
            bytes_out: 24,
            outcome: if error.is_some() { TxOutcome::DeviceError } else { TxOutcome::Ok },
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = TransactionLog::new(3);
        for txid in 1..=5 {
            log.append(record(txid, None));
        }
        assert_eq!(log.len(), 3);
        let lines = log.dump(false);
        assert!(lines[0].contains("txid=3"));
        assert!(lines[2].contains("txid=5"));
    }

    #[test]
    fn test_dump_redacts_serials() {
        let log = TransactionLog::new(8);
        log.append(record(1, Some("device serial 1A2B3C4D5E6F refused")));
        let redacted = log.dump(true);
        assert!(redacted[0].contains("<redacted>"));
        assert!(!redacted[0].contains("1A2B3C4D5E6F"));

        let clear = log.dump(false);
        assert!(clear[0].contains("1A2B3C4D5E6F"));
    }

    #[test]
    fn test_redaction_leaves_short_tokens() {
        let text = "op=0x1009 code=2001 serial=00AA11BB22CC";
        let out = redact_serials(text);
        assert!(out.contains("0x1009"));
        assert!(out.contains("2001"));
        assert!(out.contains("serial=<redacted>"));
    }
}
