use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// One JSONL line. Payload keys are flattened next to the envelope.
#[derive(Debug, Serialize)]
struct TelemetryRecord<'a> {
    ts_unix_ms: u128,
    /// Per-run sequence number; concurrent workers interleave writes, so
    /// this is the ordering to trust.
    seq: u64,
    elapsed_ms: u128,
    event: &'a str,
    run_id: &'a str,
    profile: &'a str,
    #[serde(flatten)]
    payload: Map<String, Value>,
}

/// Append-only JSONL stream of run events. Clones share the sequence
/// counter and the file lock.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub profile: String,
    started: Instant,
    seq: Arc<AtomicU64>,
    file_lock: Arc<std::sync::Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        Self::build(
            cfg.telemetry_enabled,
            PathBuf::from(&cfg.telemetry_path),
            format!("run-{}-{}", unix_ms_now(), std::process::id()),
            cfg.profile.clone(),
        )
    }

    pub fn disabled() -> Self {
        Self::build(
            false,
            PathBuf::new(),
            "run-disabled".to_string(),
            "default".to_string(),
        )
    }

    fn build(enabled: bool, path: PathBuf, run_id: String, profile: String) -> Self {
        Self {
            enabled,
            path,
            run_id,
            profile,
            started: Instant::now(),
            seq: Arc::new(AtomicU64::new(0)),
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    /// Number of records emitted so far in this run.
    pub fn emitted(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: &str, payload: Value) {
        if !self.enabled {
            return;
        }

        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other)]),
        };
        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());
        let record = TelemetryRecord {
            ts_unix_ms: unix_ms_now(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            elapsed_ms: self.started.elapsed().as_millis(),
            event,
            run_id: &self.run_id,
            profile: &self.profile,
            payload,
        };
        if let Err(err) = self.append_record(&record) {
            tracing::warn!(
                event = event,
                path = %self.path.display(),
                error = %err,
                "telemetry write failed"
            );
        }
    }

    /// Caller holds `file_lock`, so `seq` order matches line order.
    fn append_record(&self, record: &TelemetryRecord<'_>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create telemetry directory '{}'",
                    parent.display()
                )
            })?;
        }

        let mut line = serde_json::to_vec(record)
            .with_context(|| format!("failed to serialize telemetry event for '{}'", self.run_id))?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(&line))
            .with_context(|| format!("failed to append to telemetry path '{}'", self.path.display()))
    }
}
