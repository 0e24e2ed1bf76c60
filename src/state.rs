// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Durable per-instance transform state
//!
//! Every (topic, path, device, metric) combination that uses an expression or
//! monotonicity repair owns a [`MetricInstanceState`]. Its [`StateRecord`] is
//! persisted as `<state_directory>/<instance_id>.json` so that counters and
//! integrals survive restarts.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::expression::Expression;
use crate::recovery::{with_retry, RetryStrategy};

/// Minimum time between two writes of an unforced record
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Persisted part of an instance state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateRecord {
    /// Accumulated value added to monotonic series after resets
    pub offset: f64,
    /// Last input seen by monotonicity repair
    pub last_raw_value: f64,
    /// Last `value` bound into the expression
    pub last_expr_value: f64,
    /// Last expression result
    pub last_expr_result: f64,
    /// Time of the last expression evaluation
    pub last_expr_timestamp: Option<DateTime<Utc>>,
}

/// Live state of one metric instance
#[derive(Debug)]
pub struct MetricInstanceState {
    pub record: StateRecord,
    /// Compiled expression, or the compile error, built on first use
    pub(crate) program: Option<Result<Expression>>,
    last_written: Option<DateTime<Utc>>,
    dirty: bool,
}

impl MetricInstanceState {
    /// State for an instance with no record on disk
    pub fn new() -> Self {
        Self {
            record: StateRecord::default(),
            program: None,
            last_written: None,
            dirty: false,
        }
    }

    /// State restored from a record read at `loaded_at`
    pub fn restored(record: StateRecord, loaded_at: DateTime<Utc>) -> Self {
        Self {
            record,
            program: None,
            last_written: Some(loaded_at),
            dirty: false,
        }
    }

    /// Record that the state changed
    pub fn touch(&mut self) {
        self.dirty = true;
    }

    /// Write on the next flush opportunity regardless of the interval
    pub fn force_flush(&mut self) {
        self.dirty = true;
        self.last_written = None;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the record should be written at `now`
    pub fn needs_flush(&self, now: DateTime<Utc>) -> bool {
        if !self.dirty {
            return false;
        }
        match self.last_written {
            None => true,
            Some(written) => (now - written)
                .to_std()
                .map(|elapsed| elapsed > FLUSH_INTERVAL)
                .unwrap_or(false),
        }
    }

    pub fn mark_written(&mut self, now: DateTime<Utc>) {
        self.dirty = false;
        self.last_written = Some(now);
    }
}

impl Default for MetricInstanceState {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory of state records
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    retry: RetryStrategy,
}

impl StateStore {
    /// Store rooted at `dir`, retrying writes twice 10 ms apart
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            retry: RetryStrategy::fixed(2, Duration::from_millis(10)),
        }
    }

    /// Override the write retry strategy
    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record for `instance_id`
    pub fn path(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", instance_id))
    }

    /// Read the record for `instance_id`
    ///
    /// Returns `Ok(None)` when no record exists yet.
    pub fn load(&self, instance_id: &str) -> Result<Option<StateRecord>> {
        let path = self.path(instance_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(state_error(&path, e)),
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| state_error(&path, e))
    }

    /// Atomically replace the record for `instance_id`
    pub fn save(&self, instance_id: &str, record: &StateRecord) -> Result<()> {
        let path = self.path(instance_id);
        let json = serde_json::to_vec_pretty(record).map_err(|e| state_error(&path, e))?;
        let tmp = self.dir.join(format!(".{}.json.tmp", instance_id));

        with_retry(&self.retry, || {
            fs::create_dir_all(&self.dir)?;
            fs::write(&tmp, &json)?;
            fs::rename(&tmp, &path)
        })
        .map_err(|e| state_error(&path, e))
    }
}

fn state_error(path: &Path, reason: impl ToString) -> BridgeError {
    BridgeError::StateIo {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Replace every character outside `[A-Za-z0-9]` with `_`
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Deterministic identifier of a metric instance, safe as a file name
pub fn instance_id(topic: &str, path: &str, device_id: &str, prometheus_name: &str) -> String {
    sanitize(&format!(
        "{}-{}-{}-{}",
        topic, path, device_id, prometheus_name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a/b.c-d e"), "a_b_c_d_e");
        assert_eq!(sanitize("température"), "temp_rature");
    }

    #[test]
    fn test_instance_id() {
        assert_eq!(
            instance_id("tele/plug/SENSOR", "ENERGY.Power", "plug", "power_wh"),
            "tele_plug_SENSOR_ENERGY_Power_plug_power_wh"
        );
    }

    #[test]
    fn test_missing_record() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert_eq!(store.load("absent").unwrap(), None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested"));
        let record = StateRecord {
            offset: 42.0,
            last_raw_value: 3.0,
            last_expr_value: 60.0,
            last_expr_result: 11.0,
            last_expr_timestamp: DateTime::from_timestamp(1_700_000_000, 0),
        };
        store.save("id", &record).unwrap();
        assert!(store.path("id").exists());
        assert_eq!(store.load("id").unwrap(), Some(record));
    }

    #[test]
    fn test_corrupt_record() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path("broken"), "{not json").unwrap();
        assert!(matches!(
            store.load("broken"),
            Err(BridgeError::StateIo { .. })
        ));
    }

    #[test]
    fn test_partial_record_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(store.path("partial"), r#"{"offset": 5.0}"#).unwrap();
        let record = store.load("partial").unwrap().unwrap();
        assert_eq!(record.offset, 5.0);
        assert_eq!(record.last_expr_timestamp, None);
    }

    #[test]
    fn test_save_failure_is_state_io() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let store = StateStore::new(&blocker).with_retry(RetryStrategy::None);
        assert!(matches!(
            store.save("id", &StateRecord::default()),
            Err(BridgeError::StateIo { .. })
        ));
    }

    #[test]
    fn test_flush_cadence() {
        let t0 = Utc::now();
        let mut state = MetricInstanceState::restored(StateRecord::default(), t0);
        assert!(!state.needs_flush(t0));

        state.touch();
        assert!(!state.needs_flush(t0 + chrono::Duration::seconds(30)));
        assert!(state.needs_flush(t0 + chrono::Duration::seconds(61)));

        state.mark_written(t0);
        state.force_flush();
        assert!(state.needs_flush(t0));
    }
}
