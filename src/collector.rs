// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Latest-value cache
//!
//! Holds the last observation of every (device, series) pair until it has
//! not been refreshed for `timeout`. Scrapes read a sorted snapshot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::Span;

use crate::metric::{Metric, MetricKind};

/// How many timeouts elapse between two sweeps
const CLEANUP_FACTOR: u32 = 10;

/// One exposed sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    /// `sensor`, `topic`, then constant labels in configured order
    pub labels: Vec<(String, String)>,
    pub value: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&Metric> for Sample {
    fn from(metric: &Metric) -> Self {
        Self {
            name: metric.desc.name.clone(),
            help: metric.desc.help.clone(),
            kind: metric.desc.kind,
            labels: metric.labels(),
            value: metric.value,
            timestamp: metric.ingest_time,
        }
    }
}

#[derive(Debug)]
struct CacheItem {
    metric: Metric,
    expires_at: Instant,
}

/// Expiring cache of the latest observations
#[derive(Debug)]
pub struct MemoryCachedCollector {
    timeout: Duration,
    cache: RwLock<HashMap<String, CacheItem>>,
    span: Span,
}

impl MemoryCachedCollector {
    pub fn new(timeout: Duration, span: Span) -> Self {
        Self {
            timeout,
            cache: RwLock::new(HashMap::new()),
            span,
        }
    }

    /// Store `metrics` as the latest observations of `device_id`
    pub fn observe(&self, device_id: &str, metrics: Vec<Metric>) {
        self.observe_at(device_id, metrics, Instant::now());
    }

    pub fn observe_at(&self, device_id: &str, metrics: Vec<Metric>, now: Instant) {
        if metrics.is_empty() {
            return;
        }
        let expires_at = now + self.timeout;
        let count = metrics.len();
        {
            let mut cache = self.cache.write();
            for metric in metrics {
                let key = format!("{}-{}", device_id, metric.desc.identity());
                cache.insert(key, CacheItem { metric, expires_at });
            }
        }
        tracing::trace!(parent: &self.span, device_id, count, "Observed metrics");
    }

    /// Snapshot of every live entry, sorted by name then labels
    pub fn collect(&self) -> Vec<Sample> {
        self.collect_at(Instant::now())
    }

    pub fn collect_at(&self, now: Instant) -> Vec<Sample> {
        let mut samples: Vec<Sample> = self
            .cache
            .read()
            .values()
            .filter(|item| now < item.expires_at)
            .map(|item| Sample::from(&item.metric))
            .collect();
        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }

    /// Drop expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let removed = {
            let mut cache = self.cache.write();
            let before = cache.len();
            cache.retain(|_, item| now < item.expires_at);
            before - cache.len()
        };
        if removed > 0 {
            tracing::debug!(parent: &self.span, removed, "Swept expired metrics");
        }
        removed
    }

    /// Period between two sweeps
    pub fn cleanup_interval(&self) -> Duration {
        self.timeout * CLEANUP_FACTOR
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}
