//! Observation types
//!
//! A [`Metric`] is one observation produced by an extractor and handed over
//! to the collector. It is immutable once built.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::MetricConfig;

/// Prometheus value type of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
    /// Any unrecognized `type` in the configuration
    #[default]
    #[serde(other)]
    Untyped,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Untyped => "untyped",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static identity of a series: name, help, kind and constant labels
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDesc {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub const_labels: IndexMap<String, String>,
}

impl MetricDesc {
    /// Stable key identifying the series independently of device and topic
    pub fn identity(&self) -> String {
        let mut id = self.name.clone();
        if !self.const_labels.is_empty() {
            let labels: Vec<String> = self
                .const_labels
                .iter()
                .map(|(k, v)| format!("{}={:?}", k, v))
                .collect();
            id.push('{');
            id.push_str(&labels.join(","));
            id.push('}');
        }
        id
    }
}

impl From<&MetricConfig> for MetricDesc {
    fn from(config: &MetricConfig) -> Self {
        Self {
            name: config.prometheus_name.clone(),
            help: config.help.clone(),
            kind: config.value_type,
            const_labels: config.const_labels.clone(),
        }
    }
}

/// One observation of one series
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub desc: MetricDesc,
    /// Coerced and transformed value
    pub value: f64,
    /// Ingest time, `None` when the metric omits timestamps
    pub ingest_time: Option<DateTime<Utc>>,
    pub topic: String,
    pub device_id: String,
}

/// Label names every exposed series starts with
pub const SENSOR_LABEL: &str = "sensor";
pub const TOPIC_LABEL: &str = "topic";

impl Metric {
    /// Labels in exposition order: sensor, topic, then constant labels
    pub fn labels(&self) -> Vec<(String, String)> {
        let mut labels = Vec::with_capacity(2 + self.desc.const_labels.len());
        labels.push((SENSOR_LABEL.to_string(), self.device_id.clone()));
        labels.push((TOPIC_LABEL.to_string(), self.topic.clone()));
        labels.extend(
            self.desc
                .const_labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        labels
    }
}
