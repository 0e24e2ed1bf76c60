// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Device and metric routing
//!
//! [`DeviceRouter`] turns a topic into a device ID. [`MetricIndex`] finds the
//! configuration that applies to a metric key for a given device.

use indexmap::IndexMap;

use crate::config::{Config, MetricConfig, Regexp, DEFAULT_DEVICE_ID_REGEX, DEVICE_ID_REGEX_GROUP};
use crate::error::Result;

/// Resolves device IDs from topics with an ordered list of regexes
#[derive(Debug, Clone)]
pub struct DeviceRouter {
    patterns: Vec<Regexp>,
}

impl DeviceRouter {
    /// Create a router trying `patterns` in order
    pub fn new(patterns: Vec<Regexp>) -> Self {
        Self { patterns }
    }

    /// Build the router for a configuration
    ///
    /// Per-metric overrides come first, in configured order, followed by the
    /// global device-ID regex.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut patterns: Vec<Regexp> = Vec::new();
        for regex in config.metrics.iter().filter_map(|m| m.device_id_regex.as_ref()) {
            if !patterns.contains(regex) {
                patterns.push(regex.clone());
            }
        }
        let global = match config.mqtt.device_id_regex {
            Some(ref regex) => regex.clone(),
            None => Regexp::new(DEFAULT_DEVICE_ID_REGEX)?,
        };
        if !patterns.contains(&global) {
            patterns.push(global);
        }
        Ok(Self::new(patterns))
    }

    /// Device ID of `topic`, or an empty string when no pattern matches
    pub fn resolve_device_id(&self, topic: &str) -> String {
        self.patterns
            .iter()
            .find_map(|regex| regex.group_value(topic, DEVICE_ID_REGEX_GROUP))
            .unwrap_or_default()
    }

    /// Number of patterns tried per topic
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Metric configurations grouped by source key, in configured order
#[derive(Debug, Clone, Default)]
pub struct MetricIndex {
    configs: IndexMap<String, Vec<MetricConfig>>,
}

impl MetricIndex {
    /// Group `metrics` by `mqtt_name`
    pub fn new(metrics: &[MetricConfig]) -> Self {
        let mut configs: IndexMap<String, Vec<MetricConfig>> = IndexMap::new();
        for metric in metrics {
            configs
                .entry(metric.mqtt_name.clone())
                .or_default()
                .push(metric.clone());
        }
        Self { configs }
    }

    /// First configuration under `key` whose sensor filter matches `device_id`
    ///
    /// An absent filter matches every device, so definitions must be
    /// ordered from most to least specific.
    pub fn select(&self, key: &str, device_id: &str) -> Option<&MetricConfig> {
        self.configs
            .get(key)?
            .iter()
            .find(|config| config.matches_sensor(device_id))
    }

    /// Every configuration under `key` whose sensor filter matches `device_id`
    pub fn matching<'a>(
        &'a self,
        key: &str,
        device_id: &'a str,
    ) -> impl Iterator<Item = &'a MetricConfig> + 'a {
        self.configs
            .get(key)
            .into_iter()
            .flatten()
            .filter(move |config| config.matches_sensor(device_id))
    }

    /// Configured keys, in configured order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
