// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for mqttprom
//!
//! The configuration is loaded once from a YAML file and is immutable
//! afterwards. [`Config::load`] applies defaults and validates every regex
//! and metric definition before the pipeline is built.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BridgeError, Result};
use crate::metric::{MetricKind, SENSOR_LABEL, TOPIC_LABEL};

/// Named group every device-ID regex must contain
pub const DEVICE_ID_REGEX_GROUP: &str = "deviceid";

/// Named group the per-topic metric-name regex must contain
pub const METRIC_NAME_REGEX_GROUP: &str = "metricname";

/// Device-ID regex used when none is configured
pub const DEFAULT_DEVICE_ID_REGEX: &str = "(.*/)?(?P<deviceid>.*)";

/// Only supported encoding for object-per-topic payloads
pub const ENCODING_JSON: &str = "JSON";

/// A compiled regular expression that keeps its source pattern
///
/// Deserializes from a plain string and serializes back to it.
#[derive(Clone)]
pub struct Regexp {
    pattern: String,
    regex: regex::Regex,
}

impl Regexp {
    /// Compile a pattern
    pub fn new(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        let regex = regex::Regex::new(&pattern).map_err(|e| {
            BridgeError::InvalidConfig(format!("invalid regex '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern, regex })
    }

    /// Source pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check whether the pattern matches anywhere in `s`
    pub fn is_match(&self, s: &str) -> bool {
        self.regex.is_match(s)
    }

    /// Check whether the pattern declares the named group
    pub fn has_group(&self, group: &str) -> bool {
        self.regex.capture_names().flatten().any(|name| name == group)
    }

    /// Value of the named group for the first match in `s`
    ///
    /// Returns `None` when the pattern does not match at all. A match whose
    /// group did not participate yields `Some("")`.
    pub fn group_value(&self, s: &str, group: &str) -> Option<String> {
        let captures = self.regex.captures(s)?;
        Some(
            captures
                .name(group)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        )
    }

    fn require_group(&self, group: &str, what: &str) -> Result<()> {
        if self.has_group(group) {
            Ok(())
        } else {
            Err(BridgeError::InvalidConfig(format!(
                "{} '{}' does not contain required regex group '{}'",
                what, self.pattern, group
            )))
        }
    }
}

impl fmt::Debug for Regexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Regexp").field(&self.pattern).finish()
    }
}

impl PartialEq for Regexp {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Serialize for Regexp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pattern)
    }
}

impl<'de> Deserialize<'de> for Regexp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Regexp::new(pattern).map_err(serde::de::Error::custom)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metric definitions, in priority order
    pub metrics: Vec<MetricConfig>,

    /// Broker connection and topic routing
    pub mqtt: MqttConfig,

    /// Latest-value cache and transform state settings
    pub cache: CacheConfig,

    /// JSON path settings
    pub json_parsing: JsonParsingConfig,
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(raw)
            .map_err(|e| BridgeError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill in the sections that depend on each other
    pub fn apply_defaults(&mut self) {
        if self.mqtt.object_per_topic_config.is_none()
            && self.mqtt.metric_per_topic_config.is_none()
        {
            self.mqtt.object_per_topic_config = Some(ObjectPerTopicConfig::default());
        }
    }

    /// Check every invariant the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if let Some(ref regex) = self.mqtt.device_id_regex {
            regex.require_group(DEVICE_ID_REGEX_GROUP, "device id regex")?;
        }

        if self.mqtt.object_per_topic_config.is_some()
            && self.mqtt.metric_per_topic_config.is_some()
        {
            return Err(BridgeError::InvalidConfig(
                "object_per_topic_config and metric_per_topic_config are mutually exclusive"
                    .to_string(),
            ));
        }

        if let Some(ref per_topic) = self.mqtt.metric_per_topic_config {
            per_topic
                .metric_name_regex
                .require_group(METRIC_NAME_REGEX_GROUP, "metric name regex")?;
        }

        if let Some(ref per_object) = self.mqtt.object_per_topic_config {
            if per_object.encoding != ENCODING_JSON {
                return Err(BridgeError::InvalidConfig(format!(
                    "unsupported object encoding: {}",
                    per_object.encoding
                )));
            }
        }

        if self.json_parsing.separator.is_empty() {
            return Err(BridgeError::InvalidConfig(
                "json_parsing.separator must not be empty".to_string(),
            ));
        }

        if self.cache.timeout.is_zero() {
            return Err(BridgeError::InvalidConfig(
                "cache.timeout must be greater than zero".to_string(),
            ));
        }

        for metric in &self.metrics {
            metric.validate()?;
        }

        Ok(())
    }
}

/// Broker connection and topic routing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL, e.g. `tcp://127.0.0.1:1883` or `ssl://broker:8883`
    pub server: String,

    /// Topic filter to subscribe to
    pub topic_path: String,

    /// Global device-ID regex (default: [`DEFAULT_DEVICE_ID_REGEX`])
    pub device_id_regex: Option<Regexp>,

    pub user: String,
    pub password: String,
    pub qos: u8,

    /// Client identifier (generated when empty)
    pub client_id: String,

    /// CA certificate (PEM) used to verify the broker
    pub ca_cert: Option<PathBuf>,
    /// Client certificate (PEM) for mutual TLS
    pub client_cert: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS
    pub client_key: Option<PathBuf>,

    /// One JSON object per topic carrying many metrics
    pub object_per_topic_config: Option<ObjectPerTopicConfig>,

    /// One metric per topic, named by the topic itself
    pub metric_per_topic_config: Option<MetricPerTopicConfig>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: "tcp://127.0.0.1:1883".to_string(),
            topic_path: "v1/devices/me".to_string(),
            device_id_regex: None,
            user: String::new(),
            password: String::new(),
            qos: 0,
            client_id: String::new(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            object_per_topic_config: None,
            metric_per_topic_config: None,
        }
    }
}

/// Structured-object mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectPerTopicConfig {
    /// Payload encoding, only `JSON` is supported
    pub encoding: String,
}

impl Default for ObjectPerTopicConfig {
    fn default() -> Self {
        Self {
            encoding: ENCODING_JSON.to_string(),
        }
    }
}

/// Per-topic mode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPerTopicConfig {
    /// Regex with a `metricname` group applied to the topic
    pub metric_name_regex: Regexp,
}

/// Latest-value cache and transform state settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time after the last observation before a series disappears
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Directory holding one state record per metric instance
    pub state_directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            state_directory: PathBuf::from("/var/lib/mqttprom"),
        }
    }
}

/// JSON path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonParsingConfig {
    /// Separator between path segments in `mqtt_name` and `payload_field`
    pub separator: String,
}

impl Default for JsonParsingConfig {
    fn default() -> Self {
        Self {
            separator: ".".to_string(),
        }
    }
}

/// Mapping from string payload values to numbers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringValueMapping {
    /// Value used when a string has no entry in `map`
    pub error_value: Option<f64>,
    pub map: IndexMap<String, f64>,
}

/// Mapping between a value published on the bus and a Prometheus series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    /// Name of the exposed series
    #[serde(rename = "prom_name")]
    pub prometheus_name: String,

    /// Topic metric name or JSON path of the source value
    #[serde(rename = "mqtt_name")]
    pub mqtt_name: String,

    /// Restricts this definition to devices whose ID matches
    pub sensor_name_filter: Option<Regexp>,

    /// Overrides the global device-ID regex for topics carrying this metric
    pub device_id_regex: Option<Regexp>,

    pub help: String,

    #[serde(rename = "type")]
    pub value_type: MetricKind,

    /// Constant labels, emitted after `sensor` and `topic` in this order
    pub const_labels: IndexMap<String, String>,

    pub string_value_mapping: Option<StringValueMapping>,

    /// Multiplier applied last; zero disables scaling
    pub mqtt_value_scale: f64,

    pub omit_timestamp: bool,

    /// Repair counter resets so the emitted series never decreases
    pub force_monotonicy: bool,

    /// Formula evaluated on every observation
    pub expression: Option<String>,

    /// JSON path into the payload, per-topic mode only
    pub payload_field: Option<String>,
}

impl MetricConfig {
    /// Check whether this definition applies to `device_id`
    pub fn matches_sensor(&self, device_id: &str) -> bool {
        self.sensor_name_filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(device_id))
    }

    /// Non-empty expression source, if any
    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref().filter(|e| !e.trim().is_empty())
    }

    /// Whether observations of this metric need persistent instance state
    pub fn is_stateful(&self) -> bool {
        self.expression().is_some() || self.force_monotonicy
    }

    fn validate(&self) -> Result<()> {
        if !is_valid_metric_name(&self.prometheus_name) {
            return Err(BridgeError::InvalidConfig(format!(
                "invalid prom_name '{}' for mqtt_name '{}'",
                self.prometheus_name, self.mqtt_name
            )));
        }
        if self.mqtt_name.is_empty() {
            return Err(BridgeError::InvalidConfig(format!(
                "empty mqtt_name on metric '{}'",
                self.prometheus_name
            )));
        }
        if self.payload_field.as_deref() == Some("") {
            return Err(BridgeError::InvalidConfig(format!(
                "empty payload_field on metric '{}'",
                self.prometheus_name
            )));
        }
        if let Some(ref regex) = self.device_id_regex {
            regex.require_group(DEVICE_ID_REGEX_GROUP, "device id regex")?;
        }
        for name in self.const_labels.keys() {
            if name == SENSOR_LABEL || name == TOPIC_LABEL {
                return Err(BridgeError::InvalidConfig(format!(
                    "label name '{}' is reserved on metric '{}'",
                    name, self.prometheus_name
                )));
            }
            if !is_valid_label_name(name) {
                return Err(BridgeError::InvalidConfig(format!(
                    "invalid label name '{}' on metric '{}'",
                    name, self.prometheus_name
                )));
            }
        }
        Ok(())
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !name.starts_with("__")
}
