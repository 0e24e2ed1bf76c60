// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Payload extraction
//!
//! Two layouts are supported, chosen once at startup:
//!
//! - **Object per topic**: each message is a JSON document holding several
//!   readings, addressed by path (`ENERGY.Power`).
//! - **Metric per topic**: the topic names the metric
//!   (`devices/dht22/temperature`) and the payload is the value.
//!
//! A message is all or nothing: the first failing metric discards the
//! observations already produced for that message.

use serde_json::Value;

use crate::config::{Config, Regexp, METRIC_NAME_REGEX_GROUP};
use crate::error::{BridgeError, Result};
use crate::jsonpath;
use crate::metric::Metric;
use crate::parser::Parser;
use crate::router::MetricIndex;
use crate::state::StateStore;
use crate::value::PayloadValue;

/// Turns one bus message into observations
pub trait Extractor: Send {
    /// Extract every configured metric from `payload`
    fn extract(&mut self, topic: &str, payload: &[u8], device_id: &str) -> Result<Vec<Metric>>;

    /// Persist pending transform state
    fn flush(&mut self) -> Result<()>;
}

/// Extractor for JSON documents carrying several readings
#[derive(Debug)]
pub struct JsonObjectExtractor {
    index: MetricIndex,
    separator: String,
    parser: Parser,
}

impl JsonObjectExtractor {
    pub fn new(index: MetricIndex, separator: impl Into<String>, parser: Parser) -> Self {
        Self {
            index,
            separator: separator.into(),
            parser,
        }
    }
}

impl Extractor for JsonObjectExtractor {
    fn extract(&mut self, topic: &str, payload: &[u8], device_id: &str) -> Result<Vec<Metric>> {
        let document: Value = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::InvalidPayload(e.to_string()))?;

        let mut metrics = Vec::new();
        for path in self.index.keys() {
            let value = match jsonpath::find(&document, path, &self.separator) {
                Some(value) if !value.is_null() => PayloadValue::from(value),
                _ => continue,
            };
            for config in self.index.matching(path, device_id) {
                let metric = self
                    .parser
                    .parse_metric(config, topic, path, device_id, &value)?;
                metrics.push(metric);
            }
        }
        Ok(metrics)
    }

    fn flush(&mut self) -> Result<()> {
        self.parser.flush()
    }
}

/// Extractor for topics carrying a single reading
#[derive(Debug)]
pub struct MetricPerTopicExtractor {
    index: MetricIndex,
    metric_name_regex: Regexp,
    separator: String,
    parser: Parser,
}

impl MetricPerTopicExtractor {
    pub fn new(
        index: MetricIndex,
        metric_name_regex: Regexp,
        separator: impl Into<String>,
        parser: Parser,
    ) -> Self {
        Self {
            index,
            metric_name_regex,
            separator: separator.into(),
            parser,
        }
    }

    fn metric_name(&self, topic: &str) -> Result<String> {
        self.metric_name_regex
            .group_value(topic, METRIC_NAME_REGEX_GROUP)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| BridgeError::MetricNameUnresolved {
                topic: topic.to_string(),
            })
    }
}

impl Extractor for MetricPerTopicExtractor {
    fn extract(&mut self, topic: &str, payload: &[u8], device_id: &str) -> Result<Vec<Metric>> {
        let name = self.metric_name(topic)?;
        let config = match self.index.select(&name, device_id) {
            Some(config) => config,
            None => return Ok(Vec::new()),
        };

        let value = match config.payload_field {
            Some(ref field) => {
                let document: Value = serde_json::from_slice(payload)
                    .map_err(|e| BridgeError::InvalidPayload(e.to_string()))?;
                match jsonpath::find(&document, field, &self.separator) {
                    Some(value) if !value.is_null() => PayloadValue::from(value),
                    _ => {
                        return Err(BridgeError::FieldNotFound {
                            field: field.clone(),
                        })
                    }
                }
            }
            None => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| BridgeError::InvalidPayload(e.to_string()))?;
                PayloadValue::String(text.trim().to_string())
            }
        };

        let metric = self
            .parser
            .parse_metric(config, topic, &name, device_id, &value)?;
        Ok(vec![metric])
    }

    fn flush(&mut self) -> Result<()> {
        self.parser.flush()
    }
}

/// Build the extractor selected by the configuration
pub fn build_extractor(config: &Config) -> Result<Box<dyn Extractor>> {
    let index = MetricIndex::new(&config.metrics);
    let separator = config.json_parsing.separator.clone();
    let parser = Parser::new(StateStore::new(&config.cache.state_directory));

    if config.mqtt.object_per_topic_config.is_some() {
        return Ok(Box::new(JsonObjectExtractor::new(index, separator, parser)));
    }
    match config.mqtt.metric_per_topic_config {
        Some(ref per_topic) => Ok(Box::new(MetricPerTopicExtractor::new(
            index,
            per_topic.metric_name_regex.clone(),
            separator,
            parser,
        ))),
        None => Err(BridgeError::InvalidConfig(
            "no payload layout configured".to_string(),
        )),
    }
}
