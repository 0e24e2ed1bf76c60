//! Conversion of one raw value into one [`Metric`]

use chrono::{DateTime, Utc};

use crate::config::MetricConfig;
use crate::error::Result;
use crate::metric::{Metric, MetricDesc};
use crate::state::{instance_id, StateStore};
use crate::transform::TransformEngine;
use crate::value::{coerce, PayloadValue};

/// Coerces and transforms values for the extractors
#[derive(Debug)]
pub struct Parser {
    engine: TransformEngine,
    clock: fn() -> DateTime<Utc>,
}

impl Parser {
    pub fn new(store: StateStore) -> Self {
        Self {
            engine: TransformEngine::new(store),
            clock: Utc::now,
        }
    }

    /// Replace the wall clock, for deterministic tests
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the observation of `value` found at `path` for `config`
    pub fn parse_metric(
        &mut self,
        config: &MetricConfig,
        topic: &str,
        path: &str,
        device_id: &str,
        value: &PayloadValue,
    ) -> Result<Metric> {
        let raw = coerce(config, value)?;
        let id = instance_id(topic, path, device_id, &config.prometheus_name);
        let (value, ingest_time) = self.engine.transform(&id, config, raw, (self.clock)())?;

        Ok(Metric {
            desc: MetricDesc::from(config),
            value,
            ingest_time,
            topic: topic.to_string(),
            device_id: device_id.to_string(),
        })
    }

    /// Persist every pending transform state
    pub fn flush(&mut self) -> Result<()> {
        self.engine.flush_all()
    }

    pub fn engine(&self) -> &TransformEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricKind;
    use tempfile::tempdir;

    fn fixed_clock() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_parse_metric() {
        let dir = tempdir().unwrap();
        let mut parser = Parser::new(StateStore::new(dir.path())).with_clock(fixed_clock);
        let config = MetricConfig {
            prometheus_name: "temperature".to_string(),
            mqtt_name: "temperature".to_string(),
            value_type: MetricKind::Gauge,
            ..Default::default()
        };

        let metric = parser
            .parse_metric(
                &config,
                "devices/dht22",
                "temperature",
                "dht22",
                &PayloadValue::String("12.6".to_string()),
            )
            .unwrap();

        assert_eq!(metric.desc.name, "temperature");
        assert_eq!(metric.value, 12.6);
        assert_eq!(metric.ingest_time, Some(fixed_clock()));
        assert_eq!(metric.topic, "devices/dht22");
        assert_eq!(metric.device_id, "dht22");
    }

    #[test]
    fn test_stateful_metric_keyed_by_instance() {
        let dir = tempdir().unwrap();
        let mut parser = Parser::new(StateStore::new(dir.path())).with_clock(fixed_clock);
        let config = MetricConfig {
            prometheus_name: "total".to_string(),
            force_monotonicy: true,
            ..Default::default()
        };

        for device in ["a", "b"] {
            parser
                .parse_metric(&config, "t", "total", device, &PayloadValue::Number(1.0))
                .unwrap();
        }
        assert_eq!(parser.engine().len(), 2);
        assert!(dir.path().join("t_total_a_total.json").exists());
    }
}
