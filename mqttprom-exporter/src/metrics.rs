// mqttprom Exporter - Prometheus metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus side of the exporter.
//!
//! The latest-value cache is exposed through [`CacheCollector`], an unchecked
//! collector whose families are rebuilt on every scrape. Ingest outcomes are
//! counted in `received_messages`.

use std::sync::Arc;

use mqttprom::{Instrumentation, MemoryCachedCollector, MetricKind, Sample};
use prometheus::core::{Collector, Desc};
use prometheus::proto::{self, LabelPair, MetricFamily, MetricType};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Status label values of `received_messages`
const STATUS_SUCCESS: &str = "success";
const STATUS_STORE_ERROR: &str = "storeError";
const STATUS_DROPPED: &str = "dropped";

/// Per-topic message counters
#[derive(Clone)]
pub struct IngestMetrics {
    received: IntCounterVec,
}

impl IngestMetrics {
    /// Create the counters and register them in `registry`
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let received = IntCounterVec::new(
            Opts::new(
                "received_messages",
                "Messages received from the broker, by topic and outcome",
            ),
            &["status", "topic"],
        )?;
        registry.register(Box::new(received.clone()))?;
        Ok(Self { received })
    }

    fn inc(&self, status: &str, topic: &str) {
        self.received.with_label_values(&[status, topic]).inc();
    }
}

impl Instrumentation for IngestMetrics {
    fn count_success(&self, topic: &str) {
        self.inc(STATUS_SUCCESS, topic);
    }

    fn count_store_error(&self, topic: &str) {
        self.inc(STATUS_STORE_ERROR, topic);
    }

    fn count_dropped(&self, topic: &str) {
        self.inc(STATUS_DROPPED, topic);
    }
}

/// Adapts the latest-value cache to the Prometheus registry
pub struct CacheCollector {
    cache: Arc<MemoryCachedCollector>,
}

impl CacheCollector {
    pub fn new(cache: Arc<MemoryCachedCollector>) -> Self {
        Self { cache }
    }
}

impl Collector for CacheCollector {
    fn desc(&self) -> Vec<&Desc> {
        // Series are only known at scrape time
        Vec::new()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        families(self.cache.collect())
    }
}

fn metric_type(kind: MetricKind) -> MetricType {
    match kind {
        MetricKind::Gauge => MetricType::GAUGE,
        MetricKind::Counter => MetricType::COUNTER,
        MetricKind::Untyped => MetricType::UNTYPED,
    }
}

/// Group name-sorted samples into families
///
/// The first sample of a name decides the family type.
fn families(samples: Vec<Sample>) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    for sample in samples {
        let field_type = match families.last() {
            Some(family) if family.get_name() == sample.name => family.get_field_type(),
            _ => {
                let mut family = MetricFamily::default();
                family.set_name(sample.name.clone());
                family.set_help(sample.help.clone());
                family.set_field_type(metric_type(sample.kind));
                families.push(family);
                metric_type(sample.kind)
            }
        };
        if let Some(family) = families.last_mut() {
            family.mut_metric().push(to_proto(&sample, field_type));
        }
    }
    families
}

fn to_proto(sample: &Sample, field_type: MetricType) -> proto::Metric {
    let mut metric = proto::Metric::default();
    for (name, value) in &sample.labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }

    match field_type {
        MetricType::COUNTER => {
            let mut counter = proto::Counter::default();
            counter.set_value(sample.value);
            metric.set_counter(counter);
        }
        MetricType::GAUGE => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(sample.value);
            metric.set_gauge(gauge);
        }
        _ => {
            let mut untyped = proto::Untyped::default();
            untyped.set_value(sample.value);
            metric.set_untyped(untyped);
        }
    }

    if let Some(timestamp) = sample.timestamp {
        metric.set_timestamp_ms(timestamp.timestamp_millis());
    }
    metric
}

/// Encode every registered metric in the Prometheus text format
pub fn encode(registry: &Registry) -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqttprom::{Metric, MetricDesc};
    use std::time::Duration;

    fn sample(name: &str, kind: MetricKind, sensor: &str, value: f64) -> Sample {
        Sample {
            name: name.to_string(),
            help: format!("{} help", name),
            kind,
            labels: vec![
                ("sensor".to_string(), sensor.to_string()),
                ("topic".to_string(), format!("devices/{}", sensor)),
            ],
            value,
            timestamp: None,
        }
    }

    #[test]
    fn test_families_grouped_by_name() {
        let families = families(vec![
            sample("humidity", MetricKind::Gauge, "a", 40.0),
            sample("temperature", MetricKind::Gauge, "a", 20.0),
            sample("temperature", MetricKind::Counter, "b", 21.0),
        ]);
        assert_eq!(families.len(), 2);
        assert_eq!(families[1].get_name(), "temperature");
        assert_eq!(families[1].get_field_type(), MetricType::GAUGE);
        assert_eq!(families[1].get_metric().len(), 2);
        assert_eq!(families[1].get_metric()[1].get_gauge().get_value(), 21.0);
    }

    #[test]
    fn test_labels_and_timestamp() {
        let mut s = sample("energy", MetricKind::Counter, "meter", 11.0);
        s.timestamp = chrono::DateTime::from_timestamp_millis(1_700_000_000_000);
        let metric = to_proto(&s, MetricType::COUNTER);
        let names: Vec<&str> = metric.get_label().iter().map(|l| l.get_name()).collect();
        assert_eq!(names, vec!["sensor", "topic"]);
        assert_eq!(metric.get_counter().get_value(), 11.0);
        assert_eq!(metric.get_timestamp_ms(), 1_700_000_000_000);
    }

    #[test]
    fn test_ingest_counters() {
        let registry = Registry::new();
        let metrics = IngestMetrics::new(&registry).unwrap();
        metrics.count_success("devices/a");
        metrics.count_success("devices/a");
        metrics.count_store_error("devices/b");
        metrics.count_dropped("devices/c");

        let output = encode(&registry).unwrap();
        assert!(output.contains(r#"received_messages{status="success",topic="devices/a"} 2"#));
        assert!(output.contains(r#"received_messages{status="storeError",topic="devices/b"} 1"#));
        assert!(output.contains(r#"received_messages{status="dropped",topic="devices/c"} 1"#));
    }

    #[test]
    fn test_cache_collector_scrape() {
        let cache = Arc::new(MemoryCachedCollector::new(
            Duration::from_secs(60),
            tracing::Span::none(),
        ));
        cache.observe(
            "dht22",
            vec![Metric {
                desc: MetricDesc {
                    name: "temperature".to_string(),
                    help: "Air temperature".to_string(),
                    kind: MetricKind::Gauge,
                    const_labels: Default::default(),
                },
                value: 21.5,
                ingest_time: None,
                topic: "devices/dht22".to_string(),
                device_id: "dht22".to_string(),
            }],
        );

        let registry = Registry::new();
        registry
            .register(Box::new(CacheCollector::new(Arc::clone(&cache))))
            .unwrap();

        let output = encode(&registry).unwrap();
        assert!(output.contains("# HELP temperature Air temperature"));
        assert!(output.contains("# TYPE temperature gauge"));
        assert!(output.contains(r#"temperature{sensor="dht22",topic="devices/dht22"} 21.5"#));
    }
}
