//! # mqttprom - MQTT to Prometheus bridge
//!
//! Turns device telemetry published on an MQTT bus into Prometheus series.
//!
//! ## Key Features
//!
//! - **Two payload layouts**: one JSON object per topic, or one metric per topic
//! - **Value coercion**: booleans, numeric strings and mapped enum strings
//! - **Stateful transforms**: expressions and counter-reset repair, persisted across restarts
//! - **Latest-value cache**: series disappear once their device goes quiet
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mqttprom::{Config, Ingest, MemoryCachedCollector, NoopInstrumentation};
//!
//! let config = Config::from_yaml(r#"
//! metrics:
//!   - prom_name: temperature
//!     mqtt_name: temperature
//!     type: gauge
//! "#).unwrap();
//!
//! let collector = Arc::new(MemoryCachedCollector::new(
//!     Duration::from_secs(120),
//!     tracing::Span::none(),
//! ));
//! let mut ingest = Ingest::from_config(
//!     &config,
//!     Arc::clone(&collector),
//!     Arc::new(NoopInstrumentation),
//!     tracing::Span::none(),
//! ).unwrap();
//!
//! ingest.handle_message("devices/dht22", br#"{"temperature": 21.5}"#).unwrap();
//!
//! let samples = collector.collect();
//! assert_eq!(samples[0].name, "temperature");
//! assert_eq!(samples[0].value, 21.5);
//! ```
//!
//! ## Modules
//!
//! - [`config`]: YAML configuration and validation
//! - [`router`]: Device ID resolution and metric lookup
//! - [`value`]: Payload value coercion
//! - [`expression`], [`state`], [`transform`]: Stateful transforms
//! - [`extractor`]: Payload layouts
//! - [`collector`]: Latest-value cache
//! - [`ingest`]: Message pipeline and worker queue

pub mod collector;
pub mod config;
pub mod error;
pub mod expression;
pub mod extractor;
pub mod ingest;
pub mod jsonpath;
pub mod metric;
pub mod parser;
pub mod recovery;
pub mod router;
pub mod state;
pub mod transform;
pub mod value;

// Re-exports for convenient access
pub use collector::{MemoryCachedCollector, Sample};
pub use config::{Config, MetricConfig, Regexp};
pub use error::{BridgeError, Result};
pub use extractor::{build_extractor, Extractor, JsonObjectExtractor, MetricPerTopicExtractor};
pub use ingest::{spawn_worker, Ingest, IngestQueue, Instrumentation, NoopInstrumentation};
pub use metric::{Metric, MetricDesc, MetricKind};
pub use router::{DeviceRouter, MetricIndex};
pub use transform::TransformEngine;
pub use value::PayloadValue;
