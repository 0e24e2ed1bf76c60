// mqttprom - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Message ingestion
//!
//! [`Ingest`] runs one message through routing, extraction and caching.
//! [`spawn_worker`] moves it onto a dedicated thread fed by a bounded queue,
//! so transform state is only ever touched by that thread.
//!
//! ```text
//! bus ──► IngestQueue ──► worker: DeviceRouter ─► Extractor ─► Collector ◄── scrape
//! ```

use std::io;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::Span;

use crate::collector::MemoryCachedCollector;
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::extractor::{build_extractor, Extractor};
use crate::router::DeviceRouter;

/// Per-topic outcome counters
pub trait Instrumentation: Send + Sync {
    /// A message was handled and its metrics stored
    fn count_success(&self, topic: &str);

    /// A message was discarded because handling failed
    fn count_store_error(&self, topic: &str);

    /// A message was rejected because the queue was full
    fn count_dropped(&self, _topic: &str) {}
}

/// Instrumentation that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {
    fn count_success(&self, _topic: &str) {}
    fn count_store_error(&self, _topic: &str) {}
}

/// The message pipeline
pub struct Ingest {
    router: DeviceRouter,
    extractor: Box<dyn Extractor>,
    collector: Arc<MemoryCachedCollector>,
    instrumentation: Arc<dyn Instrumentation>,
    span: Span,
}

impl Ingest {
    pub fn new(
        router: DeviceRouter,
        extractor: Box<dyn Extractor>,
        collector: Arc<MemoryCachedCollector>,
        instrumentation: Arc<dyn Instrumentation>,
        span: Span,
    ) -> Self {
        Self {
            router,
            extractor,
            collector,
            instrumentation,
            span,
        }
    }

    /// Build the pipeline described by `config`
    pub fn from_config(
        config: &Config,
        collector: Arc<MemoryCachedCollector>,
        instrumentation: Arc<dyn Instrumentation>,
        span: Span,
    ) -> Result<Self> {
        Ok(Self::new(
            DeviceRouter::from_config(config)?,
            build_extractor(config)?,
            collector,
            instrumentation,
            span,
        ))
    }

    /// Handle one message, returning the number of stored observations
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Result<usize> {
        let device_id = self.router.resolve_device_id(topic);
        if device_id.is_empty() {
            tracing::debug!(parent: &self.span, topic, "No device ID found in topic");
        }

        let metrics = self.extractor.extract(topic, payload, &device_id)?;
        let count = metrics.len();
        self.collector.observe(&device_id, metrics);
        Ok(count)
    }

    /// Handle one message and record the outcome
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) {
        match self.handle_message(topic, payload) {
            Ok(count) => {
                self.instrumentation.count_success(topic);
                tracing::trace!(parent: &self.span, topic, count, "Message handled");
            }
            Err(e) => {
                self.instrumentation.count_store_error(topic);
                tracing::warn!(
                    parent: &self.span,
                    topic,
                    kind = e.kind(),
                    error = %e,
                    "Failed to handle message"
                );
            }
        }
    }

    /// Persist pending transform state
    pub fn flush(&mut self) -> Result<()> {
        self.extractor.flush()
    }

    pub fn collector(&self) -> &Arc<MemoryCachedCollector> {
        &self.collector
    }
}

struct Message {
    topic: String,
    payload: Vec<u8>,
}

/// Sending side of the ingest queue
#[derive(Clone)]
pub struct IngestQueue {
    sender: SyncSender<Message>,
    instrumentation: Arc<dyn Instrumentation>,
}

impl IngestQueue {
    /// Enqueue a message, waiting while the queue is full
    pub fn on_message(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        self.sender
            .send(Message { topic, payload })
            .map_err(|_| BridgeError::QueueClosed)
    }

    /// Enqueue a message without waiting
    pub fn try_on_message(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        match self.sender.try_send(Message { topic, payload }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                self.instrumentation.count_dropped(&message.topic);
                Err(BridgeError::QueueFull {
                    topic: message.topic,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(BridgeError::QueueClosed),
        }
    }
}

/// Start the ingest thread
///
/// The thread runs until every [`IngestQueue`] clone is dropped, then flushes
/// transform state and hands the pipeline back through the join handle.
pub fn spawn_worker(ingest: Ingest, capacity: usize) -> io::Result<(IngestQueue, JoinHandle<Ingest>)> {
    let (sender, receiver) = sync_channel(capacity);
    let queue = IngestQueue {
        sender,
        instrumentation: Arc::clone(&ingest.instrumentation),
    };
    let handle = thread::Builder::new()
        .name("mqttprom-ingest".to_string())
        .spawn(move || run_worker(ingest, receiver))?;
    Ok((queue, handle))
}

fn run_worker(mut ingest: Ingest, receiver: Receiver<Message>) -> Ingest {
    tracing::debug!(parent: &ingest.span, "Ingest worker started");
    for message in receiver {
        ingest.on_message(&message.topic, &message.payload);
    }
    if let Err(e) = ingest.flush() {
        tracing::error!(parent: &ingest.span, error = %e, "Failed to flush transform state");
    }
    tracing::debug!(parent: &ingest.span, "Ingest worker stopped");
    ingest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricConfig, Regexp};
    use crate::metric::MetricKind;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, String)>>,
    }

    impl Instrumentation for Recorder {
        fn count_success(&self, topic: &str) {
            self.events.lock().push(("success".to_string(), topic.to_string()));
        }
        fn count_store_error(&self, topic: &str) {
            self.events.lock().push(("storeError".to_string(), topic.to_string()));
        }
        fn count_dropped(&self, topic: &str) {
            self.events.lock().push(("dropped".to_string(), topic.to_string()));
        }
    }

    fn config(state_dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.cache.state_directory = state_dir.to_path_buf();
        config.metrics.push(MetricConfig {
            prometheus_name: "temperature".to_string(),
            mqtt_name: "temperature".to_string(),
            value_type: MetricKind::Gauge,
            ..Default::default()
        });
        config.apply_defaults();
        config
    }

    fn ingest(config: &Config, recorder: Arc<Recorder>) -> Ingest {
        let collector = Arc::new(MemoryCachedCollector::new(
            Duration::from_secs(120),
            Span::none(),
        ));
        Ingest::from_config(config, collector, recorder, Span::none()).unwrap()
    }

    #[test]
    fn test_handle_message() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut ingest = ingest(&config(dir.path()), recorder);

        let count = ingest
            .handle_message("devices/dht22", br#"{"temperature": 8.5}"#)
            .unwrap();
        assert_eq!(count, 1);

        let samples = ingest.collector().collect();
        assert_eq!(samples[0].labels[0], ("sensor".to_string(), "dht22".to_string()));
    }

    #[test]
    fn test_outcomes_are_counted() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut ingest = ingest(&config(dir.path()), Arc::clone(&recorder));

        ingest.on_message("devices/a", br#"{"temperature": 8.5}"#);
        ingest.on_message("devices/b", b"garbage");

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ("success".to_string(), "devices/a".to_string()),
                ("storeError".to_string(), "devices/b".to_string()),
            ]
        );
    }

    #[test]
    fn test_unresolved_device_uses_empty_id() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.mqtt.device_id_regex = Some(Regexp::new("(.*)/(?P<deviceid>.*)").unwrap());
        let mut ingest = ingest(&config, Arc::new(Recorder::default()));

        ingest.handle_message("bar", br#"{"temperature": 1}"#).unwrap();
        let samples = ingest.collector().collect();
        assert_eq!(samples[0].labels[0].1, "");
    }

    #[test]
    fn test_worker_drains_and_returns() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let ingest = ingest(&config(dir.path()), Arc::clone(&recorder));

        let (queue, handle) = spawn_worker(ingest, 8).unwrap();
        for device in ["a", "b", "c"] {
            queue
                .on_message(format!("devices/{}", device), br#"{"temperature": 1}"#.to_vec())
                .unwrap();
        }
        drop(queue);

        let ingest = handle.join().unwrap();
        assert_eq!(ingest.collector().collect().len(), 3);
        assert_eq!(recorder.events.lock().len(), 3);
    }

    #[test]
    fn test_concurrent_producers_and_scrapes() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.metrics.push(MetricConfig {
            prometheus_name: "energy_total".to_string(),
            mqtt_name: "energy".to_string(),
            value_type: MetricKind::Counter,
            force_monotonicy: true,
            ..Default::default()
        });
        let recorder = Arc::new(Recorder::default());
        let ingest = ingest(&config, Arc::clone(&recorder));
        let collector = Arc::clone(ingest.collector());
        let (queue, handle) = spawn_worker(ingest, 4).unwrap();

        let scraper = {
            let collector = Arc::clone(&collector);
            thread::spawn(move || {
                for _ in 0..1000 {
                    for sample in collector.collect() {
                        assert!(sample.value >= 0.0);
                    }
                }
            })
        };

        // Each device counts 0..50 four times, so three resets are repaired
        let producers: Vec<_> = (0..8)
            .map(|device| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let payload = format!(r#"{{"energy": {}}}"#, i % 50);
                        queue
                            .on_message(format!("devices/meter{}", device), payload.into_bytes())
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        drop(queue);

        let ingest = handle.join().unwrap();
        scraper.join().unwrap();

        let samples = ingest.collector().collect();
        assert_eq!(samples.len(), 8);
        for sample in &samples {
            assert_eq!(sample.name, "energy_total");
            assert_eq!(sample.value, 196.0);
        }
        assert_eq!(recorder.events.lock().len(), 1600);
    }

    #[test]
    fn test_closed_queue() {
        let (sender, receiver) = sync_channel(1);
        drop(receiver);
        let queue = IngestQueue {
            sender,
            instrumentation: Arc::new(NoopInstrumentation),
        };
        assert_eq!(
            queue.on_message("t".to_string(), Vec::new()),
            Err(BridgeError::QueueClosed)
        );
        assert_eq!(
            queue.try_on_message("t".to_string(), Vec::new()),
            Err(BridgeError::QueueClosed)
        );
    }

    #[test]
    fn test_full_queue_drops() {
        let (sender, _receiver) = sync_channel(1);
        let recorder = Arc::new(Recorder::default());
        let queue = IngestQueue {
            sender,
            instrumentation: Arc::clone(&recorder) as Arc<dyn Instrumentation>,
        };
        queue.try_on_message("t".to_string(), Vec::new()).unwrap();
        assert_eq!(
            queue.try_on_message("t".to_string(), Vec::new()),
            Err(BridgeError::QueueFull {
                topic: "t".to_string()
            })
        );
        assert_eq!(
            recorder.events.lock()[0],
            ("dropped".to_string(), "t".to_string())
        );
    }
}
