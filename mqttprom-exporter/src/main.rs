// mqttprom Exporter - MQTT to Prometheus bridge
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # mqttprom Exporter
//!
//! Subscribes to device telemetry on an MQTT broker and serves the latest
//! values as Prometheus metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a configuration file
//! mqttprom-exporter --config config.yaml
//!
//! # Custom port, JSON logs
//! mqttprom-exporter -c config.yaml --listen-port 9090 --log-format json
//!
//! # Credentials from the environment, password stored in a file
//! MQTTPROM_MQTT_USER=bridge MQTTPROM_MQTT_PASSWORD=/run/secrets/mqtt \
//!     mqttprom-exporter --treat-mqtt-password-as-file-name
//! ```

mod error;
mod metrics;
mod mqtt;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use clap::{Parser, ValueEnum};
use mqttprom::{spawn_worker, Config, Ingest, MemoryCachedCollector};
use prometheus::Registry;
use tokio::net::TcpListener;
use tracing::{error, info, info_span, Level};
use tracing_subscriber::EnvFilter;

use error::ExporterError;
use metrics::{CacheCollector, IngestMetrics};

/// MQTT to Prometheus exporter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen_address: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long, default_value = "9641")]
    listen_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Console)]
    log_format: LogFormat,

    /// Read the MQTT password from the file named by MQTTPROM_MQTT_PASSWORD
    #[arg(long)]
    treat_mqtt_password_as_file_name: bool,

    /// Messages buffered between the broker and the ingest thread
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Console,
    Json,
}

/// Application state shared across handlers.
struct AppState {
    registry: Registry,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    info!("mqttprom exporter v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Exporter stopped");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match args.log_format {
        LogFormat::Console => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

async fn run(args: Args) -> Result<(), ExporterError> {
    let mut config = Config::load(&args.config)?;
    mqtt::apply_credentials(
        &mut config.mqtt,
        std::env::var(mqtt::ENV_USER).ok(),
        std::env::var(mqtt::ENV_PASSWORD).ok(),
        args.treat_mqtt_password_as_file_name,
    )?;
    info!(
        path = %args.config.display(),
        metrics = config.metrics.len(),
        "Configuration loaded"
    );

    // Pipeline
    let registry = Registry::new();
    let instrumentation = Arc::new(IngestMetrics::new(&registry)?);
    let collector = Arc::new(MemoryCachedCollector::new(
        config.cache.timeout,
        info_span!("collector"),
    ));
    registry.register(Box::new(CacheCollector::new(Arc::clone(&collector))))?;

    let ingest = Ingest::from_config(
        &config,
        Arc::clone(&collector),
        instrumentation,
        info_span!("ingest"),
    )?;
    let (queue, worker) = spawn_worker(ingest, args.queue_capacity)?;

    // Background tasks
    let options = mqtt::connect_options(&config.mqtt)?;
    let qos = mqtt::qos(config.mqtt.qos)?;
    let mqtt_task = tokio::spawn(mqtt::run(
        options,
        config.mqtt.topic_path.clone(),
        qos,
        queue,
    ));
    let sweep_task = tokio::spawn(sweep(Arc::clone(&collector)));

    // HTTP
    let state = Arc::new(AppState { registry });
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::new(args.listen_address, args.listen_port);
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Dropping the MQTT task releases the last queue handle, which stops the
    // worker after it drains and flushes.
    info!("Shutting down");
    sweep_task.abort();
    mqtt_task.abort();
    let _ = mqtt_task.await;

    match tokio::task::spawn_blocking(move || worker.join()).await {
        Ok(Ok(_)) => {
            info!("Ingest worker stopped");
            Ok(())
        }
        _ => Err(ExporterError::WorkerPanicked),
    }
}

async fn sweep(collector: Arc<MemoryCachedCollector>) {
    let mut interval = tokio::time::interval(collector.cleanup_interval());
    // First tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        collector.sweep();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>mqttprom Exporter</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        h1 { color: #2c3e50; }
        a { color: #3498db; text-decoration: none; }
        .endpoints { background: #f8f9fa; padding: 20px; border-radius: 8px; margin: 20px 0; }
    </style>
</head>
<body>
    <h1>mqttprom Exporter</h1>
    <p>Latest device readings received over MQTT, exposed for Prometheus.</p>

    <div class="endpoints">
        <h2>Endpoints</h2>
        <div><a href="/metrics">/metrics</a> - Prometheus metrics</div>
        <div><a href="/health">/health</a> - Health check</div>
    </div>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match metrics::encode(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
