// mqttprom Exporter - Error types
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Startup and shutdown failures of the exporter.

use thiserror::Error;

/// Errors that stop the exporter
#[derive(Error, Debug)]
pub enum ExporterError {
    /// Configuration or pipeline construction failed
    #[error(transparent)]
    Bridge(#[from] mqttprom::BridgeError),

    /// Registering or encoding metrics failed
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    /// Socket, file or thread creation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker settings are unusable
    #[error("Invalid MQTT settings: {0}")]
    Mqtt(String),

    /// The ingest thread did not stop cleanly
    #[error("Ingest worker panicked")]
    WorkerPanicked,
}
