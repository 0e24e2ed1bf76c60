//! Error types for mqttprom
//!
//! Every failure of the pipeline is reported per message. None of them is
//! fatal to the process: the caller logs or counts the error and keeps
//! consuming the bus.

use thiserror::Error;

/// Result type alias for mqttprom operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Main error type for the extraction, transformation and caching pipeline
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// A string payload value has no entry in the mapping table and no error value is set
    #[error("Unmapped string value: '{value}'")]
    UnmappedStringValue { value: String },

    /// A string payload value could not be parsed as a number
    #[error("Unparsable number: '{value}'")]
    UnparsableNumber { value: String },

    /// The decoded value is neither a boolean, a string nor a number
    #[error("Unsupported value type: {kind}")]
    UnsupportedValueType { kind: &'static str },

    /// The configured payload field is missing from the message
    #[error("Field not found in payload: {field}")]
    FieldNotFound { field: String },

    /// The metric name could not be extracted from the topic
    #[error("No metric name found in topic: {topic}")]
    MetricNameUnresolved { topic: String },

    /// The message body is not a valid document
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The metric expression failed to compile or type-check
    #[error("Expression '{expression}' failed to compile: {reason}")]
    ExpressionCompile { expression: String, reason: String },

    /// The metric expression failed while running
    #[error("Expression '{expression}' failed to evaluate: {reason}")]
    ExpressionRuntime { expression: String, reason: String },

    /// Reading or writing a metric instance state record failed
    #[error("State I/O error on {path}: {reason}")]
    StateIo { path: String, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The ingest queue is at capacity
    #[error("Ingest queue full, message on {topic} dropped")]
    QueueFull { topic: String },

    /// The ingest worker has stopped
    #[error("Ingest queue closed")]
    QueueClosed,
}

impl BridgeError {
    /// Short machine-friendly name of the error kind, used for log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnmappedStringValue { .. } => "unmapped_string_value",
            Self::UnparsableNumber { .. } => "unparsable_number",
            Self::UnsupportedValueType { .. } => "unsupported_value_type",
            Self::FieldNotFound { .. } => "field_not_found",
            Self::MetricNameUnresolved { .. } => "metric_name_unresolved",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::ExpressionCompile { .. } => "expression_compile",
            Self::ExpressionRuntime { .. } => "expression_runtime",
            Self::StateIo { .. } => "state_io",
            Self::InvalidConfig(_) => "invalid_config",
            Self::QueueFull { .. } => "queue_full",
            Self::QueueClosed => "queue_closed",
        }
    }
}
