//! Error types for Muster

use thiserror::Error;

/// Result type for Muster operations
pub type Result<T> = std::result::Result<T, MusterError>;

/// Muster error types
#[derive(Error, Debug)]
pub enum MusterError {
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownService { service: String, dependency: String },

    #[error("Service declared more than once: {0}")]
    DuplicateService(String),

    #[error("Failed to launch service '{service}': {message}")]
    Launch { service: String, message: String },

    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid duration '{value}': {message}")]
    InvalidDuration { value: String, message: String },

    #[error("Orchestration session closed")]
    SessionClosed,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
