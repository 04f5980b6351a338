//! Error types for the runhub service
//!
//! Errors are grouped by where they originate: the wire protocol, the build
//! toolchain, or the container runtime. Handler-level errors never travel past the
//! per-connection task; the dispatch loop logs them and keeps the connection open
//! unless the handler asked for [`HubError::CloseConnection`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Connection closed by handler")]
    CloseConnection,
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("Unknown program type: {0}")]
    UnknownType(u8),
    #[error("Identifier not found: {0}")]
    NotFound(String),
    #[error("Malformed transfer: {0}")]
    Malformed(String),
    #[error("Build failed: {0}")]
    Build(#[from] BuildError),
    #[error("Container runtime failed: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("TLS error: {0}")]
    Tls(String),
}

impl HubError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Whether the dispatch loop must stop serving the connection.
    pub fn closes_connection(&self) -> bool {
        matches!(self, HubError::CloseConnection | HubError::AuthFailed(_))
    }
}

// Specific error for the container runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("Container wait stream ended unexpectedly for {0}")]
    WaitEnded(String),
    #[error("Could not archive program directory: {0}")]
    Archive(String),
    #[error("I/O error during container operation: {0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cmd: {command} returned {code}, output: {output}")]
    ToolFailed {
        command: String,
        code: i64,
        output: String,
    },
    #[error("Entry file missing: {0}")]
    MissingEntry(String),
    #[error("I/O error during build: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Lint container failed: {0}")]
    Runtime(#[from] RuntimeError),
}

pub type HubResult<T> = Result<T, HubError>;
