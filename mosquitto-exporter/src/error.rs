//! Error types for the exporter.

use thiserror::Error;

/// Result type alias using [`ExporterError`].
pub type Result<T> = std::result::Result<T, ExporterError>;

/// Errors raised while setting up or running the broker connection.
#[derive(Error, Debug)]
pub enum ExporterError {
    /// The broker endpoint URL is unusable.
    #[error("Invalid broker endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// TLS material could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExporterError {
    /// Create an invalid endpoint error.
    pub fn endpoint(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create a TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }
}
