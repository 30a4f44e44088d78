//! Error types for the Stratum client.

use serde_json::Value;
use thiserror::Error;

use crate::messages::Request;

/// Stratum client errors.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing or serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound message that is not valid JSON or has an impossible shape
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Response carrying an ID with no outstanding request
    #[error("Response for unknown request id {0}")]
    UnknownId(u64),

    /// Server answered a request with an `error` member
    #[error("Server error for {}: {error}", .request.method)]
    Server {
        /// Error payload exactly as the server sent it
        error: Value,
        /// The request this error answers
        request: Box<Request>,
    },

    /// Contradictory or incomplete connection options
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Protocol code this client cannot speak (HTTP, websocket)
    #[error("Unsupported transport '{0}'")]
    UnsupportedTransport(char),

    /// TCP, proxy or TLS setup failed
    #[error("Connection to {target} failed: {source}")]
    ConnectionFailed {
        /// `host:port` we were trying to reach
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Method name does not follow the `namespace.method` convention
    #[error("Invalid method name: {0}")]
    InvalidMethod(String),

    /// No transport installed
    #[error("Not connected")]
    NotConnected,

    /// Connection lost
    #[error("Connection lost")]
    Disconnected,
}

/// Convenient Result type for Stratum operations.
pub type StratumResult<T> = Result<T, StratumError>;

impl StratumError {
    /// Wrap a connect-time I/O failure with the endpoint it concerned.
    pub(crate) fn connect(host: &str, port: u16, source: std::io::Error) -> Self {
        StratumError::ConnectionFailed {
            target: format!("{host}:{port}"),
            source,
        }
    }

    /// Server error payload, if this error came from the server.
    pub fn server_error(&self) -> Option<&Value> {
        match self {
            StratumError::Server { error, .. } => Some(error),
            _ => None,
        }
    }
}
