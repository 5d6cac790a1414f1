//! Error taxonomy for the gateway.
//!
//! Resolution failures surface as 404, everything else as 500. Nothing is
//! retried: a CGI invocation is treated as at-most-once.

use std::process::ExitStatus;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Errors produced while resolving, running or translating a unit.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No runnable unit matches the requested path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend substrate (docker client, wasm engine, ...) could not be set up.
    #[error("backend setup failed: {0}")]
    Setup(String),

    /// The unit could not be started.
    #[error("failed to start {unit}: {source}")]
    Spawn {
        unit: String,
        #[source]
        source: std::io::Error,
    },

    /// A process unit terminated unsuccessfully.
    #[error("{unit} exited with {status}")]
    ExitStatus { unit: String, status: ExitStatus },

    /// A container or sandbox unit exited with a non-zero code.
    #[error("{unit} exited with code {code}")]
    ExitCode { unit: String, code: i64 },

    /// The unit did not finish within the configured timeout.
    #[error("timeout {0:?}")]
    Timeout(Duration),

    /// The request context was cancelled while the unit was running.
    #[error("cancelled")]
    Cancelled,

    /// The sandboxed module trapped or could not be instantiated.
    #[error("sandbox error in {unit}: {message}")]
    Trap { unit: String, message: String },

    /// The unit wrote a header line without a `:` separator.
    #[error("invalid header format: {0:?}")]
    InvalidHeader(String),

    /// The unit's output ended before the header block was complete.
    #[error("output ended before end of headers")]
    HeaderEof,

    /// Static configuration is unusable (bad mount spec, unknown runner, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// HTTP status this error maps to when nothing has been sent yet.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
