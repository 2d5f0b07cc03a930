//! Error types shared across the transport.
//!
//! # Taxonomy
//! - `Status`: fatal-parse (`400`/`431`/`505`), protocol-unsupported (`501`)
//!   and handler-signaled errors. All carry the status that should be
//!   written if headers have not gone out yet.
//! - `Io` / `H2`: transport failures; TLS failures surface as `Io`.
//!   [`HttpError::is_transient`] separates peer disconnects from genuinely
//!   unexpected conditions.
//! - Control signals (close, detach) are NOT errors; see
//!   [`crate::http::ConnectionOutcome`].

use std::io;

use http::StatusCode;

use crate::websocket::WsError;

/// Crate-wide result alias.
pub type Result<T, E = HttpError> = std::result::Result<T, E>;

/// Errors raised while reading, writing or dispatching HTTP traffic.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// A condition that maps directly onto a response status.
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// A handler failed with something other than a status.
    #[error("handler failed: {0}")]
    Handler(Box<dyn std::error::Error + Send + Sync>),

    /// The response body stream was requested a second time.
    #[error("response body stream already acquired")]
    BodyAlreadyAcquired,

    /// Status or headers were modified after they were serialized.
    #[error("response headers already sent")]
    HeadersSent,
}

impl HttpError {
    /// Build a status-carrying error.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        HttpError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::status(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::status(StatusCode::NOT_IMPLEMENTED, message)
    }

    /// Status to answer with, if this error has one.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for failures caused by the peer going away or timing out.
    ///
    /// These terminate the connection silently: no response, no error log.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Io(e) => is_transient_io(e),
            HttpError::H2(e) => {
                e.is_io() || e.is_go_away() || e.is_reset() || e.is_remote()
            }
            HttpError::WebSocket(WsError::Closed) => true,
            HttpError::WebSocket(WsError::Io(e)) => is_transient_io(e),
            _ => false,
        }
    }
}

/// Classify an I/O error as a peer disconnect or timeout.
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WriteZero
    )
}

/// Error returned by application handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Serialized as exactly this status and message.
    #[error("{status}: {message}")]
    Status { status: StatusCode, message: String },

    /// Anything else; logged and the connection is terminated.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        HandlerError::Status {
            status,
            message: message.into(),
        }
    }
}

impl From<HttpError> for HandlerError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Status { status, message } => HandlerError::Status { status, message },
            other => HandlerError::Other(Box::new(other)),
        }
    }
}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> Self {
        HandlerError::Other(Box::new(err))
    }
}
