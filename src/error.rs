//! Error taxonomy for fetches and uploads.

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use thiserror::Error;

use crate::auth::Challenge;

/// Coarse classification of transport-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// The request or a read exceeded its deadline.
    Timeout,
    /// The connection dropped after it was established.
    ConnectionLost,
    /// DNS failure, refused connection, TLS handshake failure.
    CannotConnect,
    /// A local file or stream backing the body or the download failed.
    Io,
    Other,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NetworkErrorKind::Timeout => "timed out",
            NetworkErrorKind::ConnectionLost => "connection lost",
            NetworkErrorKind::CannotConnect => "cannot connect",
            NetworkErrorKind::Io => "i/o error",
            NetworkErrorKind::Other => "network error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: NetworkErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => NetworkErrorKind::ConnectionLost,
            std::io::ErrorKind::ConnectionRefused => NetworkErrorKind::CannotConnect,
            _ => NetworkErrorKind::Io,
        };
        TransportError::new(kind, e.to_string())
    }
}

/// Terminal failure of a logical fetch or upload.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Detected before anything was sent; the fetch never starts.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("network error: {0}")]
    Network(#[from] TransportError),

    /// Server answered with status >= 300. The body is whatever the server sent with it.
    #[error("HTTP status {status}")]
    Status {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// No usable credential for the challenge, or the credential was rejected.
    #[error("authentication challenge failed: {challenge}")]
    AuthChallenge {
        challenge: Challenge,
        status: StatusCode,
        body: Bytes,
    },

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("upload protocol error: {0}")]
    Upload(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl FetchError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FetchError::Status { status, .. } | FetchError::AuthChallenge { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Body the server returned alongside a failing status, if any.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            FetchError::Status { body, .. } | FetchError::AuthChallenge { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            FetchError::Network(e) => Some(e.kind),
            _ => None,
        }
    }

    pub fn is_status_error(&self) -> bool {
        matches!(self, FetchError::Status { .. })
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
