//! Router error taxonomy and its mapping to wire status codes.

use std::path::PathBuf;
use std::time::Duration;

use switchyard_core::{status, FrameEncodeError, MessageKind, UrlError};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message kind {0:#06x}")]
    UnknownMessageKind(i16),
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageKind),
    #[error("invalid string on wire: {0}")]
    InvalidString(String),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("invalid URL: {0}")]
    Url(#[from] UrlError),
    #[error("URL type not supported: {0}")]
    UnsupportedUrl(String),
    #[error("redirect to non-whitelisted host/port {host}:{port}")]
    RedirectRejected { host: String, port: u16 },
    #[error("package {name} {version} not found")]
    PackageNotFound { name: String, version: String },
    #[error("executable {process} not found in package {name} {version}")]
    ExecutableNotFound {
        name: String,
        version: String,
        process: String,
    },
    #[error("failed to start {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{program} failed: {message}")]
    Tool { program: String, message: String },
    #[error("service {url} unavailable: {reason}")]
    ServiceUnavailable { url: String, reason: String },
    #[error("service {url} did not register within {timeout:?}")]
    ServiceStartTimeout { url: String, timeout: Duration },
    #[error("server for request {guid} did not start within {timeout:?}")]
    Timeout { guid: Uuid, timeout: Duration },
    #[error("request {0} is already pending")]
    DuplicateRequest(Uuid),
    #[error("request {0} was cancelled")]
    Cancelled(Uuid),
    #[error("server failed to start ({code}): {message}")]
    ServerFailed { code: i32, message: String },
    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),
}

impl RouterError {
    /// Status code reported to clients in `ClientServerStarted`.
    pub fn code(&self) -> i32 {
        match self {
            RouterError::Timeout { .. } | RouterError::ServiceStartTimeout { .. } => {
                status::TIMEOUT
            }
            RouterError::RedirectRejected { .. } => status::REJECTED,
            RouterError::PackageNotFound { .. } | RouterError::ExecutableNotFound { .. } => {
                status::NOT_FOUND
            }
            RouterError::UnsupportedUrl(_) | RouterError::Unsupported(_) => status::UNSUPPORTED,
            RouterError::UnknownMessageKind(_)
            | RouterError::UnexpectedMessage(_)
            | RouterError::InvalidString(_)
            | RouterError::Encode(_)
            | RouterError::Url(_) => status::PROTOCOL,
            RouterError::ServerFailed { code, .. } if *code != status::SUCCESS => *code,
            _ => status::FAILED,
        }
    }
}

pub type Result<T, E = RouterError> = std::result::Result<T, E>;
