#![forbid(unsafe_code)]

use crate::platform::InjectError;
use crate::supervisor::ServiceToken;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Payload not found at {path:?}: {source}")]
    PayloadMissing {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to inject payload into process {pid}: {source}")]
    Inject { pid: u32, source: InjectError },

    #[error("Failed to open channel {name} after {attempts} attempts: {source}")]
    Dial {
        name: String,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("Stream {0} not found")]
    SessionNotFound(u32),

    #[error("Sender for stream {0} is closed")]
    SenderClosed(u32),

    #[error("Cannot unmarshal data to message: {0}")]
    InvalidRequest(#[from] serde_json::Error),

    #[error("Failed to decode request data: {0}")]
    InvalidRequestData(#[from] base64::DecodeError),

    #[error("Failed to enumerate processes: {0}")]
    Enumerate(String),

    #[error("Failed to read procfs info: {0}")]
    Procfs(#[from] procfs::ProcError),

    #[error("Service {0:?} is not supervised")]
    UnknownService(ServiceToken),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
