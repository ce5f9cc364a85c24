use crate::core::model::{ExportFormat, SessionId};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("no content service for key={key:?} url={url:?}")]
    UnknownService { key: Option<String>, url: Option<String> },

    #[error("cannot determine the work slug from the given options")]
    MissingSlug,

    #[error("no exporter registered for format {0}")]
    UnsupportedFormat(ExportFormat),

    #[error("format {0} cannot be parsed back; update mode is unavailable")]
    ParseUnsupported(ExportFormat),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} is already running")]
    AlreadyRunning(SessionId),
}

#[derive(thiserror::Error, Debug)]
pub enum HandoffError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} is not downloading chapters")]
    NotDownloading(SessionId),

    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("receiver rejected the snapshot: {0}")]
    Rejected(String),
}
