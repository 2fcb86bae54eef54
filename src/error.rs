use thiserror::Error;

/// Failure talking to the WebDAV backend. Retried by the uploader up to the
/// attempt cap; the last one is surfaced.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{verb} {path} returned {status}: {body}")]
    RemoteStatus {
        verb: &'static str,
        path: String,
        status: u16,
        body: String,
    },
    #[error("{verb} {path} failed: {source}")]
    Transport {
        verb: &'static str,
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Per-item failure at the event-handling boundary. Converted to a
/// best-effort sender notification; never propagates past the handler.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0}")]
    Validation(String),
    #[error("content already backed up")]
    Duplicate,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("failed to fetch message content: {0}")]
    Fetch(#[source] anyhow::Error),
}
