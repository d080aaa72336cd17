use thiserror::Error;

/// Failures of the persistent key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize stored data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid remote URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to encode action payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Endpoint {endpoint} is already registered with a different entity type (requested {requested})")]
    TypeMismatch {
        endpoint: String,
        requested: &'static str,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync task requires a running tokio runtime")]
    NoRuntime,

    #[error("Sync task already running for endpoint {0}")]
    AlreadyRunning(String),
}

/// Maximum length for response bodies carried as failure reasons
const MAX_REASON_LENGTH: usize = 500;

/// Truncate a response body to avoid logging or publishing excessive data.
pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_REASON_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_REASON_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}
