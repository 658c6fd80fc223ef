use std::io;

/// Failures talking to the remote sync service. Every variant is recoverable:
/// the data manager answers them by falling back to on-device storage.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("remote service unreachable: {0}")]
    Unreachable(String),

    #[error("remote service timed out")]
    Timeout,

    #[error("remote service answered {status}: {message}")]
    Server { status: u16, message: String },

    #[error("remote mode has no server url configured")]
    NotConfigured,

    #[error("unexpected response from remote service: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Unreachable(err.to_string())
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LocalStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("local storage failed: {0}")]
    Local(#[from] LocalStorageError),

    #[error("saving failed remotely ({remote}) and locally ({local})")]
    FallbackFailed {
        remote: RemoteError,
        #[source]
        local: LocalStorageError,
    },
}
