use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeedRelayError {
    #[error("Coordination backend error: {0}")]
    Coordination(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Error returned by the destination platform's REST API. `code` is
/// the platform's own error code when one was present in the response
/// body; the consistency job classifies outcomes by it.
#[derive(Error, Debug, Clone)]
#[error("Platform API error (code {code:?}): {message}")]
pub struct PlatformError {
    pub code: Option<i64>,
    pub message: String,
}

impl PlatformError {
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
