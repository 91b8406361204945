use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error on bucket {bucket}: {details}")]
    Storage { bucket: String, details: String },

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("failed to decode object {object}: {details}")]
    Decode { object: String, details: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("cursor state error: {0}")]
    State(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn storage(bucket: impl Into<String>, details: impl Into<String>) -> Self {
        Error::Storage {
            bucket: bucket.into(),
            details: details.into(),
        }
    }

    pub fn decode(object: impl Into<String>, details: impl Into<String>) -> Self {
        Error::Decode {
            object: object.into(),
            details: details.into(),
        }
    }

    /// Remote reads are idempotent, so every transport-level failure is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
