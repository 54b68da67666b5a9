pub type Result<T> = std::result::Result<T, MusterError>;

/// Errors surfaced by the process group.
///
/// The enum is `Clone` because an asynchronous error captured into a
/// [`Work`](crate::work::Work) error slot is re-raised on every
/// `synchronize`/`wait` while staying captured.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MusterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{op} is not supported by this process group")]
    Unsupported { op: &'static str },

    #[error("collective submission failed: {0}")]
    VendorSubmission(String),

    #[error("asynchronous collective error: {0}")]
    VendorAsync(String),

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("device driver error: {0}")]
    Driver(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid value {value:?} for environment variable {var}")]
    Config { var: &'static str, value: String },
}

impl MusterError {
    /// Create an `InvalidArgument` error from any displayable message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a `Driver` error from any displayable message.
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    /// Create a `Store` error from any displayable message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}
