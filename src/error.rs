/// Errors raised by the scheduled task engine.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// A run is already active for this worker.
    #[error("task '{0}' is already running")]
    AlreadyRunning(String),

    /// Cancel was requested on a worker with no active run.
    #[error("task '{0}' is not running")]
    NotRunning(String),

    /// The worker is being torn down and accepts no new runs.
    #[error("task '{0}' is shutting down")]
    ShuttingDown(String),

    /// No worker is registered for the key.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// A persisted trigger descriptor is missing required fields.
    #[error("invalid {kind} trigger: {reason}")]
    InvalidTrigger { kind: String, reason: String },

    /// Returned by task bodies that observed their cancellation signal.
    #[error("task was cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn invalid_trigger(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTrigger {
            kind: kind.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from one protocol round trip to a renderer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("device answered with status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("device has been disposed")]
    Disposed,
}
