use thiserror::Error;

/// A convenience `Result` alias using [`ConclaveError`].
pub type ConclaveResult<T> = Result<T, ConclaveError>;

/// Top-level error type for the Conclave runtime.
///
/// Each variant corresponds to a subsystem or a failure class that callers
/// need to tell apart (for example the gateway maps [`ConclaveError::Config`]
/// to a 400 and [`ConclaveError::NotFound`] to a 404).
#[derive(Error, Debug)]
pub enum ConclaveError {
    /// An agent-level failure (unknown agent, disabled agent, bad response).
    #[error("Agent error: {0}")]
    Agent(String),

    /// The completion backend returned an error or its circuit is open.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A dispatch or job exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled before it finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Malformed configuration or an out-of-range request parameter.
    #[error("Config error: {0}")]
    Config(String),

    /// A referenced entity (job, session, agent, tool) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A failure in a durable store (agents, jobs, sessions, history).
    #[error("Store error: {0}")]
    Store(String),

    /// An error raised by a tool during invocation.
    #[error("Tool error: {0}")]
    Tool(String),

    /// An error from the job scheduler.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error from the API gateway layer.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConclaveError {
    /// Whether this error is a transient agent failure (timeout, backend error, HTTP failure).
    ///
    /// Transient failures are retried by the scheduler and excluded from a
    /// single round or iteration by the discussion engines.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConclaveError::Backend(_) | ConclaveError::Timeout(_) | ConclaveError::Http(_)
        )
    }
}
