use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnelError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Graph construction errors
    #[error("Type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("Runnable already registered: {0}")]
    DuplicateRunnable(String),

    #[error("Runnable not registered in this orchestration: {0}")]
    UnknownRunnable(String),

    #[error("Orchestration has no entry runnable")]
    MissingEntry,

    #[error("Orchestration has no result runnable")]
    MissingResult,

    #[error("Runnable {0} has no advancers and does not allow dead ends")]
    NoAdvancers(String),

    // Run errors
    #[error("Orchestration exceeded max ticks ({0})")]
    TickLimitExceeded(u64),

    // Invocation errors
    #[error("Work failed in {runnable}: {message}")]
    Work { runnable: String, message: String },

    #[error("Work panicked in {runnable}: {message}")]
    Panicked { runnable: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunnelError {
    /// Shorthand for a work-function failure.
    pub fn work(runnable: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Work {
            runnable: runnable.into(),
            message: message.into(),
        }
    }

    /// Configuration errors are fatal to the graph and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::TypeMismatch { .. }
                | Self::DuplicateRunnable(_)
                | Self::UnknownRunnable(_)
                | Self::MissingEntry
                | Self::MissingResult
                | Self::NoAdvancers(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RunnelError>;
