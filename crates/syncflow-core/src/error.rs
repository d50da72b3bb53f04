//! Orchestrator error taxonomy.
//!
//! Every error carries a stable `code()` so that workers and API callers can
//! branch on the kind of failure without parsing message text.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("already terminal: {0}")]
    AlreadyTerminal(String),

    /// Idempotency-key collision. Carries the id of the task already holding the key.
    #[error("duplicate task: {0}")]
    DuplicateTask(String),

    #[error("lease lost: {0}")]
    LeaseLost(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::AlreadyTerminal(_) => "already_terminal",
            Self::DuplicateTask(_) => "duplicate_task",
            Self::LeaseLost(_) => "lease_lost",
            Self::Validation(_) => "validation_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Internal(_) => "internal_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Rebuild an error from a code/message pair received over the wire.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "not_found" => Self::NotFound(message),
            "invalid_transition" => Self::InvalidTransition(message),
            "already_terminal" => Self::AlreadyTerminal(message),
            "duplicate_task" => Self::DuplicateTask(message),
            "lease_lost" => Self::LeaseLost(message),
            "validation_error" => Self::Validation(message),
            "store_unavailable" => Self::StoreUnavailable(message),
            "config_error" => Self::Config(message),
            _ => Self::Internal(message),
        }
    }

    /// The human-readable detail without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::NotFound(m)
            | Self::InvalidTransition(m)
            | Self::AlreadyTerminal(m)
            | Self::DuplicateTask(m)
            | Self::LeaseLost(m)
            | Self::Validation(m)
            | Self::StoreUnavailable(m)
            | Self::Internal(m)
            | Self::Config(m) => m,
        }
    }
}

/// Only contention and I/O failures are worth retrying; corrupt rows and
/// constraint violations will fail the same way every time.
impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(failure, _)
                if matches!(
                    failure.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                        | ErrorCode::DiskFull
                        | ErrorCode::OutOfMemory
                ) =>
            {
                Self::StoreUnavailable(e.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => Self::Internal(format!("corrupt row: {e}")),
            _ => Self::Internal(format!("store: {e}")),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {e}"))
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}
