//! Error taxonomy shared by every engine operation.
//!
//! Pure components (score calculator, decision classifier) only ever raise
//! [`EngineError::InvalidInput`]. Compile and adjust surface every kind to
//! their caller without recovering.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

/// What the caller can conclude about persisted state after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Rejected before any write was attempted.
    NothingChanged,
    /// A write was attempted and rolled back in full.
    RolledBack,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("actor {actor} lacks capability: {capability}")]
    Forbidden { actor: Uuid, capability: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        EngineError::InvalidInput(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        EngineError::Conflict(reason.into())
    }

    /// Only conflicts are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            EngineError::NotFound { .. }
            | EngineError::InvalidInput(_)
            | EngineError::Forbidden { .. } => Outcome::NothingChanged,
            EngineError::Conflict(_) | EngineError::Internal(_) => Outcome::RolledBack,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Internal(format!("migration failed: {err}"))
    }
}
