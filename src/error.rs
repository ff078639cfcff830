//! Error taxonomy shared by the storage, accelerator and listing layers.

use crate::model::NaturalKeyKind;
use crate::pool::PoolError;
use thiserror::Error;

pub type ForumResult<T> = Result<T, ForumError>;

#[derive(Debug, Error)]
pub enum ForumError {
    #[error("page size must be positive, got {0}")]
    InvalidPageSize(i64),
    #[error("invalid page cursor {cursor:?}: {reason}")]
    InvalidCursor { cursor: String, reason: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} is already taken")]
    Duplicate(NaturalKeyKind),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    /// Backing-store failure; there is no further fallback.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ForumError {
    /// Caller mistakes that must not be retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ForumError::InvalidPageSize(_)
                | ForumError::InvalidCursor { .. }
                | ForumError::InvalidArgument(_)
                | ForumError::Duplicate(_)
        )
    }
}

impl From<PoolError> for ForumError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Cancelled => ForumError::Cancelled,
            PoolError::Panicked { worker } => {
                ForumError::Store(anyhow::anyhow!("batch worker {worker} panicked"))
            }
            PoolError::Task(err) => ForumError::Store(err),
        }
    }
}
