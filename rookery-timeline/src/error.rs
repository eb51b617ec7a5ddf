use rookery_common::model::ModelValidationError;
use thiserror::Error;
use tokio::task::JoinError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend failed: {0}")]
    Backend(#[source] BoxError),
    #[error("Store returned invalid data: {0}")]
    Data(#[from] ModelValidationError),
}

impl StoreError {
    pub fn backend(error: impl Into<BoxError>) -> Self {
        Self::Backend(error.into())
    }

    /// Backend failures may go away on their own; invalid data will not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("A timeline read task failed: {0}")]
    Task(#[from] JoinError),
}

impl TimelineError {
    /// Whether the caller may simply repeat the request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            TimelineError::Store(error) => error.is_retryable(),
            TimelineError::Task(_) => false,
        }
    }
}
