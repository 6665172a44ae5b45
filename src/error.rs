use thiserror::Error;

/// Failure kinds the task-exchange store can surface.
///
/// Validation failures are not represented here: `store_task_ins` and
/// `store_task_res` treat a rejected record as an expected, soft failure
/// and return `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store not initialized")]
    NotInitialized,

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
