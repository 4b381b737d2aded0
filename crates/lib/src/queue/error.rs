//! Errors reported to queue callers.

/// Failure of a controller-issued queue operation. Dispatch-side problems
/// (unreachable driver, reported errors, desync) are absorbed by the
/// coordinator and never surface here. `StorageUnavailable` means the stored
/// queue could not be read yet; nothing was changed and the call can be repeated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("not_found")]
    NotFound(String),
    #[error("empty_text")]
    EmptyText,
    #[error("storage_unavailable")]
    StorageUnavailable(String),
    #[error("id source unavailable: {0}")]
    IdSource(String),
}

impl From<getrandom::Error> for QueueError {
    fn from(e: getrandom::Error) -> Self {
        QueueError::IdSource(e.to_string())
    }
}
