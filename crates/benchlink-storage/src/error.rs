/// Errors that can occur when writing to storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The storage has been disposed and accepts no more items.
    #[error("storage closed")]
    Closed,

    /// A bounded queue is full and the caller asked not to wait.
    #[error("storage queue full")]
    Full,
}

pub type Result<T> = std::result::Result<T, StorageError>;
