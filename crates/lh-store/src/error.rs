use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The storage refuses writes; callers should retry after backoff.
    #[error("cannot accept writes: {0}")]
    CannotWrite(String),

    #[error("journal record of {0} bytes exceeds the 4 GiB record limit")]
    RecordTooLarge(usize),
}

impl StoreError {
    /// Whether a retry of the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CannotWrite(_))
    }
}
