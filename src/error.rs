use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("watch channel send failed")]
    WatchSend,
    #[error("state lock poisoned")]
    StateLock,
    #[error("storage error: {0}")]
    Store(#[from] crate::session::StoreError),
}
