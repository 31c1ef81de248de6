//! Error types for mnemo-storage.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Write could not be committed to its target path
    #[error("Atomic write to {path} failed: {source}")]
    AtomicWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
