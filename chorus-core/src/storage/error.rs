use thiserror::Error;

/// Errors from the primitive key→bytes store (spec.md §4.1, §7 "Storage I/O").
/// `read`/`readFrom`/`exists` never error on an absent key — only genuine I/O
/// failures surface here.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("lock error on key {key}: {message}")]
    Lock { key: String, message: String },
}
