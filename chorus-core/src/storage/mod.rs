//! Storage backend (spec.md §4.1): a narrow key→bytes interface with two
//! implementations, in-memory and on-disk. Keys are logical paths; `/` separates
//! `list` entries. This is the lowest layer of the core — the channel store is the
//! only thing that talks to it directly.

mod disk;
mod error;
mod memory;

pub use disk::DiskStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;

use async_trait::async_trait;

/// Result of `readFrom`: the bytes read starting at `offset`, and the offset the
/// next `readFrom` call should resume at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFromResult {
    pub content: Vec<u8>,
    pub new_offset: u64,
}

/// Primitive key→bytes store (spec.md §4.1). Implementors must make `append`
/// atomic enough that concurrent appenders never interleave partial bytes for
/// line-terminated records, and must never error when a key is simply absent.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the full content of `key`, or `None` if it does not exist.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns the bytes from `offset` to the current end, tolerating concurrent
    /// appends: a caller may observe any valid prefix of the content, never more.
    /// Absent key or `offset >= size` yields an empty result with a consistent
    /// `new_offset`.
    async fn read_from(&self, key: &str, offset: u64) -> Result<ReadFromResult, StorageError>;

    /// Atomically replaces the full content of `key`. Creates parent directories
    /// as needed (disk backend).
    async fn write(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Atomically appends to `key`, creating it if absent.
    async fn append(&self, key: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists keys under `prefix` (recursively), relative to `prefix`, sorted
    /// lexicographically.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Deletes `key`. Idempotent: deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
