//! In-memory storage backend: `DashMap<String, Vec<u8>>` with lock-free per-key
//! append via `DashMap::entry` (spec.md §4.1).

use async_trait::async_trait;
use dashmap::DashMap;

use super::{ReadFromResult, Storage, StorageError};

/// Memory-backed `Storage`. Used for ephemeral workflow runs that do not need
/// `channel.jsonl` to survive the process (spec.md §3.6 "Bind (persistent) context").
#[derive(Default)]
pub struct MemoryStorage {
    data: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn read_from(&self, key: &str, offset: u64) -> Result<ReadFromResult, StorageError> {
        let Some(entry) = self.data.get(key) else {
            return Ok(ReadFromResult {
                content: Vec::new(),
                new_offset: 0,
            });
        };
        let size = entry.len() as u64;
        if offset >= size {
            return Ok(ReadFromResult {
                content: Vec::new(),
                new_offset: size,
            });
        }
        let content = entry[offset as usize..].to_vec();
        Ok(ReadFromResult {
            content,
            new_offset: size,
        })
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), content.to_vec());
        Ok(())
    }

    async fn append(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        self.data
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(content);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix_with_slash = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let mut out: Vec<String> = self
            .data
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_prefix(prefix_with_slash.as_str())
                    .map(|rel| rel.to_string())
            })
            .collect();
        out.sort();
        Ok(out)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }
}
