//! Disk-backed storage: keys map to files under a base directory (spec.md §4.1).
//! `/` components in a key become path components; parent directories are created
//! on demand. `append` holds an OS-level advisory lock via `fs4` so concurrent
//! appenders — even across processes — never interleave partial bytes, matching
//! the "atomic O_APPEND-equivalent" contract.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::tokio::AsyncFileExt;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{ReadFromResult, Storage, StorageError};

/// Disk-backed `Storage`. Used for "bind" (persistent) contexts (spec.md §3.6,
/// §6.1): `channel.jsonl`, `_state/inbox.json`, `resources/<id>.<ext>`, and
/// `documents/<relpath>` all live under `base_dir`.
pub struct DiskStorage {
    base_dir: PathBuf,
}

impl DiskStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut p = self.base_dir.clone();
        for component in key.split('/') {
            if !component.is_empty() {
                p.push(component);
            }
        }
        p
    }

    fn io_err(key: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }

    async fn ensure_parent(path: &Path, key: &str) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(key, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }

    async fn read_from(&self, key: &str, offset: u64) -> Result<ReadFromResult, StorageError> {
        let path = self.path_for(key);
        let mut file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ReadFromResult {
                    content: Vec::new(),
                    new_offset: 0,
                });
            }
            Err(e) => return Err(Self::io_err(key, e)),
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| Self::io_err(key, e))?
            .len();
        if offset >= size {
            return Ok(ReadFromResult {
                content: Vec::new(),
                new_offset: size,
            });
        }
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Self::io_err(key, e))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(|e| Self::io_err(key, e))?;
        Ok(ReadFromResult {
            content,
            new_offset: size,
        })
    }

    async fn write(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        Self::ensure_parent(&path, key).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tmp")
            .to_string();
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, content)
            .await
            .map_err(|e| Self::io_err(key, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Self::io_err(key, e))?;
        Ok(())
    }

    async fn append(&self, key: &str, content: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        Self::ensure_parent(&path, key).await?;
        let mut file = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| Self::io_err(key, e))?;
        file.lock_exclusive()
            .await
            .map_err(|e| StorageError::Lock {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        let result = file.write_all(content).await;
        let _ = file.flush().await;
        // Dropping `file` below closes the fd, which releases the advisory lock.
        result.map_err(|e| Self::io_err(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.path_for(key))
            .await
            .map_err(|e| Self::io_err(key, e))?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.path_for(prefix);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let dir_clone = dir.clone();
        let prefix_owned = prefix.to_string();
        let entries = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in walkdir::WalkDir::new(&dir_clone)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file() {
                    if let Ok(rel) = entry.path().strip_prefix(&dir_clone) {
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
            out
        })
        .await
        .map_err(|e| StorageError::Io {
            key: prefix_owned,
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;
        let mut entries = entries;
        entries.sort();
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::new(dir.path());
        s.write("a/b.txt", b"hello").await.unwrap();
        assert_eq!(s.read("a/b.txt").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn append_creates_file_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::new(dir.path());
        s.append("log.jsonl", b"line1\n").await.unwrap();
        s.append("log.jsonl", b"line2\n").await.unwrap();
        assert_eq!(
            s.read("log.jsonl").await.unwrap(),
            Some(b"line1\nline2\n".to_vec())
        );
    }

    #[tokio::test]
    async fn read_from_offset_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::new(dir.path());
        s.append("log.jsonl", b"abc").await.unwrap();
        let r1 = s.read_from("log.jsonl", 0).await.unwrap();
        assert_eq!(r1.content, b"abc".to_vec());
        s.append("log.jsonl", b"def").await.unwrap();
        let r2 = s.read_from("log.jsonl", r1.new_offset).await.unwrap();
        assert_eq!(r2.content, b"def".to_vec());
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::new(dir.path());
        assert_eq!(s.read("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_recursive_sorted_relative() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::new(dir.path());
        s.write("documents/b.md", b"1").await.unwrap();
        s.write("documents/sub/a.md", b"2").await.unwrap();
        let entries = s.list("documents").await.unwrap();
        assert_eq!(entries, vec!["b.md".to_string(), "sub/a.md".to_string()]);
    }

    #[tokio::test]
    async fn delete_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = DiskStorage::new(dir.path());
        s.delete("nope").await.unwrap();
        s.write("k", b"v").await.unwrap();
        s.delete("k").await.unwrap();
        assert!(!s.exists("k").await.unwrap());
        s.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let s = std::sync::Arc::new(DiskStorage::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..20 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                let line = format!("{{\"n\":{i}}}\n");
                s.append("c.jsonl", line.as_bytes()).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let content = s.read("c.jsonl").await.unwrap().unwrap();
        let text = String::from_utf8(content).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 20);
        for line in lines {
            assert!(serde_json::from_str::<serde_json::Value>(line).is_ok());
        }
    }
}
