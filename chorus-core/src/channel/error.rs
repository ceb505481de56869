use thiserror::Error;

use crate::storage::StorageError;

/// Errors from the channel/context store (spec.md §4.2, §7).
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("document {0} already exists")]
    DocumentAlreadyExists(String),
    #[error("document {path} is owned by {owner}; write refused for {writer}")]
    DocumentOwnerMismatch {
        path: String,
        owner: String,
        writer: String,
    },
}
