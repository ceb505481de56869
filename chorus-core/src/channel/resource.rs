//! Content-addressed blobs under `resources/<id>.<ext>` (spec.md §3.3).

use serde::{Deserialize, Serialize};

/// Extensions probed in order when reading a resource by id (spec.md §3.3).
pub const RESOURCE_EXTENSIONS: [&str; 4] = ["md", "json", "diff", "txt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Markdown,
    Json,
    Diff,
    Text,
}

impl ResourceType {
    pub fn extension(self) -> &'static str {
        match self {
            ResourceType::Markdown => "md",
            ResourceType::Json => "json",
            ResourceType::Diff => "diff",
            ResourceType::Text => "txt",
        }
    }
}

/// Result of `resource_create` (spec.md §4.4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub hint: String,
}
