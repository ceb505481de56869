//! Channel/Context store (spec.md §4.2): the single source of truth for all
//! agent communication. Wraps a [`Storage`] backend with a cached, incrementally
//! tailable view over `channel.jsonl`, plus inbox cursors, resources, and
//! documents.

mod error;
mod inbox;
mod resource;

pub use error::ChannelError;
pub use inbox::{AgentRunState, AgentStatus, InboxEntry, InboxPriority, InboxState};
pub use resource::{ResourceHandle, ResourceType, RESOURCE_EXTENSIONS};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::message::{extract_mentions, now_iso8601_millis, Message, MessageKind, ToolCallInfo};
use crate::storage::Storage;

const CHANNEL_KEY: &str = "channel.jsonl";
const INBOX_STATE_KEY: &str = "_state/inbox.json";
const AGENT_STATUS_KEY: &str = "_state/agent_status.json";
const DOCUMENT_OWNERS_KEY: &str = "_state/document_owners.json";
pub const DEFAULT_DOCUMENT_PATH: &str = "team.md";

/// Filters accepted by `readChannel` (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct ReadFilter {
    /// Keep only entries with `timestamp > since`.
    pub since: Option<String>,
    /// Keep only the last `limit` entries (after the other filters apply).
    pub limit: Option<usize>,
    /// When set, apply the agent visibility filter (kind + DM isolation).
    pub agent: Option<String>,
}

/// Counters exposed for operator observability (SPEC_FULL.md §3 supplement);
/// never consulted by core coordination logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub skipped_lines: u64,
    pub synced_bytes: u64,
}

struct Cache {
    entries: Vec<Message>,
    synced_byte_offset: u64,
    run_start_index: usize,
    skipped_lines: u64,
}

impl Cache {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            synced_byte_offset: 0,
            run_start_index: 0,
            skipped_lines: 0,
        }
    }

    /// Index of the entry whose `id == id`, or `None`.
    fn index_of_id(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.id == id)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DocumentOwners {
    #[serde(default)]
    owners: HashMap<String, String>,
}

/// The channel/context store. One instance is shared (read/write) across every
/// controller, the MCP tool surface, and the scheduler's idle watcher for a
/// single workflow run (spec.md §3.7 "Ownership").
pub struct ChannelStore {
    storage: Arc<dyn Storage>,
    cache: Mutex<Cache>,
    valid_agents: Vec<String>,
    message_length_threshold: usize,
    /// Persistent ("bind") contexts leave `_state/inbox.json` intact on `destroy()`;
    /// ephemeral contexts delete it (spec.md §3.6, §4.2 "Lifecycle").
    persistent: bool,
    synced_bytes: AtomicU64,
    tail_tx: broadcast::Sender<Message>,
}

impl ChannelStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        valid_agents: Vec<String>,
        message_length_threshold: usize,
        persistent: bool,
    ) -> Self {
        let (tail_tx, _) = broadcast::channel(1024);
        Self {
            storage,
            cache: Mutex::new(Cache::new()),
            valid_agents,
            message_length_threshold,
            persistent,
            synced_bytes: AtomicU64::new(0),
            tail_tx,
        }
    }

    pub fn valid_agents(&self) -> &[String] {
        &self.valid_agents
    }

    /// Subscribes to newly-synced entries. Used only by the optional debug/
    /// display watcher path (spec.md §4.2); the scheduler and controllers never
    /// depend on it, so a lagged or dropped receiver cannot affect coordination.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tail_tx.subscribe()
    }

    pub async fn stats(&self) -> StoreStats {
        let cache = self.cache.lock().await;
        StoreStats {
            skipped_lines: cache.skipped_lines,
            synced_bytes: self.synced_bytes.load(Ordering::Relaxed),
        }
    }

    /// Reads any newly-appended bytes from `channel.jsonl`, parses each
    /// newline-terminated JSON record, and extends the cache. Malformed lines
    /// are skipped, never crash the cache (spec.md §7 "Parse error"). At most
    /// one sync is ever in flight: the `cache` mutex itself is the single-flight
    /// guard, so concurrent callers simply queue and each observes a cache that
    /// is at least as fresh as when they called.
    async fn sync_channel(&self) -> Result<(), ChannelError> {
        let mut cache = self.cache.lock().await;
        self.sync_channel_locked(&mut cache).await
    }

    async fn sync_channel_locked(&self, cache: &mut Cache) -> Result<(), ChannelError> {
        let result = self
            .storage
            .read_from(CHANNEL_KEY, cache.synced_byte_offset)
            .await?;
        if result.content.is_empty() {
            cache.synced_byte_offset = result.new_offset;
            return Ok(());
        }
        let text = String::from_utf8_lossy(&result.content);
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(msg) => {
                    let _ = self.tail_tx.send(msg.clone());
                    cache.entries.push(msg);
                }
                Err(e) => {
                    warn!("skipping malformed channel.jsonl line: {}", e);
                    cache.skipped_lines += 1;
                }
            }
        }
        cache.synced_byte_offset = result.new_offset;
        self.synced_bytes.store(result.new_offset, Ordering::Relaxed);
        Ok(())
    }

    /// Appends one message (spec.md §4.2 "Appending a message"). Low-level:
    /// does not apply the smart-send resource-extraction policy; callers that
    /// want that go through [`ChannelStore::smart_send`].
    pub async fn append_message(
        &self,
        from: impl Into<String>,
        content: impl Into<String>,
        to: Option<String>,
        kind: MessageKind,
        tool_call: Option<ToolCallInfo>,
        source: Option<String>,
    ) -> Result<Message, ChannelError> {
        let from = from.into();
        let content = content.into();
        let mentions = extract_mentions(&content, &self.valid_agents);
        let message = Message {
            id: short_id(),
            timestamp: now_iso8601_millis(),
            from,
            content,
            mentions,
            to,
            kind,
            tool_call,
            source,
        };
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        self.storage.append(CHANNEL_KEY, &line).await?;

        let mut cache = self.cache.lock().await;
        self.sync_channel_locked(&mut cache).await?;
        Ok(message)
    }

    /// Smart send (spec.md §4.2): long content is moved into a resource, mirrored
    /// into a `debug`-kind entry for operators, and replaced on the channel by a
    /// short agent-visible reference that preserves the original mentions.
    pub async fn smart_send(
        &self,
        from: impl Into<String>,
        content: impl Into<String>,
        to: Option<String>,
    ) -> Result<Message, ChannelError> {
        let from = from.into();
        let content = content.into();
        if content.len() <= self.message_length_threshold {
            return self
                .append_message(from, content, to, MessageKind::Message, None, None)
                .await;
        }

        let resource_type = if content.contains("```") {
            ResourceType::Markdown
        } else {
            ResourceType::Text
        };
        let resource = self.create_resource(&content, resource_type).await?;

        // Operator-visible full copy; never delivered to any agent's inbox or
        // `readChannel({agent})` (kind = debug).
        self.append_message(
            from.clone(),
            content.clone(),
            None,
            MessageKind::Debug,
            None,
            None,
        )
        .await?;

        let mentions = extract_mentions(&content, &self.valid_agents);
        let mention_prefix = mentions
            .iter()
            .map(|m| format!("@{m}"))
            .collect::<Vec<_>>()
            .join(" ");
        let short_content = format!(
            "{mention_prefix} [Long content stored as resource]\n\nRead the full content: resource_read(\"{id}\")\n\nReference: resource:{id}",
            id = resource.id,
        );
        self.append_message(from, short_content, to, MessageKind::Message, None, None)
            .await
    }

    /// Read with visibility filter (spec.md §4.2).
    pub async fn read_channel(&self, filter: &ReadFilter) -> Result<Vec<Message>, ChannelError> {
        let mut cache = self.cache.lock().await;
        self.sync_channel_locked(&mut cache).await?;

        let mut entries: Vec<Message> = cache.entries.clone();
        drop(cache);

        if let Some(agent) = &filter.agent {
            entries.retain(|m| {
                if !Message::is_agent_visible_kind(m.kind) {
                    return false;
                }
                match &m.to {
                    Some(to) => to == agent || &m.from == agent,
                    None => true,
                }
            });
        }
        if let Some(since) = &filter.since {
            entries.retain(|m| m.timestamp.as_str() > since.as_str());
        }
        if let Some(limit) = filter.limit {
            if entries.len() > limit {
                let start = entries.len() - limit;
                entries = entries.split_off(start);
            }
        }
        Ok(entries)
    }

    /// Incremental tail (spec.md §4.2): entries since `cursor`, plus the new
    /// cursor (the cache length after syncing).
    pub async fn tail_channel(&self, cursor: usize) -> Result<(Vec<Message>, usize), ChannelError> {
        let mut cache = self.cache.lock().await;
        self.sync_channel_locked(&mut cache).await?;
        let len = cache.entries.len();
        let entries = if cursor < len {
            cache.entries[cursor..].to_vec()
        } else {
            Vec::new()
        };
        Ok((entries, len))
    }

    /// Records the current channel length as the run-epoch floor (spec.md §3.6).
    pub async fn mark_run_start(&self) -> Result<usize, ChannelError> {
        let mut cache = self.cache.lock().await;
        self.sync_channel_locked(&mut cache).await?;
        cache.run_start_index = cache.entries.len();
        Ok(cache.run_start_index)
    }

    /// Inbox query (spec.md §4.2 `getInbox`).
    pub async fn get_inbox(&self, agent: &str) -> Result<Vec<InboxEntry>, ChannelError> {
        let inbox_state = self.load_inbox_state().await?;
        let mut cache = self.cache.lock().await;
        self.sync_channel_locked(&mut cache).await?;

        let ack_index = match inbox_state.read_cursors.get(agent) {
            None => -1i64,
            Some(id) => match cache.index_of_id(id) {
                Some(idx) => idx as i64,
                None => {
                    warn!(
                        "stale readCursors[{}] = {} does not resolve to a channel index; \
                         showing all messages since run start (spec.md open question, \"show all\" policy)",
                        agent, id
                    );
                    -1
                }
            },
        };
        let seen_index = inbox_state
            .seen_cursors
            .get(agent)
            .and_then(|id| cache.index_of_id(id));

        let start = std::cmp::max(cache.run_start_index as i64, ack_index + 1) as usize;
        let mut out = Vec::new();
        for (idx, msg) in cache.entries.iter().enumerate().skip(start) {
            if !Message::is_inbox_eligible_kind(msg.kind) {
                continue;
            }
            if msg.from == agent {
                continue;
            }
            let is_to = msg.to.as_deref() == Some(agent);
            let is_mentioned = msg.mentions.iter().any(|m| m == agent);
            if !is_to && !is_mentioned {
                continue;
            }
            let priority = if is_to {
                InboxPriority::DirectMessage
            } else if msg.from == "system" {
                InboxPriority::SystemMention
            } else {
                InboxPriority::Mention
            };
            let seen = seen_index.map(|si| idx <= si).unwrap_or(false);
            out.push(InboxEntry {
                id: msg.id.clone(),
                from: msg.from.clone(),
                content: msg.content.clone(),
                timestamp: msg.timestamp.clone(),
                priority,
                seen,
            });
        }
        Ok(out)
    }

    /// Ack monotonicity (spec.md §8): advances `readCursors[agent]` only if
    /// `index(id) >= index(current cursor)`; otherwise a no-op.
    pub async fn ack_inbox(&self, agent: &str, until: &str) -> Result<(), ChannelError> {
        let mut state = self.load_inbox_state().await?;
        let (until_index, current_index) = {
            let mut cache = self.cache.lock().await;
            self.sync_channel_locked(&mut cache).await?;
            let until_index = cache.index_of_id(until);
            let current_index = state
                .read_cursors
                .get(agent)
                .and_then(|id| cache.index_of_id(id));
            (until_index, current_index)
        };
        let Some(until_index) = until_index else {
            return Ok(());
        };
        let advances = match current_index {
            Some(cur) => until_index >= cur,
            None => true,
        };
        if advances {
            state
                .read_cursors
                .insert(agent.to_string(), until.to_string());
            self.save_inbox_state(&state).await?;
        }
        Ok(())
    }

    /// Marks a message as delivered (`seen`) without acknowledging it.
    pub async fn mark_inbox_seen(&self, agent: &str, id: &str) -> Result<(), ChannelError> {
        let mut state = self.load_inbox_state().await?;
        state.seen_cursors.insert(agent.to_string(), id.to_string());
        self.save_inbox_state(&state).await
    }

    async fn load_inbox_state(&self) -> Result<InboxState, ChannelError> {
        match self.storage.read(INBOX_STATE_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            None => Ok(InboxState::default()),
        }
    }

    async fn save_inbox_state(&self, state: &InboxState) -> Result<(), ChannelError> {
        let json = serde_json::to_vec_pretty(state)?;
        self.storage.write(INBOX_STATE_KEY, &json).await?;
        Ok(())
    }

    /// `team_members`/`my_status_set` support (SPEC_FULL.md §3 supplement).
    pub async fn set_agent_status(
        &self,
        agent: &str,
        status: AgentStatus,
    ) -> Result<(), ChannelError> {
        let mut all = self.load_agent_statuses().await?;
        all.insert(agent.to_string(), status);
        let json = serde_json::to_vec_pretty(&all)?;
        self.storage.write(AGENT_STATUS_KEY, &json).await?;
        Ok(())
    }

    pub async fn agent_status(&self, agent: &str) -> Result<Option<AgentStatus>, ChannelError> {
        Ok(self.load_agent_statuses().await?.get(agent).cloned())
    }

    async fn load_agent_statuses(&self) -> Result<HashMap<String, AgentStatus>, ChannelError> {
        match self.storage.read(AGENT_STATUS_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            None => Ok(HashMap::new()),
        }
    }

    /// Creates a content-addressed resource (spec.md §3.3, §4.2).
    pub async fn create_resource(
        &self,
        content: &str,
        resource_type: ResourceType,
    ) -> Result<ResourceHandle, ChannelError> {
        let id = short_id();
        let key = format!("resources/{id}.{}", resource_type.extension());
        self.storage.write(&key, content.as_bytes()).await?;
        Ok(ResourceHandle {
            id: id.clone(),
            reference: format!("resource:{id}"),
            hint: format!("resource_read(\"{id}\")"),
        })
    }

    /// Reads a resource by id, probing extensions in order (spec.md §3.3).
    pub async fn read_resource(&self, id: &str) -> Result<Option<String>, ChannelError> {
        for ext in RESOURCE_EXTENSIONS {
            let key = format!("resources/{id}.{ext}");
            if let Some(bytes) = self.storage.read(&key).await? {
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }
        }
        Ok(None)
    }

    fn document_key(path: &str) -> String {
        format!("documents/{path}")
    }

    pub async fn read_document(&self, path: Option<&str>) -> Result<Option<String>, ChannelError> {
        let path = path.unwrap_or(DEFAULT_DOCUMENT_PATH);
        Ok(self
            .storage
            .read(&Self::document_key(path))
            .await?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    pub async fn write_document(
        &self,
        path: Option<&str>,
        content: &str,
        writer: &str,
    ) -> Result<(), ChannelError> {
        let path = path.unwrap_or(DEFAULT_DOCUMENT_PATH);
        self.check_document_owner(path, writer).await?;
        self.storage
            .write(&Self::document_key(path), content.as_bytes())
            .await?;
        Ok(())
    }

    pub async fn append_document(
        &self,
        path: Option<&str>,
        content: &str,
        writer: &str,
    ) -> Result<(), ChannelError> {
        let path = path.unwrap_or(DEFAULT_DOCUMENT_PATH);
        self.check_document_owner(path, writer).await?;
        self.storage
            .append(&Self::document_key(path), content.as_bytes())
            .await?;
        Ok(())
    }

    /// Creates a document; fails if it already exists (spec.md §4.2).
    pub async fn create_document(
        &self,
        path: &str,
        content: &str,
        owner: Option<&str>,
    ) -> Result<(), ChannelError> {
        if self.storage.exists(&Self::document_key(path)).await? {
            return Err(ChannelError::DocumentAlreadyExists(path.to_string()));
        }
        self.storage
            .write(&Self::document_key(path), content.as_bytes())
            .await?;
        if let Some(owner) = owner {
            let mut owners = self.load_document_owners().await?;
            owners.owners.insert(path.to_string(), owner.to_string());
            self.save_document_owners(&owners).await?;
        }
        Ok(())
    }

    /// Only `.md` entries are listed (spec.md §3.4, §6.1).
    pub async fn list_documents(&self) -> Result<Vec<String>, ChannelError> {
        let entries = self.storage.list("documents").await?;
        Ok(entries.into_iter().filter(|e| e.ends_with(".md")).collect())
    }

    async fn check_document_owner(&self, path: &str, writer: &str) -> Result<(), ChannelError> {
        let owners = self.load_document_owners().await?;
        if let Some(owner) = owners.owners.get(path) {
            if owner != writer {
                return Err(ChannelError::DocumentOwnerMismatch {
                    path: path.to_string(),
                    owner: owner.clone(),
                    writer: writer.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn load_document_owners(&self) -> Result<DocumentOwners, ChannelError> {
        match self.storage.read(DOCUMENT_OWNERS_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            None => Ok(DocumentOwners::default()),
        }
    }

    async fn save_document_owners(&self, owners: &DocumentOwners) -> Result<(), ChannelError> {
        let json = serde_json::to_vec_pretty(owners)?;
        self.storage.write(DOCUMENT_OWNERS_KEY, &json).await?;
        Ok(())
    }

    /// Ephemeral contexts wipe inbox state on shutdown; bind (persistent)
    /// contexts leave state intact for the next run (spec.md §4.2 "Lifecycle").
    pub async fn destroy(&self) -> Result<(), ChannelError> {
        if !self.persistent {
            self.storage.delete(INBOX_STATE_KEY).await?;
        }
        Ok(())
    }
}

/// Short, locally-unique id used for message and resource ids (spec.md §3.1: "opaque
/// short string, locally unique").
fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}
