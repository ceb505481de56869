//! The sole durable communication unit (spec.md §3.1): an ordered, immutable message
//! appended to the channel log. Mentions are a pure function of `content` and the
//! valid-agent set at append time (spec.md §8 "Mention purity").

use serde::{Deserialize, Serialize};

/// Reserved `from`/`to` identities that are never members of a workflow's agent set.
pub const RESERVED_SYSTEM: &str = "system";
pub const RESERVED_USER: &str = "user";

/// Message classification (spec.md §3.1). Absent in the wire form means `Message`
/// (the ordinary conversational kind); every other kind serializes explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    System,
    Output,
    ToolCall,
    Debug,
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::Message
    }
}

impl MessageKind {
    fn is_default(&self) -> bool {
        matches!(self, MessageKind::Message)
    }
}

/// Populated iff `kind = tool_call` (spec.md §3.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub name: String,
    pub args: serde_json::Value,
    pub source: String,
}

/// One entry in `channel.jsonl`. Field names and value encodings are part of the
/// on-disk wire contract (spec.md §6.1): any implementation's disk must be readable
/// by any other, so this struct must not gain/lose required fields or rename them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: String,
    pub from: String,
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "MessageKind::is_default")]
    pub kind: MessageKind,
    #[serde(default, rename = "toolCall", skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallInfo>,
    /// Operator-debugging convenience (SPEC_FULL.md §3 supplement): which backend
    /// produced this message. Never reasoned about by core logic; omitted entirely
    /// when absent so other implementations' `channel.jsonl` files stay bit-exact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Message {
    /// Kinds never delivered into an agent's inbox (spec.md §4.2 `getInbox` step 3).
    pub fn is_inbox_eligible_kind(kind: MessageKind) -> bool {
        !matches!(
            kind,
            MessageKind::System | MessageKind::Debug | MessageKind::ToolCall | MessageKind::Output
        )
    }

    /// Kinds hidden from agent-facing `readChannel` (spec.md §4.2 "Read with visibility filter").
    pub fn is_agent_visible_kind(kind: MessageKind) -> bool {
        !matches!(
            kind,
            MessageKind::System | MessageKind::Debug | MessageKind::ToolCall | MessageKind::Output
        )
    }
}

/// `true` iff `name` matches `[A-Za-z][A-Za-z0-9_-]*` (spec.md §3.1).
pub fn is_valid_agent_name_token(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Extracts `@name` mentions from `content`, keeping only names present in
/// `valid_agents`, deduplicated, in first-occurrence order (spec.md §3.1, §8).
pub fn extract_mentions<S: AsRef<str>>(content: &str, valid_agents: &[S]) -> Vec<String> {
    let valid: std::collections::HashSet<&str> = valid_agents.iter().map(|s| s.as_ref()).collect();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    let bytes = content.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'@' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() {
                let c = content[end..].chars().next().unwrap();
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    end += c.len_utf8();
                } else {
                    break;
                }
            }
            let candidate = &content[start..end];
            if !candidate.is_empty()
                && is_valid_agent_name_token(candidate)
                && valid.contains(candidate)
                && seen.insert(candidate.to_string())
            {
                out.push(candidate.to_string());
            }
            i = if end > i { end } else { i + 1 };
        } else {
            i += 1;
        }
    }
    out
}

/// Current UTC time as ISO-8601 with millisecond precision (spec.md §3.1).
pub fn now_iso8601_millis() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}
