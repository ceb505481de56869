//! Per-agent inbox cursor state (spec.md §3.2): one JSON object under
//! `_state/inbox.json` holding two maps, `readCursors` and `seenCursors`. Two
//! cursors give the "seen then acknowledged" two-phase model: a message can be
//! marked delivered (`seen`) independently of the agent acknowledging it after
//! processing (`read`/ack).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboxState {
    #[serde(default, rename = "readCursors")]
    pub read_cursors: HashMap<String, String>,
    #[serde(default, rename = "seenCursors")]
    pub seen_cursors: HashMap<String, String>,
}

/// Priority annotation attached to each inbox entry (spec.md §4.2 step 6):
/// a direct message outranks an `@mention`, which outranks a system-authored
/// mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxPriority {
    SystemMention,
    Mention,
    DirectMessage,
}

/// One entry returned by `getInbox` (spec.md §4.4 `my_inbox`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: String,
    pub from: String,
    pub content: String,
    pub timestamp: String,
    pub priority: InboxPriority,
    pub seen: bool,
}

/// Agent status set by `my_status_set` (SPEC_FULL.md §3 supplement), held
/// alongside inbox state under `_state/agent_status.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AgentRunState>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunState {
    Idle,
    Running,
}
