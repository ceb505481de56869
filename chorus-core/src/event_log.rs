//! Event log (spec.md §4.3): a thin facade over `ChannelStore::append_message`
//! that sets `kind` uniformly for non-conversational entries. Every method is
//! fire-and-forget by design — logging must never block agent execution or
//! fail a tool call (spec.md §4.3), so failures are logged via `tracing::warn!`
//! and swallowed rather than propagated.

use std::sync::Arc;

use crate::channel::ChannelStore;
use crate::message::{MessageKind, ToolCallInfo};

/// Classifies events into `message | system | output | tool_call | debug`
/// kinds before they reach the channel (spec.md §2 "Event log / tool-call
/// recorder").
pub struct EventLog {
    store: Arc<ChannelStore>,
}

impl EventLog {
    pub fn new(store: Arc<ChannelStore>) -> Self {
        Self { store }
    }

    pub async fn tool_call(
        &self,
        agent: &str,
        name: &str,
        args: serde_json::Value,
        source: &str,
    ) {
        let tool_call = ToolCallInfo {
            name: name.to_string(),
            args,
            source: source.to_string(),
        };
        let result = self
            .store
            .append_message(
                agent.to_string(),
                format!("called tool {name}"),
                None,
                MessageKind::ToolCall,
                Some(tool_call),
                None,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(agent, name, error = %e, "event_log: failed to record tool_call");
        }
    }

    pub async fn system(&self, from: &str, msg: impl Into<String>) {
        let result = self
            .store
            .append_message(from.to_string(), msg, None, MessageKind::System, None, None)
            .await;
        if let Err(e) = result {
            tracing::warn!(from, error = %e, "event_log: failed to record system entry");
        }
    }

    pub async fn output(&self, agent: &str, text: impl Into<String>) {
        let result = self
            .store
            .append_message(
                agent.to_string(),
                text,
                None,
                MessageKind::Output,
                None,
                None,
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(agent, error = %e, "event_log: failed to record output entry");
        }
    }

    pub async fn debug(&self, from: &str, msg: impl Into<String>) {
        let result = self
            .store
            .append_message(from.to_string(), msg, None, MessageKind::Debug, None, None)
            .await;
        if let Err(e) = result {
            tracing::warn!(from, error = %e, "event_log: failed to record debug entry");
        }
    }
}
