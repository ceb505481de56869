//! Shared helpers for e2e tests: spin up a real `McpServer` on loopback and
//! drive it over HTTP with `reqwest`, the way an agent subprocess would.

use std::sync::Arc;

use chorus_core::storage::MemoryStorage;
use chorus_core::{ChannelStore, EventLog, MentionSink, ProposalManager};
use chorus_mcp::{McpServer, ToolContext};

/// Discards every mention (no controllers exist in these tests).
pub struct NoopMentionSink;
impl MentionSink for NoopMentionSink {
    fn notify_mention(&self, _target: &str) {}
}

pub async fn spawn_server(agents: &[&str]) -> (McpServer, Arc<ChannelStore>) {
    let store = Arc::new(ChannelStore::new(
        Arc::new(MemoryStorage::new()),
        agents.iter().map(|s| s.to_string()).collect(),
        2_000,
        false,
    ));
    let tools = ToolContext {
        store: store.clone(),
        proposals: Arc::new(ProposalManager::new()),
        mention_sink: Arc::new(NoopMentionSink) as Arc<dyn MentionSink>,
        event_log: Arc::new(EventLog::new(store.clone())),
    };
    let server = McpServer::bind("127.0.0.1:0".parse().unwrap(), tools)
        .await
        .unwrap();
    (server, store)
}

pub async fn initialize(base: &str, agent: &str) -> String {
    let client = reqwest::Client::new();
    let resp: serde_json::Value = client
        .post(format!("{base}/mcp?agent={agent}"))
        .json(&serde_json::json!({"id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    resp["result"]["sessionId"].as_str().unwrap().to_string()
}
