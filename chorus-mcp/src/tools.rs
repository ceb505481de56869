//! MCP tool surface (spec.md §4.4): the declarative set of operations agents
//! call back into. Every handler recovers the calling agent's identity from
//! the session (resolved by the transport before dispatch reaches here) and
//! delegates to the channel store or proposal manager; validation failures
//! become a `{status:"error", error:"..."}` tool result rather than an error
//! thrown through the transport (spec.md §7 "Tool validation").

use std::sync::Arc;

use chorus_core::channel::{AgentRunState, AgentStatus, ResourceType};
use chorus_core::{ChannelStore, EventLog, MentionSink, MessageKind, ProposalManager, ProposalSpec};
use serde_json::{json, Value};

use crate::error::McpError;

/// Shared state every tool handler needs (spec.md §9: "the MCP tool closures
/// hold a non-owning handle to the store and the scheduler's `onMention`
/// callback" — `mention_sink` is that non-owning handle).
pub struct ToolContext {
    pub store: Arc<ChannelStore>,
    pub proposals: Arc<ProposalManager>,
    pub mention_sink: Arc<dyn MentionSink>,
    pub event_log: Arc<EventLog>,
}

/// Every tool name this surface declares (spec.md §4.4 table). `skill_*` is
/// named in the spec's prose as part of the registered set but its
/// inputs/effects/returns belong to the external skill-importer interface
/// (§1 Non-goal); it is therefore not dispatched here.
pub const TOOL_NAMES: &[&str] = &[
    "channel_send",
    "channel_read",
    "resource_create",
    "resource_read",
    "my_inbox",
    "my_inbox_ack",
    "my_status_set",
    "team_members",
    "team_doc_read",
    "team_doc_write",
    "team_doc_append",
    "team_doc_list",
    "team_doc_create",
    "team_proposal_create",
    "team_proposal_vote",
    "team_proposal_status",
    "team_proposal_cancel",
];

/// Dispatches one tool call. Returns `Err` only for a genuinely unknown tool
/// name (a transport-level 404-equivalent, spec.md §7 "Transport"); every
/// other failure is folded into the returned JSON as a tool-result error.
pub async fn dispatch(
    ctx: &ToolContext,
    caller: &str,
    tool: &str,
    args: Value,
) -> Result<Value, McpError> {
    ctx.event_log.tool_call(caller, tool, args.clone(), "mcp").await;
    let result = match tool {
        "channel_send" => channel_send(ctx, caller, args).await,
        "channel_read" => channel_read(ctx, caller, args).await,
        "resource_create" => resource_create(ctx, args).await,
        "resource_read" => resource_read(ctx, args).await,
        "my_inbox" => my_inbox(ctx, caller).await,
        "my_inbox_ack" => my_inbox_ack(ctx, caller, args).await,
        "my_status_set" => my_status_set(ctx, caller, args).await,
        "team_members" => team_members(ctx, caller, args).await,
        "team_doc_read" => team_doc_read(ctx, args).await,
        "team_doc_write" => team_doc_write(ctx, caller, args).await,
        "team_doc_append" => team_doc_append(ctx, caller, args).await,
        "team_doc_list" => team_doc_list(ctx).await,
        "team_doc_create" => team_doc_create(ctx, args).await,
        "team_proposal_create" => team_proposal_create(ctx, caller, args).await,
        "team_proposal_vote" => team_proposal_vote(ctx, caller, args).await,
        "team_proposal_status" => team_proposal_status(ctx, args).await,
        "team_proposal_cancel" => team_proposal_cancel(ctx, caller, args).await,
        other => return Err(McpError::UnknownTool(other.to_string())),
    };
    Ok(result.unwrap_or_else(|e| e.to_tool_result()))
}

fn require_str(args: &Value, field: &str, tool: &str) -> Result<String, McpError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| McpError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("missing or non-string field `{field}`"),
        })
}

fn optional_str(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(|v| v.as_str()).map(|s| s.to_string())
}

async fn channel_send(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let message = require_str(&args, "message", "channel_send")?;
    let to = optional_str(&args, "to");
    if let Some(to) = &to {
        if !ctx.store.valid_agents().iter().any(|a| a == to) {
            return Err(McpError::UnknownAgent(to.clone()));
        }
    }
    let msg = ctx.store.smart_send(caller, message, to.clone()).await?;

    for target in &msg.mentions {
        ctx.mention_sink.notify_mention(target);
    }
    if let Some(to) = &to {
        if !msg.mentions.iter().any(|m| m == to) {
            ctx.mention_sink.notify_mention(to);
        }
    }

    Ok(json!({
        "status": "sent",
        "timestamp": msg.timestamp,
        "mentions": msg.mentions,
        "to": msg.to,
    }))
}

async fn channel_read(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let since = optional_str(&args, "since");
    let limit = args.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);
    let entries = ctx
        .store
        .read_channel(&chorus_core::ReadFilter {
            since,
            limit,
            agent: Some(caller.to_string()),
        })
        .await?;
    Ok(serde_json::to_value(entries).unwrap_or(Value::Null))
}

async fn resource_create(ctx: &ToolContext, args: Value) -> Result<Value, McpError> {
    let content = require_str(&args, "content", "resource_create")?;
    let resource_type = match optional_str(&args, "type").as_deref() {
        Some("markdown") => ResourceType::Markdown,
        Some("json") => ResourceType::Json,
        Some("diff") => ResourceType::Diff,
        Some("text") => ResourceType::Text,
        _ if content.contains("```") => ResourceType::Markdown,
        _ => ResourceType::Text,
    };
    let handle = ctx.store.create_resource(&content, resource_type).await?;
    Ok(serde_json::to_value(handle).unwrap_or(Value::Null))
}

async fn resource_read(ctx: &ToolContext, args: Value) -> Result<Value, McpError> {
    let id = require_str(&args, "id", "resource_read")?;
    match ctx.store.read_resource(&id).await? {
        Some(content) => Ok(json!({ "content": content })),
        None => Ok(json!({ "error": format!("resource {id} not found") })),
    }
}

async fn my_inbox(ctx: &ToolContext, caller: &str) -> Result<Value, McpError> {
    let entries = ctx.store.get_inbox(caller).await?;
    let messages: Vec<Value> = entries
        .iter()
        .map(|e| {
            json!({
                "id": e.id,
                "from": e.from,
                "content": e.content,
                "timestamp": e.timestamp,
                "priority": e.priority,
            })
        })
        .collect();
    Ok(json!({ "messages": messages, "count": messages.len() }))
}

async fn my_inbox_ack(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let until = require_str(&args, "until", "my_inbox_ack")?;
    ctx.store.ack_inbox(caller, &until).await?;
    Ok(json!({ "status": "acknowledged", "until": until }))
}

async fn my_status_set(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let task = optional_str(&args, "task");
    let state = match optional_str(&args, "state").as_deref() {
        Some("idle") => Some(AgentRunState::Idle),
        Some("running") => Some(AgentRunState::Running),
        _ => None,
    };
    let metadata = args.get("metadata").cloned().unwrap_or(Value::Null);
    let status = AgentStatus {
        task: task.clone(),
        state,
        metadata: metadata.clone(),
    };
    ctx.store.set_agent_status(caller, status).await?;
    Ok(json!({ "status": "updated", "task": task, "metadata": metadata }))
}

async fn team_members(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let include_status = args
        .get("includeStatus")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mut agents = Vec::new();
    for name in ctx.store.valid_agents() {
        let mut entry = json!({ "name": name, "is_self": name == caller });
        if include_status {
            let status = ctx.store.agent_status(name).await?;
            entry["status"] = serde_json::to_value(status).unwrap_or(Value::Null);
        }
        agents.push(entry);
    }
    Ok(json!({ "agents": agents, "count": agents.len(), "status": "ok" }))
}

async fn team_doc_read(ctx: &ToolContext, args: Value) -> Result<Value, McpError> {
    let file = optional_str(&args, "file");
    let content = ctx.store.read_document(file.as_deref()).await?;
    Ok(json!({ "content": content }))
}

async fn team_doc_write(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let file = optional_str(&args, "file");
    let content = require_str(&args, "content", "team_doc_write")?;
    ctx.store.write_document(file.as_deref(), &content, caller).await?;
    Ok(json!({ "status": "ok" }))
}

async fn team_doc_append(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let file = optional_str(&args, "file");
    let content = require_str(&args, "content", "team_doc_append")?;
    ctx.store.append_document(file.as_deref(), &content, caller).await?;
    Ok(json!({ "status": "ok" }))
}

async fn team_doc_list(ctx: &ToolContext) -> Result<Value, McpError> {
    let docs = ctx.store.list_documents().await?;
    Ok(json!({ "documents": docs }))
}

async fn team_doc_create(ctx: &ToolContext, args: Value) -> Result<Value, McpError> {
    let file = require_str(&args, "file", "team_doc_create")?;
    let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let owner = optional_str(&args, "owner");
    ctx.store.create_document(&file, &content, owner.as_deref()).await?;
    Ok(json!({ "status": "ok" }))
}

fn parse_proposal_type(s: Option<&str>) -> chorus_core::proposal::ProposalType {
    use chorus_core::proposal::ProposalType;
    match s {
        Some("decision") => ProposalType::Decision,
        Some("approval") => ProposalType::Approval,
        Some("assignment") => ProposalType::Assignment,
        _ => ProposalType::Election,
    }
}

fn parse_resolution(s: Option<&str>) -> chorus_core::proposal::ResolutionMode {
    use chorus_core::proposal::ResolutionMode;
    match s {
        Some("majority") => ResolutionMode::Majority,
        Some("unanimous") => ResolutionMode::Unanimous,
        _ => ResolutionMode::Plurality,
    }
}

fn parse_tie_breaker(s: Option<&str>) -> chorus_core::proposal::TieBreaker {
    use chorus_core::proposal::TieBreaker;
    match s {
        Some("none") => TieBreaker::None,
        _ => TieBreaker::First,
    }
}

async fn team_proposal_create(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let title = require_str(&args, "title", "team_proposal_create")?;
    let options: Vec<String> = args
        .get("options")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default();
    if options.len() < 2 {
        return Err(McpError::InvalidArguments {
            tool: "team_proposal_create".to_string(),
            reason: "at least two options are required".to_string(),
        });
    }
    let spec = ProposalSpec {
        proposal_type: parse_proposal_type(optional_str(&args, "type").as_deref()),
        title: title.clone(),
        options: options.clone(),
        creator: caller.to_string(),
        binding: args.get("binding").and_then(|v| v.as_bool()).unwrap_or(false),
        resolution: parse_resolution(optional_str(&args, "resolution").as_deref()),
        quorum: args.get("quorum").and_then(|v| v.as_u64()).map(|v| v as usize),
        tie_breaker: parse_tie_breaker(optional_str(&args, "tieBreaker").as_deref()),
        expires_at: optional_str(&args, "expiresAt"),
        eligible_voters: ctx.store.valid_agents().len(),
    };
    let proposal = ctx.proposals.create(spec);

    let summary = format!(
        "@{caller} opened proposal \"{title}\" ({}): {}",
        proposal.id,
        options.join(", ")
    );
    ctx.store
        .append_message(caller.to_string(), summary, None, MessageKind::Message, None, None)
        .await?;

    Ok(serde_json::to_value(&proposal).unwrap_or(Value::Null))
}

async fn team_proposal_vote(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let id = require_str(&args, "id", "team_proposal_vote")?;
    let choice = require_str(&args, "choice", "team_proposal_vote")?;
    let proposal = ctx.proposals.vote(&id, caller, &choice)?;

    if let Some(resolved) = ctx.proposals.try_resolve(&id)? {
        if resolved.status == chorus_core::proposal::ProposalStatus::Resolved {
            let winner = resolved
                .result
                .as_ref()
                .and_then(|r| r.winner.clone())
                .unwrap_or_else(|| "no winner".to_string());
            let mention_line = resolved
                .votes
                .keys()
                .map(|v| format!("@{v}"))
                .collect::<Vec<_>>()
                .join(" ");
            let announcement = format!(
                "Proposal \"{}\" ({}) resolved: {winner}. {mention_line}",
                resolved.title, resolved.id
            );
            ctx.store
                .append_message("system".to_string(), announcement, None, MessageKind::System, None, None)
                .await?;
            for voter in resolved.votes.keys() {
                ctx.mention_sink.notify_mention(voter);
            }
            return Ok(serde_json::to_value(&resolved).unwrap_or(Value::Null));
        }
    }
    Ok(serde_json::to_value(&proposal).unwrap_or(Value::Null))
}

async fn team_proposal_status(ctx: &ToolContext, args: Value) -> Result<Value, McpError> {
    let id = require_str(&args, "id", "team_proposal_status")?;
    let proposal = ctx.proposals.get(&id)?;
    Ok(serde_json::to_value(&proposal).unwrap_or(Value::Null))
}

async fn team_proposal_cancel(ctx: &ToolContext, caller: &str, args: Value) -> Result<Value, McpError> {
    let id = require_str(&args, "id", "team_proposal_cancel")?;
    let proposal = ctx.proposals.cancel(&id, caller)?;
    Ok(serde_json::to_value(&proposal).unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::storage::MemoryStorage;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        woken: StdMutex<Vec<String>>,
    }
    impl MentionSink for RecordingSink {
        fn notify_mention(&self, target: &str) {
            self.woken.lock().unwrap().push(target.to_string());
        }
    }

    fn ctx() -> (ToolContext, Arc<RecordingSink>) {
        let store = Arc::new(ChannelStore::new(
            Arc::new(MemoryStorage::new()),
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
            2_000,
            false,
        ));
        let proposals = Arc::new(ProposalManager::new());
        let event_log = Arc::new(EventLog::new(store.clone()));
        let sink = Arc::new(RecordingSink {
            woken: StdMutex::new(Vec::new()),
        });
        (
            ToolContext {
                store,
                proposals,
                mention_sink: sink.clone() as Arc<dyn MentionSink>,
                event_log,
            },
            sink,
        )
    }

    #[tokio::test]
    async fn channel_send_wakes_mentioned_and_dm_target() {
        let (ctx, sink) = ctx();
        let result = dispatch(
            &ctx,
            "alice",
            "channel_send",
            json!({"message": "hi @bob", "to": "carol"}),
        )
        .await
        .unwrap();
        assert_eq!(result["status"], "sent");
        let woken = sink.woken.lock().unwrap().clone();
        assert!(woken.contains(&"bob".to_string()));
        assert!(woken.contains(&"carol".to_string()));
    }

    #[tokio::test]
    async fn channel_send_missing_message_is_tool_error_not_panic() {
        let (ctx, _sink) = ctx();
        let result = dispatch(&ctx, "alice", "channel_send", json!({})).await.unwrap();
        assert_eq!(result["status"], "error");
    }

    #[tokio::test]
    async fn my_inbox_then_ack_round_trip() {
        let (ctx, _sink) = ctx();
        ctx.store
            .append_message("alice", "@bob hi", None, MessageKind::Message, None, None)
            .await
            .unwrap();
        let inbox = dispatch(&ctx, "bob", "my_inbox", json!({})).await.unwrap();
        assert_eq!(inbox["count"], 1);
        let id = inbox["messages"][0]["id"].as_str().unwrap().to_string();
        let ack = dispatch(&ctx, "bob", "my_inbox_ack", json!({"until": id})).await.unwrap();
        assert_eq!(ack["status"], "acknowledged");
        let after = dispatch(&ctx, "bob", "my_inbox", json!({})).await.unwrap();
        assert_eq!(after["count"], 0);
    }

    #[tokio::test]
    async fn resource_create_and_read_round_trip() {
        let (ctx, _sink) = ctx();
        let created = dispatch(&ctx, "alice", "resource_create", json!({"content": "hello"}))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();
        let read = dispatch(&ctx, "alice", "resource_read", json!({"id": id})).await.unwrap();
        assert_eq!(read["content"], "hello");
    }

    #[tokio::test]
    async fn resource_read_missing_is_error_field_not_tool_error() {
        let (ctx, _sink) = ctx();
        let read = dispatch(&ctx, "alice", "resource_read", json!({"id": "nope"}))
            .await
            .unwrap();
        assert!(read.get("error").is_some());
    }

    #[tokio::test]
    async fn team_members_lists_all_with_self_flag() {
        let (ctx, _sink) = ctx();
        let result = dispatch(&ctx, "bob", "team_members", json!({})).await.unwrap();
        assert_eq!(result["count"], 3);
        let agents = result["agents"].as_array().unwrap();
        let bob_entry = agents.iter().find(|a| a["name"] == "bob").unwrap();
        assert_eq!(bob_entry["is_self"], true);
    }

    #[tokio::test]
    async fn team_doc_write_refused_for_non_owner() {
        let (ctx, _sink) = ctx();
        dispatch(
            &ctx,
            "alice",
            "team_doc_create",
            json!({"file": "owned.md", "content": "v1", "owner": "alice"}),
        )
        .await
        .unwrap();
        let result = dispatch(
            &ctx,
            "bob",
            "team_doc_write",
            json!({"file": "owned.md", "content": "v2"}),
        )
        .await
        .unwrap();
        assert_eq!(result["status"], "error");
    }

    #[tokio::test]
    async fn proposal_create_vote_resolve_announces_winner() {
        let (ctx, sink) = ctx();
        let created = dispatch(
            &ctx,
            "alice",
            "team_proposal_create",
            json!({"title": "pick", "options": ["p", "q"], "resolution": "plurality"}),
        )
        .await
        .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        dispatch(&ctx, "alice", "team_proposal_vote", json!({"id": id, "choice": "p"}))
            .await
            .unwrap();
        dispatch(&ctx, "bob", "team_proposal_vote", json!({"id": id, "choice": "q"}))
            .await
            .unwrap();
        let final_vote = dispatch(&ctx, "carol", "team_proposal_vote", json!({"id": id, "choice": "p"}))
            .await
            .unwrap();

        assert_eq!(final_vote["status"], "resolved");
        assert_eq!(final_vote["result"]["winner"], "p");
        let woken = sink.woken.lock().unwrap().clone();
        assert!(woken.contains(&"alice".to_string()));
        assert!(woken.contains(&"bob".to_string()));
        assert!(woken.contains(&"carol".to_string()));
    }

    #[tokio::test]
    async fn unknown_tool_is_dispatch_error() {
        let (ctx, _sink) = ctx();
        let err = dispatch(&ctx, "alice", "not_a_real_tool", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownTool(_)));
    }
}
