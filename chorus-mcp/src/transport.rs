//! Session-multiplexed MCP HTTP transport (spec.md §4.5): a single endpoint
//! at `/mcp`. `POST` carries `initialize` or a tool call, `GET` upgrades to
//! an SSE notification stream for the caller's session, `DELETE` closes the
//! session. The server is bound to loopback only, so the agent identity
//! carried by the session id can be trusted without a separate auth layer.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

use crate::session::SessionTable;
use crate::tools::{dispatch, ToolContext, TOOL_NAMES};

const SESSION_HEADER: &str = "mcp-session-id";

/// Shared axum state: the tool dispatch context plus the live session table.
#[derive(Clone)]
pub struct McpState {
    pub tools: Arc<ToolContext>,
    pub sessions: Arc<SessionTable>,
}

pub fn router(state: McpState) -> Router {
    Router::new()
        .route("/mcp", get(sse_handler).post(rpc_handler).delete(disconnect_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct AgentQuery {
    agent: String,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    id: Value,
    result: Value,
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `POST /mcp?agent=X`: `initialize` mints a session for `agent` and returns
/// its id; every other method is a tool call dispatched under the identity
/// recovered from the `mcp-session-id` header (spec.md §4.5).
async fn rpc_handler(
    State(state): State<McpState>,
    Query(q): Query<AgentQuery>,
    headers: HeaderMap,
    Json(req): Json<RpcRequest>,
) -> Response {
    if req.method == "initialize" {
        if !state.tools.store.valid_agents().iter().any(|a| a == &q.agent) {
            return (
                StatusCode::FORBIDDEN,
                format!("{} is not a valid agent name for this workflow", q.agent),
            )
                .into_response();
        }
        let session_id = state.sessions.connect(&q.agent);
        return Json(RpcResponse {
            id: req.id,
            result: json!({ "sessionId": session_id, "tools": TOOL_NAMES }),
        })
        .into_response();
    }

    let Some(session_id) = session_header(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing mcp-session-id header").into_response();
    };
    let Some(caller) = state.sessions.agent_for(&session_id) else {
        return (StatusCode::NOT_FOUND, "unknown mcp session").into_response();
    };

    match dispatch(&state.tools, &caller, &req.method, req.params).await {
        Ok(result) => Json(RpcResponse { id: req.id, result }).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// `GET /mcp`: an SSE stream of newly-tailed channel entries for this
/// session's agent (spec.md §4.2 "optional debug/display watcher path").
async fn sse_handler(
    State(state): State<McpState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    let session_id = session_header(&headers)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, "missing mcp-session-id header").into_response())?;
    if state.sessions.agent_for(&session_id).is_none() {
        return Err((StatusCode::NOT_FOUND, "unknown mcp session").into_response());
    }

    let rx = state.tools.store.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| {
        item.ok().map(|msg| {
            Event::default()
                .json_data(&msg)
                .unwrap_or_else(|_| Event::default().data("serialize error"))
        })
    });
    Ok(Sse::new(stream.map(Ok)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// `DELETE /mcp`: closes the caller's session (spec.md §4.5 "onDisconnect").
async fn disconnect_handler(State(state): State<McpState>, headers: HeaderMap) -> StatusCode {
    match session_header(&headers) {
        Some(session_id) if state.sessions.disconnect(&session_id) => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}
