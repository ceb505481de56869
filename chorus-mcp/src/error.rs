use thiserror::Error;

/// Errors surfaced by the MCP tool surface and transport (spec.md §7 "Tool
/// validation" / "Transport"). Tool-layer errors never throw through the
/// transport — they become a `{status:"error", error:"..."}` tool result
/// (spec.md §7); only genuinely malformed requests or unknown sessions
/// surface as HTTP status codes.
#[derive(Debug, Error)]
pub enum McpError {
    #[error(transparent)]
    Channel(#[from] chorus_core::ChannelError),
    #[error(transparent)]
    Proposal(#[from] chorus_core::ProposalError),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("{0} is not a valid agent name for this workflow")]
    UnknownAgent(String),
}

impl McpError {
    /// Renders as the `{status:"error", error:"..."}` tool-result shape
    /// (spec.md §7 "Tool validation").
    pub fn to_tool_result(&self) -> serde_json::Value {
        serde_json::json!({ "status": "error", "error": self.to_string() })
    }
}
