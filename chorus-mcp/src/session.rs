//! MCP session lifecycle (spec.md §4.5): one session per agent. The session
//! id encodes the agent identity so that every subsequent tool call can
//! recover "who is calling" without a separate authentication mechanism —
//! trusted because the transport only listens on loopback.

use dashmap::DashMap;

/// Session id format: `<agentName>-<8 lowercase hex chars>` (spec.md §6.2).
pub fn new_session_id(agent: &str) -> String {
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!("{agent}-{suffix}")
}

/// Recovers the agent identity from a session id by stripping the trailing
/// `-<8hex>` suffix (spec.md §4.5 "parsing the session id prefix before the
/// final `-<8-hex>`").
pub fn agent_from_session_id(session_id: &str) -> Option<&str> {
    let (prefix, suffix) = session_id.rsplit_once('-')?;
    if suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        Some(prefix)
    } else {
        None
    }
}

/// Live MCP sessions, keyed by session id. Mutated only on connect/disconnect;
/// routing takes a read-only lookup (spec.md §5 "The MCP session map is
/// mutated only on connect/disconnect").
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<String, String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new session for `agent`, returning its id.
    pub fn connect(&self, agent: &str) -> String {
        let id = new_session_id(agent);
        self.sessions.insert(id.clone(), agent.to_string());
        id
    }

    pub fn agent_for(&self, session_id: &str) -> Option<String> {
        self.sessions.get(session_id).map(|v| v.clone())
    }

    pub fn disconnect(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_agent_name() {
        let id = new_session_id("alice");
        assert_eq!(agent_from_session_id(&id), Some("alice"));
    }

    #[test]
    fn session_id_preserves_hyphenated_agent_names() {
        let id = new_session_id("agent-one");
        assert_eq!(agent_from_session_id(&id), Some("agent-one"));
    }

    #[test]
    fn connect_then_lookup_then_disconnect() {
        let table = SessionTable::new();
        let id = table.connect("bob");
        assert_eq!(table.agent_for(&id), Some("bob".to_string()));
        assert!(table.disconnect(&id));
        assert_eq!(table.agent_for(&id), None);
    }

    #[test]
    fn unknown_session_id_has_no_agent() {
        let table = SessionTable::new();
        assert_eq!(table.agent_for("nope-00000000"), None);
    }
}
