use super::common::spawn_server;

#[tokio::test]
async fn initialize_unknown_agent_is_forbidden() {
    let (server, _store) = spawn_server(&["alice", "bob"]).await;
    let base = format!("http://{}", server.addr());
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/mcp?agent=mallory"))
        .json(&serde_json::json!({"id": 1, "method": "initialize", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn initialize_known_agent_returns_session_id() {
    let (server, _store) = spawn_server(&["alice", "bob"]).await;
    let base = format!("http://{}", server.addr());
    let session_id = super::common::initialize(&base, "alice").await;
    assert!(session_id.starts_with("alice-"));
    assert_eq!(chorus_mcp::agent_from_session_id(&session_id), Some("alice"));
}
