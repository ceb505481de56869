use super::common::{initialize, spawn_server};

#[tokio::test]
async fn channel_send_then_bob_reads_inbox() {
    let (server, _store) = spawn_server(&["alice", "bob"]).await;
    let base = format!("http://{}", server.addr());
    let client = reqwest::Client::new();

    let alice_session = initialize(&base, "alice").await;
    let bob_session = initialize(&base, "bob").await;

    let send_resp: serde_json::Value = client
        .post(format!("{base}/mcp?agent=alice"))
        .header("mcp-session-id", &alice_session)
        .json(&serde_json::json!({
            "id": 2,
            "method": "channel_send",
            "params": {"message": "hi @bob"},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(send_resp["result"]["status"], "sent");

    let inbox_resp: serde_json::Value = client
        .post(format!("{base}/mcp?agent=bob"))
        .header("mcp-session-id", &bob_session)
        .json(&serde_json::json!({"id": 3, "method": "my_inbox", "params": {}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(inbox_resp["result"]["count"], 1);
    assert_eq!(inbox_resp["result"]["messages"][0]["from"], "alice");
}

#[tokio::test]
async fn tool_call_without_session_header_is_bad_request() {
    let (server, _store) = spawn_server(&["alice"]).await;
    let base = format!("http://{}", server.addr());
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/mcp?agent=alice"))
        .json(&serde_json::json!({"id": 1, "method": "my_inbox", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn tool_call_with_unknown_session_is_not_found() {
    let (server, _store) = spawn_server(&["alice"]).await;
    let base = format!("http://{}", server.addr());
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/mcp?agent=alice"))
        .header("mcp-session-id", "alice-deadbeef")
        .json(&serde_json::json!({"id": 1, "method": "my_inbox", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disconnect_invalidates_session() {
    let (server, _store) = spawn_server(&["alice"]).await;
    let base = format!("http://{}", server.addr());
    let client = reqwest::Client::new();
    let session_id = initialize(&base, "alice").await;

    let delete_resp = client
        .delete(format!("{base}/mcp"))
        .header("mcp-session-id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(delete_resp.status(), reqwest::StatusCode::NO_CONTENT);

    let resp = client
        .post(format!("{base}/mcp?agent=alice"))
        .header("mcp-session-id", &session_id)
        .json(&serde_json::json!({"id": 1, "method": "my_inbox", "params": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}
