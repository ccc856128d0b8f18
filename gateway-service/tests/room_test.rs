//! Room lifecycle and the live feed over HTTP.

mod common;

use common::*;
use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

async fn create_room(app: &TestApp, user: &str) -> String {
    let response = app
        .post_json("/api/rooms", user, json!({"name": "Study group"}))
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    body["code"].as_str().unwrap().to_string()
}

/// Read SSE payloads until `stop` matches one or the timeout passes.
async fn read_until(
    response: reqwest::Response,
    stop: impl Fn(&Value) -> bool,
) -> Vec<Value> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut events = Vec::new();

    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(Ok(chunk)) = stream.next().await {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..end + 2).collect();
                for event in sse_payloads(&frame) {
                    let done = stop(&event);
                    events.push(event);
                    if done {
                        return;
                    }
                }
            }
        }
    })
    .await;

    events
}

#[tokio::test]
async fn last_member_leaving_deletes_the_room() {
    let app = TestApp::spawn().await;
    let code = create_room(&app, "alice").await;

    let joined = app
        .post_json("/api/rooms/join", "bob", json!({"code": code.to_lowercase()}))
        .await;
    assert_eq!(joined.status().as_u16(), 200);

    let left = app
        .post_json(&format!("/api/rooms/{}/leave", code), "alice", json!({}))
        .await;
    assert_eq!(left.status().as_u16(), 200);

    let room: Value = app
        .get(&format!("/api/rooms/{}", code), "bob")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(room["members"], json!(["bob"]));

    app.post_json(&format!("/api/rooms/{}/leave", code), "bob", json!({}))
        .await;
    let gone = app.get(&format!("/api/rooms/{}", code), "bob").await;
    assert_eq!(gone.status().as_u16(), 404);
}

#[tokio::test]
async fn room_access_is_limited_to_members() {
    let app = TestApp::spawn().await;
    let code = create_room(&app, "alice").await;

    let outsider = app.get(&format!("/api/rooms/{}", code), "mallory").await;
    assert_eq!(outsider.status().as_u16(), 403);

    let listed: Value = app.get("/api/rooms", "alice").await.json().await.unwrap();
    assert_eq!(listed["rooms"][0]["code"], code.as_str());
    let empty: Value = app.get("/api/rooms", "mallory").await.json().await.unwrap();
    assert!(empty["rooms"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn viewers_see_the_agent_reply_stream() {
    let app = TestApp::spawn().await;
    app.mock_router(DEFAULT_MODEL).await;
    app.mock_stream(DEFAULT_MODEL, &["Hi", " all"], 6, 2).await;

    let code = create_room(&app, "alice").await;
    app.post_json("/api/rooms/join", "bob", json!({"code": code}))
        .await;

    let feed = app.get(&format!("/api/rooms/{}/stream", code), "bob").await;
    assert_eq!(feed.status().as_u16(), 200);

    let posted = app
        .post_json(
            &format!("/api/rooms/{}/messages", code),
            "alice",
            json!({"content": "hello everyone"}),
        )
        .await;
    assert_eq!(posted.status().as_u16(), 202);

    let events = read_until(feed, |e| {
        e["type"] == "message" && e["message"]["role"] == "assistant"
    })
    .await;
    let types: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();

    assert_eq!(types.first(), Some(&"ready"));
    assert!(types.contains(&"ai_start"));
    let streamed: String = events
        .iter()
        .filter(|e| e["type"] == "ai_delta")
        .filter_map(|e| e["content"].as_str())
        .collect();
    assert_eq!(streamed, "Hi all");
    let reply = events.last().unwrap();
    assert_eq!(reply["message"]["content"], "Hi all");
    assert_eq!(reply["message"]["model"], DEFAULT_MODEL);

    let room: Value = app
        .get(&format!("/api/rooms/{}", code), "alice")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(room["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn system_prompt_and_clear() {
    let app = TestApp::spawn().await;
    let code = create_room(&app, "alice").await;

    let updated: Value = app
        .client
        .put(app.url(&format!("/api/rooms/{}/system-prompt", code)))
        .header("X-User-ID", "alice")
        .json(&json!({"system_prompt": "Answer in haiku"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["system_prompt"], "Answer in haiku");

    let cleared = app
        .post_json(&format!("/api/rooms/{}/clear", code), "alice", json!({}))
        .await;
    assert_eq!(cleared.status().as_u16(), 200);

    let room: Value = app
        .get(&format!("/api/rooms/{}", code), "alice")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(room["system_prompt"], "Answer in haiku");
    assert!(room["messages"].as_array().unwrap().is_empty());
}
