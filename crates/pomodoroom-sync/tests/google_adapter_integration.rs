//! Integration tests for the Google adapters against a mock HTTP server.
//!
//! Uses mockito so no credentials or network access are needed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use mockito::{Matcher, Server};
use pomodoroom_sync::entity::LocalTask;
use pomodoroom_sync::provider::{
    GoogleCalendarAdapter, GoogleClient, GoogleTasksAdapter, StaticTokenProvider,
};
use pomodoroom_sync::sync::RetryPolicy;
use pomodoroom_sync::{EntityAdapter, LocalEntity, SyncScope};

const OWNER: &str = "owner-1";

fn client() -> GoogleClient {
    GoogleClient::new(
        Arc::new(StaticTokenProvider::new("test-token")),
        Duration::from_secs(5),
    )
    .unwrap()
}

fn task_list() -> SyncScope {
    SyncScope::TaskList {
        list_id: "inbox".to_string(),
    }
}

fn window() -> SyncScope {
    SyncScope::TimeWindow {
        calendar_id: "primary".to_string(),
        start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
    }
}

fn task_json(id: &str, title: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "tasks#task",
        "id": id,
        "etag": format!("\"etag-{id}\""),
        "title": title,
        "status": "needsAction",
        "updated": "2024-01-01T09:00:00.000Z"
    })
}

#[tokio::test]
async fn test_tasks_pull_follows_page_tokens() {
    let mut server = Server::new_async().await;
    let base_query = "showDeleted=true&showHidden=true&showCompleted=true&maxResults=2";

    let first = server
        .mock("GET", "/lists/inbox/tasks")
        .match_header("authorization", "Bearer test-token")
        .match_query(Matcher::Exact(base_query.to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "items": [task_json("a", "One"), task_json("b", "Two")],
                "nextPageToken": "page-2"
            })
            .to_string(),
        )
        .create_async()
        .await;
    let second = server
        .mock("GET", "/lists/inbox/tasks")
        .match_query(Matcher::Exact(format!("{base_query}&pageToken=page-2")))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "items": [task_json("c", "Three")] }).to_string())
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 2);
    let remote = adapter.pull(OWNER, &task_list()).await.unwrap();

    assert!(remote.rejected.is_empty());
    let ids: Vec<&str> = remote.entities.iter().map(|r| r.remote_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(remote.entities[0].version, "\"etag-a\"");
    assert_eq!(remote.entities[2].container_id, "inbox");
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_tasks_pull_reports_malformed_items() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/lists/inbox/tasks")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "items": [task_json("a", "One"), { "id": "no-updated", "title": "x" }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 100);
    let remote = adapter.pull(OWNER, &task_list()).await.unwrap();
    assert_eq!(remote.entities.len(), 1);
    assert_eq!(remote.rejected.len(), 1);
    assert_eq!(remote.rejected[0].remote_id.as_deref(), Some("no-updated"));
    assert!(remote.rejected[0].message.contains("no updated time"));
}

#[tokio::test]
async fn test_tasks_pull_stops_on_repeated_page_token() {
    let mut server = Server::new_async().await;
    let looping = server
        .mock("GET", "/lists/inbox/tasks")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "items": [task_json("a", "One")],
                "nextPageToken": "again"
            })
            .to_string(),
        )
        .expect(2)
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 100);
    let err = adapter.pull(OWNER, &task_list()).await.unwrap_err();

    assert!(!err.is_transient());
    assert!(err.to_string().contains("repeated page token"));
    looping.assert_async().await;
}

#[tokio::test]
async fn test_remove_tolerates_not_found() {
    let mut server = Server::new_async().await;
    let gone = server
        .mock("DELETE", "/calendars/primary/events/evt-1")
        .with_status(404)
        .with_body(r#"{"error":{"code":404,"message":"Not Found"}}"#)
        .create_async()
        .await;
    let also_gone = server
        .mock("DELETE", "/calendars/primary/events/evt-2")
        .with_status(410)
        .create_async()
        .await;

    let adapter = GoogleCalendarAdapter::new(client(), server.url(), 250);
    adapter.remove(OWNER, &window(), "evt-1").await.unwrap();
    adapter.remove(OWNER, &window(), "evt-2").await.unwrap();
    gone.assert_async().await;
    also_gone.assert_async().await;
}

#[tokio::test]
async fn test_remove_surfaces_other_errors() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("DELETE", "/lists/inbox/tasks/t1")
        .with_status(403)
        .with_body("forbidden")
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 100);
    let err = adapter.remove(OWNER, &task_list(), "t1").await.unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(err.status(), Some(403));
}

#[tokio::test]
async fn test_fetch_not_found_is_none() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/lists/inbox/tasks/missing")
        .with_status(404)
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 100);
    assert!(adapter
        .fetch(OWNER, &task_list(), "missing")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_service_unavailable_is_retried_until_exhausted() {
    let mut server = Server::new_async().await;
    let unavailable = server
        .mock("GET", "/lists/inbox/tasks/t1")
        .with_status(503)
        .with_body("backend error")
        .expect(3)
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 100);
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    };
    let scope = task_list();
    let adapter = &adapter;
    let scope = &scope;
    let err = policy
        .run("fetch", move || adapter.fetch(OWNER, scope, "t1"))
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert_eq!(err.status(), Some(503));
    unavailable.assert_async().await;
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("GET", "/lists/inbox/tasks/t1")
        .with_status(429)
        .with_header("retry-after", "7")
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 100);
    let err = adapter.fetch(OWNER, &task_list(), "t1").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_push_creates_then_updates_task() {
    let mut server = Server::new_async().await;
    let create = server
        .mock("POST", "/lists/inbox/tasks")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "title": "Write report",
            "status": "needsAction"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(task_json("new-1", "Write report").to_string())
        .create_async()
        .await;
    let update = server
        .mock("PUT", "/lists/inbox/tasks/new-1")
        .match_body(Matcher::PartialJson(serde_json::json!({ "id": "new-1" })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(task_json("new-1", "Write report v2").to_string())
        .create_async()
        .await;

    let adapter = GoogleTasksAdapter::new(client(), server.url(), 100);
    let local = LocalEntity::Task(LocalTask {
        id: "t1".to_string(),
        list_id: "inbox".to_string(),
        title: "Write report".to_string(),
        notes: None,
        due: None,
        completed: false,
        completed_at: None,
        updated_at: Utc::now(),
        deleted_at: None,
        metadata: None,
    });

    let created = adapter.push(OWNER, &local, None).await.unwrap();
    assert_eq!(created.remote_id, "new-1");
    assert_eq!(created.version, "\"etag-new-1\"");

    let updated = adapter.push(OWNER, &local, Some("new-1")).await.unwrap();
    assert_eq!(updated.remote_id, "new-1");
    create.assert_async().await;
    update.assert_async().await;
}

#[tokio::test]
async fn test_calendar_watch_builds_subscription() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("POST", "/calendars/primary/events/watch")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "id": "ch-1",
            "type": "web_hook",
            "address": "https://example.test/v1/webhooks/google",
            "token": "tok"
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"kind":"api#channel","id":"ch-1","resourceId":"res-9","expiration":"1704153600000"}"#,
        )
        .create_async()
        .await;

    let adapter = GoogleCalendarAdapter::new(client(), server.url(), 250);
    let sub = adapter
        .watch(
            OWNER,
            "primary",
            "ch-1",
            "https://example.test/v1/webhooks/google",
            "tok",
        )
        .await
        .unwrap();

    assert_eq!(sub.resource_id, "res-9");
    assert_eq!(sub.target, "primary");
    assert_eq!(sub.expires_at, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
}
