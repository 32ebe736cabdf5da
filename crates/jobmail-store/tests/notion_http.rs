use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{patch, post};
use axum::{Json, Router};
use jobmail_core::{props, PropertySet, PropertyValue};
use jobmail_store::{BackoffPolicy, DocumentStore, HttpClientConfig, NotionConfig, NotionStore};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Seen {
    method: &'static str,
    path: String,
    body: Value,
}

/// Notion stand-in: records every call and answers from scripted state.
#[derive(Default)]
struct FakeNotion {
    seen: Mutex<Vec<Seen>>,
    append_failures: Mutex<VecDeque<StatusCode>>,
    page_failures: Mutex<VecDeque<StatusCode>>,
    missing: Vec<&'static str>,
    titles: Vec<&'static str>,
    matches: HashMap<&'static str, Vec<&'static str>>,
    versions: Mutex<Vec<String>>,
}

impl FakeNotion {
    fn record(&self, method: &'static str, path: String, body: Value) {
        self.seen.lock().unwrap().push(Seen { method, path, body });
    }

    fn calls(&self, method: &str, path: &str) -> Vec<Seen> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.method == method && s.path == path)
            .cloned()
            .collect()
    }
}

fn failure(status: StatusCode) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "object": "error", "status": status.as_u16() })))
}

async fn query(
    State(fake): State<Arc<FakeNotion>>,
    Path(db): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    fake.record("POST", format!("/databases/{db}/query"), body.clone());
    let filter = &body["filter"];
    let prop = filter["property"].as_str().unwrap_or_default();
    if fake.missing.iter().any(|m| *m == prop) {
        let message = format!("Could not find property with name or id: {prop}");
        return (StatusCode::BAD_REQUEST, Json(json!({ "message": message })));
    }
    if fake.titles.iter().any(|t| *t == prop) && filter.get("rich_text").is_some() {
        let message = format!("database property title does not match filter rich_text: {prop}");
        return (StatusCode::BAD_REQUEST, Json(json!({ "message": message })));
    }

    let ids = fake.matches.get(prop).cloned().unwrap_or_default();
    let offset: usize = body["start_cursor"]
        .as_str()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let results: Vec<Value> = ids
        .get(offset)
        .map(|id| json!({ "id": id, "properties": {} }))
        .into_iter()
        .collect();
    let body = json!({
        "results": results,
        "has_more": offset + 1 < ids.len(),
        "next_cursor": (offset + 1).to_string(),
    });
    (StatusCode::OK, Json(body))
}

async fn append_children(
    State(fake): State<Arc<FakeNotion>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    fake.record("PATCH", format!("/blocks/{id}/children"), body);
    if let Some(version) = headers.get("Notion-Version").and_then(|v| v.to_str().ok()) {
        fake.versions.lock().unwrap().push(version.to_string());
    }
    match fake.append_failures.lock().unwrap().pop_front() {
        Some(status) => failure(status),
        None => (StatusCode::OK, Json(json!({ "results": [] }))),
    }
}

async fn list_children(
    State(fake): State<Arc<FakeNotion>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    fake.record("GET", format!("/blocks/{id}/children"), json!(params));
    let paragraph = |text: &str| {
        json!({ "type": "paragraph", "paragraph": { "rich_text": [{ "plain_text": text }] } })
    };
    match params.get("start_cursor") {
        None => Json(json!({
            "results": [paragraph("From: a\nSubject: b"), paragraph("Hello")],
            "has_more": true,
            "next_cursor": "more",
        })),
        Some(_) => Json(json!({
            "results": [
                { "type": "divider", "divider": {} },
                { "type": "callout", "callout": { "rich_text": [{ "plain_text": "[log] done" }] } },
            ],
            "has_more": false,
            "next_cursor": null,
        })),
    }
}

async fn update_page(
    State(fake): State<Arc<FakeNotion>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    fake.record("PATCH", format!("/pages/{id}"), body);
    match fake.page_failures.lock().unwrap().pop_front() {
        Some(status) => failure(status),
        None => (StatusCode::OK, Json(json!({ "id": id }))),
    }
}

async fn create_page(State(fake): State<Arc<FakeNotion>>, Json(body): Json<Value>) -> Json<Value> {
    fake.record("POST", "/pages".to_string(), body);
    Json(json!({ "id": "page-new" }))
}

async fn serve(fake: Arc<FakeNotion>) -> String {
    let app = Router::new()
        .route("/databases/{db}/query", post(query))
        .route("/blocks/{id}/children", patch(append_children).get(list_children))
        .route("/pages/{id}", patch(update_page))
        .route("/pages", post(create_page))
        .with_state(fake);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

async fn store_for(fake: &Arc<FakeNotion>) -> NotionStore {
    let mut config = NotionConfig::new("secret", "db1");
    config.api_base = serve(fake.clone()).await;
    config.http = HttpClientConfig {
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..HttpClientConfig::default()
    };
    NotionStore::new(config).expect("store")
}

fn changes() -> PropertySet {
    PropertySet::from([(props::SUMMARY.to_string(), PropertyValue::text("Recruiter reply"))])
}

#[tokio::test]
async fn failed_content_append_is_not_resent() {
    let fake = Arc::new(FakeNotion::default());
    fake.append_failures.lock().unwrap().push_back(StatusCode::BAD_GATEWAY);
    let store = store_for(&fake).await;

    let err = store
        .update_page("p1", &changes(), Some("From: a\nSubject: b\n\nHello"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("502"));
    assert_eq!(fake.calls("PATCH", "/blocks/p1/children").len(), 1);
    assert_eq!(fake.calls("PATCH", "/pages/p1").len(), 1);
}

#[tokio::test]
async fn content_append_retries_rate_limits() {
    let fake = Arc::new(FakeNotion::default());
    fake.append_failures.lock().unwrap().push_back(StatusCode::TOO_MANY_REQUESTS);
    let store = store_for(&fake).await;

    store
        .update_page("p1", &changes(), Some("From: a\nSubject: b\n\nHello"))
        .await
        .expect("update");
    let appends = fake.calls("PATCH", "/blocks/p1/children");
    assert_eq!(appends.len(), 2);
    assert_eq!(appends[1].body["children"].as_array().map(Vec::len), Some(2));
    assert!(fake.versions.lock().unwrap().iter().all(|v| v == "2022-06-28"));
}

#[tokio::test]
async fn property_updates_retry_server_errors() {
    let fake = Arc::new(FakeNotion::default());
    fake.page_failures.lock().unwrap().push_back(StatusCode::SERVICE_UNAVAILABLE);
    let store = store_for(&fake).await;

    store.update_page("p1", &changes(), None).await.expect("update");
    let patches = fake.calls("PATCH", "/pages/p1");
    assert_eq!(patches.len(), 2);
    assert_eq!(
        patches[1].body["properties"][props::SUMMARY]["rich_text"][0]["text"]["content"],
        "Recruiter reply"
    );
    assert!(fake.calls("PATCH", "/blocks/p1/children").is_empty());
}

#[tokio::test]
async fn overflow_blocks_of_a_new_page_are_appended_once() {
    let fake = Arc::new(FakeNotion::default());
    fake.append_failures.lock().unwrap().push_back(StatusCode::INTERNAL_SERVER_ERROR);
    let store = store_for(&fake).await;

    let content: Vec<String> = (0..150).map(|n| format!("paragraph {n}")).collect();
    assert!(store.create_page(&changes(), &content.join("\n\n")).await.is_err());

    let created = fake.calls("POST", "/pages");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].body["children"].as_array().map(Vec::len), Some(100));
    let appends = fake.calls("PATCH", "/blocks/page-new/children");
    assert_eq!(appends.len(), 1);
    assert_eq!(appends[0].body["children"].as_array().map(Vec::len), Some(50));
}

#[tokio::test]
async fn thread_key_lookup_falls_back_across_properties() {
    let fake = Arc::new(FakeNotion {
        missing: vec!["Conversation ID", "Identity"],
        titles: vec!["Name"],
        matches: HashMap::from([("Name", vec!["p7"])]),
        ..Default::default()
    });
    let store = store_for(&fake).await;

    let pages = store.query_by_thread_key("thread-1").await.expect("query");
    let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p7"]);

    let tried: Vec<(String, &str)> = fake
        .calls("POST", "/databases/db1/query")
        .iter()
        .map(|s| {
            let filter = &s.body["filter"];
            let kind = if filter.get("title").is_some() { "title" } else { "rich_text" };
            (filter["property"].as_str().unwrap_or_default().to_string(), kind)
        })
        .collect();
    assert_eq!(
        tried,
        vec![
            ("Conversation ID".to_string(), "rich_text"),
            ("Identity".to_string(), "rich_text"),
            ("Name".to_string(), "rich_text"),
            ("Name".to_string(), "title"),
        ]
    );
}

#[tokio::test]
async fn thread_key_lookup_fails_when_no_property_exists() {
    let fake = Arc::new(FakeNotion {
        missing: vec!["Conversation ID", "Identity", "Name", "Message ID"],
        ..Default::default()
    });
    let store = store_for(&fake).await;

    let err = store.query_by_thread_key("thread-1").await.unwrap_err();
    assert!(err.is_missing_property());
    assert_eq!(fake.calls("POST", "/databases/db1/query").len(), 4);
}

#[tokio::test]
async fn queries_follow_cursors_to_the_last_page() {
    let fake = Arc::new(FakeNotion {
        matches: HashMap::from([("Conversation ID", vec!["p1", "p2", "p3"])]),
        ..Default::default()
    });
    let store = store_for(&fake).await;

    let pages = store.query_by_thread_key("thread-1").await.expect("query");
    let ids: Vec<&str> = pages.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);

    let cursors: Vec<Option<String>> = fake
        .calls("POST", "/databases/db1/query")
        .iter()
        .map(|s| s.body["start_cursor"].as_str().map(str::to_string))
        .collect();
    assert_eq!(cursors, vec![None, Some("1".to_string()), Some("2".to_string())]);
}

#[tokio::test]
async fn page_text_joins_every_block_page() {
    let fake = Arc::new(FakeNotion::default());
    let store = store_for(&fake).await;

    let text = store.get_page_plaintext("p1").await.expect("text");
    assert_eq!(text, "From: a\nSubject: b\n\nHello\n\n[log] done");
    assert_eq!(fake.calls("GET", "/blocks/p1/children").len(), 2);
}

#[tokio::test]
async fn log_entries_are_sent_as_callouts() {
    let fake = Arc::new(FakeNotion::default());
    let store = store_for(&fake).await;

    store
        .append_log("p1", "[2026-02-03 09:05 UTC] Action 'reply' completed successfully")
        .await
        .expect("log");
    let appends = fake.calls("PATCH", "/blocks/p1/children");
    assert_eq!(appends.len(), 1);
    let block = &appends[0].body["children"][0];
    assert_eq!(block["type"], "callout");
    assert_eq!(
        block["callout"]["rich_text"][0]["text"]["content"],
        "[2026-02-03 09:05 UTC] Action 'reply' completed successfully"
    );
}
