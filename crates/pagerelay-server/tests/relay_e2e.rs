//! End-to-end tests: a scripted worker on a real WebSocket, callers over HTTP.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use pagerelay::{QueryProfiles, RelayConfig};
use pagerelay_server::state::AppState;

type WorkerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─────────────────────── helpers ───────────────────────

struct TestServer {
    base: String,
    ws_url: String,
    dir: tempfile::TempDir,
    _stop: oneshot::Sender<()>,
}

async fn start_server() -> TestServer {
    let dir = tempfile::TempDir::new().unwrap();
    let config = RelayConfig {
        request_timeout: Duration::from_secs(1),
        page_delay: Duration::from_millis(1),
        target_delay: Duration::from_millis(1),
        profiles: QueryProfiles::default(),
        ..RelayConfig::default()
    };
    let state = Arc::new(AppState::open(dir.path(), config).unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(pagerelay_server::serve_with_shutdown(listener, state, async move {
        let _ = stopped.await;
    }));

    TestServer {
        base: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        dir,
        _stop: stop,
    }
}

/// Connect a worker, check the greeting, and register `identity`.
async fn connect_worker(server: &TestServer, identity: &str) -> WorkerSocket {
    let (mut ws, _) = connect_async(server.ws_url.as_str()).await.unwrap();
    let greeting = next_json(&mut ws).await.unwrap();
    assert_eq!(greeting["type"], "heartbeat_request");

    ws.send(Message::Text(json!({"type": "register", "id": identity}).to_string()))
        .await
        .unwrap();
    wait_for_worker(server, identity).await;
    ws
}

async fn next_json(ws: &mut WorkerSocket) -> Option<Value> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(text) = msg {
            return Some(serde_json::from_str(&text).unwrap());
        }
    }
    None
}

async fn wait_for_worker(server: &TestServer, identity: &str) {
    for _ in 0..100 {
        let health: Value = reqwest::get(format!("{}/health", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let registered = health["workers"]
            .as_array()
            .is_some_and(|w| w.iter().any(|id| id == identity));
        if registered {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("worker {identity} never registered");
}

/// Answer api calls until the socket closes.
///
/// `echo` returns its params, `fail` reports an error, `silent` never
/// answers, anything else pages through two items per target.
async fn run_worker(mut ws: WorkerSocket) {
    while let Some(frame) = next_json(&mut ws).await {
        if frame["type"] != "api_call" {
            continue;
        }
        let request_id = frame["requestId"].clone();
        let params = &frame["apiparams"];
        let reply = match frame["apiname"].as_str().unwrap_or_default() {
            "echo" => json!({"type": "response", "requestId": request_id, "result": params}),
            "fail" => json!({"type": "response", "requestId": request_id, "error": "boom"}),
            "silent" => continue,
            _ => {
                let url = params["url"].as_str().unwrap_or_default();
                let page = match params["cursor"].as_str().unwrap_or_default() {
                    "" => json!([{"id": format!("{url}#1"), "cursor": "c1"}]),
                    _ => json!([{"id": format!("{url}#2"), "cursor": ""}]),
                };
                json!({"type": "response", "requestId": request_id, "result": page})
            }
        };
        if ws.send(Message::Text(reply.to_string())).await.is_err() {
            break;
        }
    }
}

async fn post(server: &TestServer, path: &str, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(format!("{}{path}", server.base))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap_or(Value::Null))
}

// ─────────────────────── tests ───────────────────────

#[tokio::test]
async fn test_call_round_trip_and_worker_error() {
    let server = start_server().await;
    let ws = connect_worker(&server, "w1").await;
    tokio::spawn(run_worker(ws));

    let (status, body) = post(
        &server,
        "/call",
        json!({"id": "w1", "apiname": "echo", "apiparams": {"x": 1}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], json!({"x": 1}));

    let (status, body) = post(&server, "/call", json!({"id": "w1", "apiname": "fail"})).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], Value::Null);
    assert_eq!(body["error"], "boom");
}

#[tokio::test]
async fn test_call_error_statuses() {
    let server = start_server().await;
    let ws = connect_worker(&server, "w1").await;
    tokio::spawn(run_worker(ws));

    let (status, _) = post(&server, "/call", json!({"id": "w1"})).await;
    assert_eq!(status, 400);

    let (status, body) = post(&server, "/call", json!({"id": "ghost", "apiname": "echo"})).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Client not connected");

    let (status, _) = post(&server, "/call", json!({"id": "w1", "apiname": "silent"})).await;
    assert_eq!(status, 504);

    let health: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["in_flight"], 0);
}

#[tokio::test]
async fn test_fetch_runs_every_target() {
    let server = start_server().await;
    let ws = connect_worker(&server, "w1").await;
    tokio::spawn(run_worker(ws));

    let (status, report) = post(
        &server,
        "/fetch",
        json!({
            "id": "w1",
            "apiname": "get_list_ig_post",
            "apiparams": {"url": "https://www.instagram.com/jane/,\nhttps://www.instagram.com/john"}
        }),
    )
    .await;
    assert_eq!(status, 200);

    let rows = report["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["username"], "jane");
    assert_eq!(rows[0]["total"], 2);
    assert_eq!(rows[0]["pages"], 2);
    assert_eq!(rows[1]["username"], "john");
    assert_eq!(report["items"].as_array().unwrap().len(), 4);
    assert_eq!(report["items"][0]["originalUrl"], "https://www.instagram.com/jane/");

    let persisted = std::fs::read_to_string(server.dir.path().join("target_reports.jsonl")).unwrap();
    assert_eq!(persisted.lines().count(), 2);

    let (status, _) = post(
        &server,
        "/fetch",
        json!({"id": "w1", "apiname": "get_list_ig_post", "apiparams": {"url": " , "}}),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_reconnect_budget_closes_socket() {
    let server = start_server().await;
    let mut ws = connect_worker(&server, "w1").await;

    for _ in 0..6 {
        ws.send(Message::Text(json!({"type": "reconnect"}).to_string()))
            .await
            .unwrap();
    }
    let error = next_json(&mut ws).await.unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"], "Maximum reconnection attempts reached");
    assert!(next_json(&mut ws).await.is_none());

    let (status, _) = post(&server, "/call", json!({"id": "w1", "apiname": "echo"})).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_saved_list_starts_empty() {
    let server = start_server().await;
    let list: Value = reqwest::get(format!("{}/saved-list", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list, json!({"list": []}));
}

#[tokio::test]
async fn test_download_writes_caption_and_rejects_missing_results() {
    let server = start_server().await;

    let (status, body) = post(
        &server,
        "/download",
        json!({
            "apiName": "get_list_ig_post",
            "results": [{"id": "p1", "username": "jane", "caption": "hi", "like_count": 4}]
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Downloaded 1 files.");
    let caption = std::fs::read_to_string(server.dir.path().join("jane").join("p1.txt")).unwrap();
    assert!(caption.contains("Likes: 4"));

    let (status, body) = post(&server, "/download", json!({"apiName": "x"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "Invalid data received");
}

#[tokio::test]
async fn test_check_saved_reports_files_on_disk() {
    let server = start_server().await;
    let image = server.dir.path().join("jane_doe").join("image");
    std::fs::create_dir_all(&image).unwrap();
    std::fs::write(image.join("111.jpg"), b"x").unwrap();

    let (status, body) = post(
        &server,
        "/check-saved",
        json!({"username": "jane.doe", "ids": ["111", 222, "../111"]}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["saved"], json!(["111"]));

    let (status, _) = post(&server, "/check-saved", json!({"username": "jane.doe"})).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_save_shuffled_urls_appends_and_rejects_bad_names() {
    let server = start_server().await;
    let record = json!({
        "apiName": "get_list_ig_user_stories",
        "urls": ["https://x/2", "https://x/1"],
        "timestamp": "2024-01-01T00:00:00Z"
    });
    let (status, _) = post(&server, "/save-shuffled-urls", record.clone()).await;
    assert_eq!(status, 200);
    let (status, _) = post(&server, "/save-shuffled-urls", record).await;
    assert_eq!(status, 200);
    let raw = std::fs::read_to_string(
        server
            .dir
            .path()
            .join("shuffled_urls_get_list_ig_user_stories.jsonl"),
    )
    .unwrap();
    assert_eq!(raw.lines().count(), 2);

    let (status, _) = post(
        &server,
        "/save-shuffled-urls",
        json!({"apiName": "/../../escaped", "urls": [], "timestamp": "t"}),
    )
    .await;
    assert_eq!(status, 400);
    let parent = server.dir.path().parent().unwrap();
    assert!(!parent.join("escaped.jsonl").exists());

    let (status, _) = post(
        &server,
        "/save-shuffled-urls",
        json!({"apiName": "api", "urls": [], "timestamp": ""}),
    )
    .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_save_stories_report_appends_and_rejects_missing_timestamp() {
    let server = start_server().await;
    let (status, body) = post(
        &server,
        "/save-ig-user-stories-report",
        json!({
            "apiName": "get_list_ig_user_stories",
            "report": [{"url": "https://x/1", "total": 3}],
            "timestamp": "2024-01-01T00:00:00Z"
        }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "Report saved.");
    let raw = std::fs::read_to_string(server.dir.path().join("target_reports.jsonl")).unwrap();
    let line: Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
    assert_eq!(line["report"][0]["total"], 3);

    let (status, _) = post(
        &server,
        "/save-ig-user-stories-report",
        json!({"apiName": "get_list_ig_user_stories", "report": [], "timestamp": ""}),
    )
    .await;
    assert_eq!(status, 400);
}

/// Read SSE data lines until one contains `stop`.
async fn read_events(response: &mut reqwest::Response, stop: &str) -> Vec<Value> {
    let mut buffer = String::new();
    let read = async {
        while let Some(chunk) = response.chunk().await.unwrap() {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            if buffer.contains(stop) && buffer.ends_with('\n') {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("event stream stalled");
    buffer
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str(data.trim()).ok())
        .collect()
}

#[tokio::test]
async fn test_events_stream_worker_registration() {
    let server = start_server().await;
    let mut events = reqwest::get(format!("{}/events", server.base)).await.unwrap();
    assert_eq!(events.status(), 200);

    let _ws = connect_worker(&server, "w1").await;
    let seen = read_events(&mut events, "WorkerRegistered").await;
    assert!(seen
        .iter()
        .any(|e| e["type"] == "WorkerRegistered" && e["identity"] == "w1"));
}

#[tokio::test]
async fn test_events_url_filter_drops_other_targets() {
    let server = start_server().await;
    let ws = connect_worker(&server, "w1").await;
    tokio::spawn(run_worker(ws));

    let jane = "https://www.instagram.com/jane/";
    let mut events = reqwest::get(format!("{}/events?url={jane}", server.base))
        .await
        .unwrap();

    let run = {
        let base = server.base.clone();
        tokio::spawn(async move {
            reqwest::Client::new()
                .post(format!("{base}/fetch"))
                .json(&json!({
                    "id": "w1",
                    "apiname": "get_list_ig_post",
                    "apiparams": {"url": format!("{jane},https://www.instagram.com/john/")}
                }))
                .send()
                .await
                .unwrap()
                .status()
        })
    };

    let seen = read_events(&mut events, "RunComplete").await;
    assert_eq!(run.await.unwrap(), 200);

    let target_urls: Vec<&str> = seen.iter().filter_map(|e| e["url"].as_str()).collect();
    assert!(!target_urls.is_empty());
    assert!(target_urls.iter().all(|url| *url == jane));
    assert!(seen.iter().any(|e| e["type"] == "TargetComplete"));
}
