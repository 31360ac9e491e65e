//! End-to-end tests for the webhook listener over a raw socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::sleep;

use gitbot::config::WebhookServerConfig;
use gitbot::webhook::{Forge, WebhookServer, WebhookSink};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(Forge, Value)>>,
}

#[async_trait::async_trait]
impl WebhookSink for Recorder {
    async fn deliver(
        &self,
        forge: Forge,
        _headers: std::collections::HashMap<String, String>,
        payload: Value,
    ) {
        self.events.lock().await.push((forge, payload));
    }
}

async fn start(config: WebhookServerConfig) -> (SocketAddr, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let sink: Arc<dyn WebhookSink> = recorder.clone();
    let server = Arc::new(WebhookServer::new(&config, sink));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    (addr, recorder)
}

async fn request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn post(path: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut req = format!(
        "POST {path} HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (key, value) in headers {
        req.push_str(&format!("{key}: {value}\r\n"));
    }
    req.push_str("\r\n");
    req.push_str(body);
    req
}

fn status(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn sign(secret: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

async fn wait_for_events(recorder: &Recorder, count: usize) -> Vec<(Forge, Value)> {
    for _ in 0..200 {
        {
            let events = recorder.events.lock().await;
            if events.len() >= count {
                return events.clone();
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} delivered event(s)");
}

fn secured() -> WebhookServerConfig {
    WebhookServerConfig {
        secret: Some("s3cret".to_string()),
        ..WebhookServerConfig::default()
    }
}

#[tokio::test]
async fn open_server_accepts_and_delivers() {
    let (addr, recorder) = start(WebhookServerConfig::default()).await;
    let body = json!({"zen": "Keep it logically awesome."}).to_string();

    let response = request(
        addr,
        &post("/github", &[("X-GitHub-Event", "ping")], &body),
    )
    .await;
    assert_eq!(status(&response), 200);

    let events = wait_for_events(&recorder, 1).await;
    assert_eq!(events[0].0, Forge::GitHub);
    assert_eq!(events[0].1["zen"], "Keep it logically awesome.");
}

#[tokio::test]
async fn wrong_url_secret_beats_valid_signature() {
    let (addr, recorder) = start(secured()).await;
    let body = "{}";
    let signature = format!("sha256={}", sign("s3cret", body));

    // A mismatched ?secret= token is rejected even though the signature
    // header would verify.
    let response = request(
        addr,
        &post(
            "/github?secret=wrong",
            &[("X-Hub-Signature-256", &signature)],
            body,
        ),
    )
    .await;
    assert_eq!(status(&response), 403);
    sleep(Duration::from_millis(50)).await;
    assert!(recorder.events.lock().await.is_empty());
}

#[tokio::test]
async fn url_secret_alone_is_enough() {
    let (addr, recorder) = start(secured()).await;
    let response = request(addr, &post("/gitea?secret=s3cret", &[], "{}")).await;
    assert_eq!(status(&response), 200);
    let events = wait_for_events(&recorder, 1).await;
    assert_eq!(events[0].0, Forge::Gitea);
}

#[tokio::test]
async fn github_hmac_is_verified() {
    let (addr, _recorder) = start(secured()).await;
    let body = r#"{"action":"opened"}"#;

    let good = format!("sha256={}", sign("s3cret", body));
    let response = request(
        addr,
        &post("/github", &[("X-Hub-Signature-256", &good)], body),
    )
    .await;
    assert_eq!(status(&response), 200);

    let bad = format!("sha256={}", sign("other", body));
    let response = request(
        addr,
        &post("/github", &[("X-Hub-Signature-256", &bad)], body),
    )
    .await;
    assert_eq!(status(&response), 403);

    // Missing header entirely.
    let response = request(addr, &post("/github", &[], body)).await;
    assert_eq!(status(&response), 403);
}

#[tokio::test]
async fn gitlab_token_is_compared_directly() {
    let (addr, _recorder) = start(secured()).await;

    let response = request(
        addr,
        &post("/gitlab", &[("X-Gitlab-Token", "s3cret")], "{}"),
    )
    .await;
    assert_eq!(status(&response), 200);

    let response = request(
        addr,
        &post("/gitlab", &[("X-Gitlab-Token", "nope")], "{}"),
    )
    .await;
    assert_eq!(status(&response), 403);
}

#[tokio::test]
async fn unknown_path_is_404() {
    let (addr, _recorder) = start(WebhookServerConfig::default()).await;
    let response = request(addr, &post("/bitbucket", &[], "{}")).await;
    assert_eq!(status(&response), 404);
}

#[tokio::test]
async fn non_post_is_405() {
    let (addr, _recorder) = start(WebhookServerConfig::default()).await;
    let response = request(addr, "GET /github HTTP/1.1\r\nHost: test\r\n\r\n").await;
    assert_eq!(status(&response), 405);
}

#[tokio::test]
async fn oversized_body_is_413() {
    let (addr, _recorder) = start(WebhookServerConfig::default()).await;
    // Declared size alone triggers the rejection; no body is sent.
    let raw = "POST /github HTTP/1.1\r\nHost: test\r\nContent-Length: 10485761\r\n\r\n";
    let response = request(addr, raw).await;
    assert_eq!(status(&response), 413);
}

#[tokio::test]
async fn invalid_json_is_400() {
    let (addr, _recorder) = start(WebhookServerConfig::default()).await;
    let response = request(addr, &post("/github", &[], "not json")).await;
    assert_eq!(status(&response), 400);

    // An empty body is not valid JSON either.
    let response = request(addr, &post("/github", &[], "")).await;
    assert_eq!(status(&response), 400);
}

#[tokio::test]
async fn malformed_request_line_is_400() {
    let (addr, _recorder) = start(WebhookServerConfig::default()).await;
    let response = request(addr, "GARBAGE\r\n\r\n").await;
    assert_eq!(status(&response), 400);
}

#[tokio::test]
async fn listener_survives_dropped_connections() {
    let (addr, recorder) = start(WebhookServerConfig::default()).await;

    // Clients that connect and vanish without sending a request.
    for _ in 0..3 {
        drop(TcpStream::connect(addr).await.unwrap());
    }

    let response = request(addr, &post("/github", &[], "{}")).await;
    assert_eq!(status(&response), 200);
    wait_for_events(&recorder, 1).await;
}

#[tokio::test]
async fn oversized_request_line_is_400() {
    let (addr, _recorder) = start(WebhookServerConfig::default()).await;
    let raw = format!("POST /{} HTTP/1.1\r\n\r\n", "a".repeat(9000));
    let response = request(addr, &raw).await;
    assert_eq!(status(&response), 400);
}

#[tokio::test]
async fn form_encoded_payload_is_unwrapped() {
    let (addr, recorder) = start(WebhookServerConfig::default()).await;
    let body = "payload=%7B%22action%22%3A%22opened%22%7D";
    let response = request(
        addr,
        &post(
            "/github",
            &[("Content-Type", "application/x-www-form-urlencoded")],
            body,
        ),
    )
    .await;
    assert_eq!(status(&response), 200);

    let events = wait_for_events(&recorder, 1).await;
    assert_eq!(events[0].1["action"], "opened");
}

#[tokio::test]
async fn per_forge_secret_overrides_legacy() {
    let config = WebhookServerConfig {
        secret: Some("legacy".to_string()),
        github_secret: Some("gh-only".to_string()),
        ..WebhookServerConfig::default()
    };
    let (addr, _recorder) = start(config).await;

    let response = request(addr, &post("/github?secret=gh-only", &[], "{}")).await;
    assert_eq!(status(&response), 200);
    let response = request(addr, &post("/github?secret=legacy", &[], "{}")).await;
    assert_eq!(status(&response), 403);
    let response = request(addr, &post("/gitea?secret=legacy", &[], "{}")).await;
    assert_eq!(status(&response), 200);
}
