//! Tests for the HTTP action against canned-response TCP servers.

use std::io::{Read, Write};
use std::net::TcpListener;

use chrono::Utc;
use serde_json::{Value, json};

use nsa::actions::{Action, ActionContext, TaskContext, builtin::http_client::HttpClientAction};
use nsa::datasource::DataSourceManager;
use nsa::engine::types::{BusMessage, JsonMap};
use nsa::error::Error;

// --- Helpers ---

/// Spawn a mock HTTP server that accepts one connection and returns a
/// canned response. Returns (url, captured-request receiver).
fn spawn_mock_server(response: String) -> (String, std::sync::mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{}", addr);
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        for stream in listener.incoming().take(1) {
            if let Ok(mut stream) = stream {
                let mut buf = [0u8; 8192];
                let n = stream.read(&mut buf).unwrap_or(0);
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        }
    });
    (url, rx)
}

fn ok_response(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

fn error_response(status_line: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n\r\n{}",
        status_line,
        body.len(),
        body
    )
}

struct Fixture {
    datasources: DataSourceManager,
    message: BusMessage,
    vars: JsonMap,
    previous_output: Value,
}

impl Fixture {
    fn new() -> Self {
        Self::with_message("{}")
    }

    fn with_message(body: &str) -> Self {
        Self {
            datasources: DataSourceManager::new(),
            message: BusMessage::decode("t", "c", "m1", body.as_bytes(), Utc::now(), 1),
            vars: JsonMap::new(),
            previous_output: Value::Null,
        }
    }

    fn ctx(&self) -> ActionContext<'_> {
        ActionContext {
            datasources: &self.datasources,
            message: &self.message,
            vars: &self.vars,
            previous_output: &self.previous_output,
        }
    }
}

async fn run(fixture: &Fixture, params: Value) -> Result<Value, Error> {
    let params = params.as_object().unwrap().clone();
    HttpClientAction
        .run(&fixture.ctx(), &TaskContext::new(&params))
        .await
}

// --- Happy path ---

#[tokio::test]
async fn get_returns_parsed_body_with_metadata() {
    let (url, _rx) = spawn_mock_server(ok_response(r#"{"message":"hello"}"#));
    let fixture = Fixture::new();

    let output = run(&fixture, json!({"url": url})).await.unwrap();

    assert_eq!(output.get("message").unwrap(), "hello");
    assert_eq!(output.get("status_code").unwrap(), 200);
    assert!(output.get("headers").unwrap().is_object());
}

#[tokio::test]
async fn non_json_body_is_wrapped() {
    let (url, _rx) = spawn_mock_server(ok_response("plain text"));
    let fixture = Fixture::new();

    let output = run(&fixture, json!({"url": url})).await.unwrap();

    assert_eq!(output.get("body").unwrap(), "plain text");
    assert_eq!(output.get("status_code").unwrap(), 200);
}

#[tokio::test]
async fn post_sends_json_body() {
    let (url, rx) = spawn_mock_server(ok_response("{}"));
    let fixture = Fixture::new();

    run(&fixture, json!({
        "url": url,
        "method": "POST",
        "body": {"a": 1}
    }))
    .await
    .unwrap();

    let request = rx.recv().unwrap();
    assert!(request.starts_with("POST /"));
    assert!(request.to_lowercase().contains("content-type: application/json"));
    assert!(request.contains(r#"{"a":1}"#));
}

// --- Template expansion ---

#[tokio::test]
async fn url_and_headers_are_expanded() {
    let (url, rx) = spawn_mock_server(ok_response("{}"));
    let mut fixture = Fixture::with_message(r#"{"order_id": "42"}"#);
    fixture.vars.insert("token".to_string(), json!("secret"));

    run(&fixture, json!({
        "url": format!("{}/orders/{{{{nsq.order_id}}}}", url),
        "headers": {"authorization": "Bearer {{token}}"}
    }))
    .await
    .unwrap();

    let request = rx.recv().unwrap();
    assert!(request.starts_with("GET /orders/42 "));
    assert!(request.contains("authorization: Bearer secret"));
}

// --- Errors ---

#[tokio::test]
async fn status_400_and_above_is_remote_error() {
    let (url, _rx) = spawn_mock_server(error_response("500 Internal Server Error", "oops"));
    let fixture = Fixture::new();

    let err = run(&fixture, json!({"url": url})).await.unwrap_err();

    match err {
        Error::Remote(msg) => assert!(msg.contains("500")),
        other => panic!("expected Remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn missing_url_is_config_error() {
    let fixture = Fixture::new();
    let err = run(&fixture, json!({})).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn unsupported_method_is_config_error() {
    let fixture = Fixture::new();
    let err = run(&fixture, json!({"url": "http://127.0.0.1:1", "method": "BREW"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
