//! End-to-end tests for the scenario runner
//!
//! These tests run real scenarios against in-process mock services:
//! 1. An axum HTTP server for REST actions
//! 2. A tokio-tungstenite WebSocket server for streaming actions
//! 3. An in-process rumqttd broker for MQTT actions
//! 4. Closed ports for broker and transport failures
//!
//! Diagrams are written to a temporary directory per test.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use scenario::action::Services;
use scenario::common::Config;
use scenario::diagram::{DiagramEntry, MermaidRecorder};
use scenario::loader;
use scenario::proto::ReflectCodec;
use scenario::scenario::{ScenarioReport, ScenarioStatus};
use scenario::{Orchestrator, Scenario, ScenarioRunner};

/// Test context with a diagram directory and a runner
struct TestContext {
    temp_dir: TempDir,
    recorder: Arc<MermaidRecorder>,
    runner: ScenarioRunner,
}

impl TestContext {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(mut config: Config) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        config.diagrams.output_dir = temp_dir.path().join("diagrams");

        let recorder = Arc::new(MermaidRecorder::new(&config.diagrams));
        let services = Services::new(
            Arc::new(config),
            recorder.clone(),
            Arc::new(ReflectCodec::new()),
        )
        .expect("Failed to build services");

        Self {
            temp_dir,
            recorder,
            runner: ScenarioRunner::new(services).quiet(),
        }
    }

    async fn run(&self, yaml: &str) -> ScenarioReport {
        let scenarios = load(yaml);
        assert_eq!(scenarios.len(), 1, "expected exactly one scenario");
        self.runner.run(&scenarios[0]).await
    }
}

fn load(yaml: &str) -> Vec<Scenario> {
    let file = loader::parse_str(yaml).expect("Failed to parse scenario yaml");
    loader::build(vec![file]).expect("Failed to build scenarios")
}

/// Mock REST service
fn app() -> Router {
    Router::new()
        .route("/status", get(|| async { Json(json!({"code": 200})) }))
        .route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, Json(json!({"code": 200}))) }),
        )
        .route(
            "/users",
            post(|Json(body): Json<Value>| async move {
                (
                    StatusCode::CREATED,
                    Json(json!({"id": 7, "name": body["name"], "tags": ["a", "b"]})),
                )
            }),
        )
        .route(
            "/users/:id",
            get(|Path(id): Path<u64>, headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let accept = headers
                    .get("accept")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(json!({"id": id, "auth": auth, "accept": accept}))
            }),
        )
}

async fn serve_http() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app()).await.unwrap();
    });
    addr
}

/// A port with nothing listening on it
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn rest_scenario(addr: SocketAddr, path: &str, check: &str) -> String {
    format!(
        r#"
scenarios:
  - name: status check
    actions:
      - name: getStatus
        type: REST
        url: http://{addr}{path}
        responseValidation:
          - "{check}"
"#
    )
}

#[tokio::test]
async fn test_rest_validation_passes() {
    let addr = serve_http().await;
    let ctx = TestContext::new();

    let report = ctx.run(&rest_scenario(addr, "/status", "res.code === 200")).await;

    assert_eq!(report.status, ScenarioStatus::Succeeded);
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].success);
}

#[tokio::test]
async fn test_rest_validation_failure_is_validation_error() {
    let addr = serve_http().await;
    let ctx = TestContext::new();

    let report = ctx.run(&rest_scenario(addr, "/status", "res.code === 201")).await;

    assert_eq!(report.status, ScenarioStatus::Failed);
    assert_eq!(report.results[0].error_kind, Some("VALIDATION"));
}

#[tokio::test]
async fn test_unexpected_status_fails_even_with_valid_body() {
    let addr = serve_http().await;
    let ctx = TestContext::new();

    let report = ctx.run(&rest_scenario(addr, "/missing", "res.code === 200")).await;

    assert_eq!(report.status, ScenarioStatus::Failed);
    assert_eq!(report.results[0].error_kind, Some("PROTOCOL"));
    let entries = ctx.recorder.entries(&report.id);
    assert!(entries.iter().any(|e| matches!(
        e,
        DiagramEntry::Response { status: 404, error: Some(_), .. }
    )));
}

#[tokio::test]
async fn test_variables_chain_between_actions() {
    let addr = serve_http().await;
    let ctx = TestContext::new();

    let yaml = format!(
        r#"
templates:
  - name: userApi
    type: REST
    serviceName: users
    url: http://{addr}/users
    headers:
      Authorization: Bearer template
      Accept: application/json

scenarios:
  - name: create then fetch
    actions:
      - name: create
        template: userApi
        method: POST
        data:
          name: ada
        variables:
          userId: res.id
          tags: res.tags
      - name: fetch
        template: userApi
        url: "http://{addr}/users/${{userId}}"
        headers:
          Authorization: "Bearer ${{tags[1]}}"
        responseValidation:
          - res.id === userId
          - res.auth === 'Bearer b'
          - res.accept == 'application/json'
"#
    );
    let report = ctx.run(&yaml).await;

    assert!(report.success(), "results: {:?}", report.results);
    assert_eq!(report.results.len(), 2);
}

#[tokio::test]
async fn test_rest_retry_after_transport_failure() {
    let port = closed_port().await;
    let mut config = Config::default();
    config.http.retry_backoff_ms = 400;
    let ctx = TestContext::with_config(config);

    // The service comes up between the first and second attempt
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        axum::serve(listener, app()).await.unwrap();
    });

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let report = ctx.run(&rest_scenario(addr, "/status", "res.code === 200")).await;

    assert_eq!(report.status, ScenarioStatus::Succeeded);
    assert_eq!(report.results.len(), 1);
    let requests = ctx
        .recorder
        .entries(&report.id)
        .into_iter()
        .filter(|e| matches!(e, DiagramEntry::Request { .. }))
        .count();
    assert_eq!(requests, 1);
}

#[tokio::test]
async fn test_rest_transport_failure_after_retries() {
    let port = closed_port().await;
    let mut config = Config::default();
    config.http.retry_backoff_ms = 10;
    let ctx = TestContext::with_config(config);

    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let report = ctx.run(&rest_scenario(addr, "/status", "res.code === 200")).await;

    assert_eq!(report.results[0].error_kind, Some("TRANSPORT"));
}

/// WebSocket server that drops the first connection without a close frame,
/// then streams two relevant messages and one irrelevant one
async fn serve_flaky_websocket(payloads: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let payloads = payloads.clone();
            let attempt = connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                if attempt == 0 {
                    if let Ok(Some(Ok(Message::Text(_)))) =
                        tokio::time::timeout(Duration::from_millis(200), ws.next()).await
                    {
                        payloads.fetch_add(1, Ordering::SeqCst);
                    }
                    // Drop the TCP stream: abnormal closure
                    return;
                }

                if let Ok(Some(Ok(Message::Text(_)))) =
                    tokio::time::timeout(Duration::from_millis(200), ws.next()).await
                {
                    payloads.fetch_add(1, Ordering::SeqCst);
                }
                for msg in [
                    json!({"kind": "tick", "n": 1}),
                    json!({"kind": "noise"}),
                    json!({"kind": "tick", "n": 1}),
                ] {
                    ws.send(Message::Text(msg.to_string())).await.unwrap();
                }
                let _ = ws.close(None).await;
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_websocket_reconnects_and_sends_payload_once() {
    let payloads = Arc::new(AtomicUsize::new(0));
    let addr = serve_flaky_websocket(payloads.clone()).await;
    let ctx = TestContext::new();

    let yaml = format!(
        r#"
scenarios:
  - name: ticker
    actions:
      - name: stream
        type: WEBSOCKET
        url: ws://{addr}/feed
        payload:
          subscribe: ticks
        expectedNumberOfMessages: 2
        messageFilter:
          - msg.kind === 'tick'
"#
    );
    let report = ctx.run(&yaml).await;

    assert!(report.success(), "results: {:?}", report.results);
    assert_eq!(payloads.load(Ordering::SeqCst), 1);
    let messages = ctx
        .recorder
        .entries(&report.id)
        .into_iter()
        .filter(|e| matches!(e, DiagramEntry::AsyncMessage { .. }))
        .count();
    assert_eq!(messages, 2);
}

#[tokio::test]
async fn test_websocket_count_mismatch() {
    let payloads = Arc::new(AtomicUsize::new(0));
    let addr = serve_flaky_websocket(payloads).await;
    let ctx = TestContext::new();

    let yaml = format!(
        r#"
scenarios:
  - name: ticker
    actions:
      - name: stream
        type: WEBSOCKET
        url: ws://{addr}/feed
        expectedNumberOfMessages: 3
        messageFilter:
          - msg.kind === 'tick'
"#
    );
    let report = ctx.run(&yaml).await;

    assert_eq!(report.results[0].error_kind, Some("COUNT_MISMATCH"));
    assert!(report.results[0].error.as_deref().unwrap_or("").contains("2/3"));
}

/// WebSocket server that sends one relevant message and never closes
async fn serve_open_websocket() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                ws.send(Message::Text(json!({"kind": "tick"}).to_string()))
                    .await
                    .unwrap();
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    addr
}

fn open_feed_scenario(ws: SocketAddr, http: SocketAddr, expected: usize) -> String {
    format!(
        r#"
scenarios:
  - name: open feed
    actions:
      - name: stream
        type: WEBSOCKET
        url: ws://{ws}/feed
        expectedNumberOfMessages: {expected}
        messageFilter:
          - msg.kind === 'tick'
      - name: afterwards
        type: REST
        url: http://{http}/status
        responseValidation:
          - res.code === 200
"#
    )
}

#[tokio::test]
async fn test_open_websocket_is_cancelled_at_scenario_end() {
    let ws = serve_open_websocket().await;
    let http = serve_http().await;
    let mut config = Config::default();
    config.websocket.close_grace_ms = 300;
    let ctx = TestContext::with_config(config);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        ctx.run(&open_feed_scenario(ws, http, 1)),
    )
    .await
    .expect("open socket must not hold the scenario");

    assert!(report.success(), "results: {:?}", report.results);
    // The REST action ran while the socket was still open
    let order: Vec<&str> = report.results.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(order, vec!["afterwards", "stream"]);
}

#[tokio::test]
async fn test_open_websocket_short_of_messages_fails_on_cancel() {
    let ws = serve_open_websocket().await;
    let http = serve_http().await;
    let mut config = Config::default();
    config.websocket.close_grace_ms = 300;
    let ctx = TestContext::with_config(config);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        ctx.run(&open_feed_scenario(ws, http, 2)),
    )
    .await
    .expect("open socket must not hold the scenario");

    assert_eq!(report.status, ScenarioStatus::Failed);
    let stream = report
        .results
        .iter()
        .find(|r| r.action == "stream")
        .expect("websocket result reported");
    assert_eq!(stream.error_kind, Some("COUNT_MISMATCH"));
    assert!(stream.error.as_deref().unwrap_or("").contains("1/2"));
    assert!(ctx
        .recorder
        .entries(&report.id)
        .iter()
        .any(|e| matches!(e, DiagramEntry::Missing { expected: 2, received: 1, .. })));
}

/// Start an in-process MQTT broker and wait until it accepts connections
async fn start_broker() -> u16 {
    let port = closed_port().await;
    let config: rumqttd::Config = toml::from_str(&format!(
        r#"
id = 0

[router]
max_connections = 100
max_outgoing_packet_count = 200
max_segment_size = 104857600
max_segment_count = 10

[v4.1]
name = "v4-1"
listen = "127.0.0.1:{port}"
next_connection_delay_ms = 1

[v4.1.connections]
connection_timeout_ms = 60000
max_payload_size = 20480
max_inflight_count = 100
dynamic_filters = true
"#
    ))
    .expect("Failed to parse broker config");

    std::thread::spawn(move || {
        let mut broker = rumqttd::Broker::new(config);
        let _ = broker.start();
    });

    for _ in 0..100 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return port;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("broker did not start on port {port}");
}

fn test_client(port: u16, id: &str) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(id, "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(5));
    AsyncClient::new(options, 16)
}

#[tokio::test]
async fn test_mqtt_subscribe_counts_relevant_messages_over_window() {
    let port = start_broker().await;
    let ctx = TestContext::new();

    // Publish once the subscription is in place: one relevant, one not
    tokio::spawn(async move {
        let (client, mut eventloop) = test_client(port, "it-publisher");
        tokio::spawn(async move { while eventloop.poll().await.is_ok() {} });
        tokio::time::sleep(Duration::from_millis(700)).await;
        for msg in [json!({"kind": "tick"}), json!({"kind": "noise"})] {
            client
                .publish("t", QoS::AtLeastOnce, false, msg.to_string())
                .await
                .unwrap();
        }
    });

    let yaml = format!(
        r#"
scenarios:
  - name: listen
    actions:
      - name: ticks
        type: MQTT_SUBSCRIBE
        url: mqtt://127.0.0.1:{port}
        topic: t
        duration: 2
        expectedNumberOfMessages: 2
        messageFilter:
          - msg.kind === 'tick'
"#
    );
    let report = ctx.run(&yaml).await;

    let result = &report.results[0];
    assert_eq!(result.error_kind, Some("COUNT_MISMATCH"), "{:?}", result);
    assert!(result.error.as_deref().unwrap_or("").contains("1/2"));
    assert!(result.duration_ms >= 2000);

    let entries = ctx.recorder.entries(&report.id);
    let messages = entries
        .iter()
        .filter(|e| matches!(e, DiagramEntry::AsyncMessage { .. }))
        .count();
    assert_eq!(messages, 1);
    assert!(entries
        .iter()
        .any(|e| matches!(e, DiagramEntry::Missing { expected: 2, received: 1, .. })));
}

#[tokio::test]
async fn test_mqtt_publish_reaches_subscriber() {
    let port = start_broker().await;
    let (client, mut eventloop) = test_client(port, "it-subscriber");
    client.subscribe("devices/1", QoS::AtLeastOnce).await.unwrap();
    loop {
        match eventloop.poll().await.unwrap() {
            Event::Incoming(Packet::SubAck(_)) => break,
            _ => continue,
        }
    }

    let mut config = Config::default();
    config.mqtt.strict_publish = true;
    let ctx = TestContext::with_config(config);
    let yaml = format!(
        r#"
scenarios:
  - name: publish
    actions:
      - name: send
        type: MQTT_PUBLISH
        url: mqtt://127.0.0.1:{port}
        topic: devices/1
        data:
          value: 1
"#
    );
    let report = ctx.run(&yaml).await;
    assert!(report.success(), "results: {:?}", report.results);

    let received = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Event::Incoming(Packet::Publish(publish)) = eventloop.poll().await.unwrap() {
                return publish;
            }
        }
    })
    .await
    .expect("published message should arrive");
    assert_eq!(received.topic, "devices/1");
    let payload: Value = serde_json::from_slice(&received.payload).unwrap();
    assert_eq!(payload, json!({"value": 1}));

    assert!(ctx.recorder.entries(&report.id).iter().any(|e| matches!(
        e,
        DiagramEntry::Request { summary, .. } if summary == "PUBLISH devices/1"
    )));
}

#[tokio::test]
async fn test_mqtt_publish_errors_are_lenient_by_default() {
    let port = closed_port().await;
    let yaml = format!(
        r#"
scenarios:
  - name: publish
    actions:
      - name: send
        type: MQTT_PUBLISH
        url: mqtt://127.0.0.1:{port}
        topic: devices/1
        data:
          value: 1
"#
    );

    let lenient = TestContext::new();
    assert!(lenient.run(&yaml).await.success());

    let mut config = Config::default();
    config.mqtt.strict_publish = true;
    let strict = TestContext::with_config(config);
    let report = strict.run(&yaml).await;
    assert_eq!(report.results[0].error_kind, Some("TRANSPORT"));
}

#[tokio::test]
async fn test_mqtt_subscribe_connection_failure_fails_immediately() {
    let port = closed_port().await;
    let ctx = TestContext::new();
    let yaml = format!(
        r#"
scenarios:
  - name: listen
    actions:
      - name: alerts
        type: MQTT_SUBSCRIBE
        url: mqtt://127.0.0.1:{port}
        topic: alerts/#
        duration: 30
        expectedNumberOfMessages: 1
"#
    );

    let report = tokio::time::timeout(Duration::from_secs(10), ctx.run(&yaml))
        .await
        .expect("subscribe should not wait for the window");
    assert_eq!(report.results[0].error_kind, Some("TRANSPORT"));
}

#[tokio::test]
async fn test_orchestrator_writes_diagrams_and_reports_failure() {
    let addr = serve_http().await;
    let ctx = TestContext::new();
    let yaml = format!(
        r#"
scenarios:
  - name: good
    actions:
      - {{name: ok, type: REST, url: "http://{addr}/status", responseValidation: ["res.code === 200"]}}
  - name: bad
    actions:
      - {{name: nope, type: REST, url: "http://{addr}/missing"}}
      - {{name: never, type: REST, url: "http://{addr}/status"}}
"#
    );
    let scenarios = load(&yaml);

    let report = Orchestrator::new(ctx.runner.clone(), 5)
        .quiet()
        .run(&scenarios)
        .await;

    assert!(!report.success());
    assert_eq!(report.scenarios[1].skipped, 1);
    let diagram = std::fs::read_to_string(ctx.recorder.path_for("good")).unwrap();
    assert!(diagram.starts_with("sequenceDiagram"));
    assert!(diagram.contains("GET /status"));
    assert!(ctx.temp_dir.path().join("diagrams").join("bad.mmd").exists());
}

#[tokio::test]
async fn test_load_from_files_with_env() {
    let addr = serve_http().await;
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("SCENARIO_IT_STATUS_PATH", "/status");
    std::fs::write(
        dir.path().join("status.yaml"),
        format!(
            r#"
scenarios:
  - name: from file
    actions:
      - name: check
        type: REST
        url: "http://{addr}${{env:SCENARIO_IT_STATUS_PATH}}"
        responseValidation: ["res.code === ${{env:SCENARIO_IT_EXPECTED:-200}}"]
"#
        ),
    )
    .unwrap();

    let scenarios = loader::load_paths(&[dir.path().to_path_buf()]).unwrap();
    let ctx = TestContext::new();
    let report = ctx.runner.run(&scenarios[0]).await;
    assert!(report.success(), "results: {:?}", report.results);
}
