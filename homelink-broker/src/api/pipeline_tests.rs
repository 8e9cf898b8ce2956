//! End-to-end tests for the proxy pipeline: a real listener, a real
//! WebSocket agent, and a real HTTP client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode as jwt_encode, EncodingKey, Header};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use homelink_proto::{decode, encode, Heartbeat, Message, ResponseFrame};

use crate::auth::unix_now;
use crate::config::Config;
use crate::state::AppState;

const SECRET: &str = "integration-test-secret";

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: u64,
    #[serde(rename = "https://homelink/tier", skip_serializing_if = "Option::is_none")]
    tier: Option<String>,
}

fn token_for(user: &str, tier: Option<&str>) -> String {
    jwt_encode(
        &Header::default(),
        &TestClaims {
            sub: user.to_owned(),
            exp: unix_now() + 3600,
            tier: tier.map(str::to_owned),
        },
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// A running broker on an ephemeral port. The shutdown sender must stay
/// alive for the lifetime of the test; sessions drain when it drops.
struct TestBroker {
    addr: SocketAddr,
    state: Arc<AppState>,
    _shutdown: watch::Sender<bool>,
}

impl TestBroker {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn connect_agent(&self, token: &str) -> AgentSocket {
        let url = format!("ws://{}/ws/tunnel", self.addr);
        let mut request = url.into_client_request().unwrap();
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let (socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(response.status(), 101);
        socket
    }

    async fn wait_for_registration(&self, sessions: usize) {
        for _ in 0..100 {
            if self.state.registry.active_sessions() == sessions {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent session did not register");
    }
}

async fn spawn_broker(tweak: impl FnOnce(&mut Config)) -> TestBroker {
    let mut config = Config::parse_from(["homelink-broker", "--token-secret", SECRET]);
    tweak(&mut config);
    config.validate().unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState::new(config, None, shutdown_rx));
    let router = super::router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestBroker {
        addr,
        state,
        _shutdown: shutdown_tx,
    }
}

/// Next protocol frame from the agent socket, answering broker pings
/// along the way.
async fn next_app_frame(socket: &mut AgentSocket) -> Option<Message> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .ok()??
            .ok()?;
        let data = match msg {
            WsMessage::Text(text) => text.into_bytes(),
            WsMessage::Binary(bin) => bin,
            WsMessage::Close(_) => return None,
            _ => continue,
        };
        match decode(&data, usize::MAX).unwrap() {
            Message::Ping(ping) => {
                let pong = Message::Pong(Heartbeat {
                    id: ping.id,
                    timestamp: ping.timestamp,
                });
                socket.send(WsMessage::Text(encode(&pong))).await.ok()?;
            }
            frame => return Some(frame),
        }
    }
}

async fn reply_pong_body(socket: &mut AgentSocket) {
    let Some(Message::HttpRequest(request)) = next_app_frame(socket).await else {
        panic!("expected http_request frame");
    };
    let response = Message::HttpResponse(ResponseFrame {
        id: request.id,
        status: 200,
        headers: std::collections::HashMap::from([(
            "content-type".to_owned(),
            "text/plain".to_owned(),
        )]),
        body: bytes::Bytes::from_static(b"pong"),
    });
    socket
        .send(WsMessage::Text(encode(&response)))
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_round_trip() {
    let broker = spawn_broker(|_| {}).await;
    let token = token_for("u1", None);
    let mut agent = broker.connect_agent(&token).await;
    broker.wait_for_registration(1).await;

    let agent_task = tokio::spawn(async move {
        reply_pong_body(&mut agent).await;
        agent
    });

    let response = reqwest::Client::new()
        .get(broker.url("/api/direct-proxy/u1/ping"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().contains_key("x-correlation-id"));
    assert!(response.headers().contains_key("x-ratelimit-limit"));
    assert_eq!(response.text().await.unwrap(), "pong");
    agent_task.await.unwrap();
}

#[tokio::test]
async fn offline_agent_maps_to_503_with_retry_after() {
    let broker = spawn_broker(|_| {}).await;
    let token = token_for("nobody", None);

    let response = reqwest::Client::new()
        .get(broker.url("/api/direct-proxy/nobody/ping"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["retry-after"], "5");
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "agent_offline");
    assert!(body["error"]["correlation_id"].is_string());
}

#[tokio::test]
async fn missing_and_cross_tenant_tokens_are_rejected() {
    let broker = spawn_broker(|_| {}).await;

    let response = reqwest::Client::new()
        .get(broker.url("/api/tunnel/u1/x"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "token_missing");

    // token for u1 must not reach u2's tunnel
    let response = reqwest::Client::new()
        .get(broker.url("/api/tunnel/u2/anything"))
        .bearer_auth(token_for("u1", None))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "forbidden");
}

#[tokio::test]
async fn path_traversal_is_rejected() {
    let broker = spawn_broker(|_| {}).await;
    let token = token_for("u1", None);

    let response = reqwest::Client::new()
        .get(broker.url("/api/tunnel/u1/a/../secrets"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "path_traversal");
}

#[tokio::test]
async fn rate_limit_returns_429_with_headers() {
    let broker = spawn_broker(|config| {
        config.rate_limit_free_per_min = 2;
    })
    .await;
    let token = token_for("limited", None);
    let client = reqwest::Client::new();
    let url = broker.url("/api/direct-proxy/limited/ping");

    for _ in 0..2 {
        let response = client.get(&url).bearer_auth(&token).send().await.unwrap();
        // budget admits the request; it fails later because no agent is up
        assert_eq!(response.status(), 503);
    }

    let denied = client.get(&url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(denied.status(), 429);
    assert_eq!(denied.headers()["x-ratelimit-remaining"], "0");
    let retry_after: u64 = denied.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);
    let body: serde_json::Value = denied.json().await.unwrap();
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");

    // the next request in the same window stays rejected
    let again = client.get(&url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(again.status(), 429);
}

#[tokio::test]
async fn timeout_yields_504_and_late_response_is_discarded() {
    let broker = spawn_broker(|config| {
        config.request_timeout_ms = 200;
    })
    .await;
    let token = token_for("u1", None);
    let mut agent = broker.connect_agent(&token).await;
    broker.wait_for_registration(1).await;

    let client = reqwest::Client::new();
    let url = broker.url("/api/direct-proxy/u1/slow");

    let pending = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        let token = token.clone();
        async move { client.get(&url).bearer_auth(&token).send().await.unwrap() }
    });

    // hold the request past its deadline, then answer late
    let Some(Message::HttpRequest(request)) = next_app_frame(&mut agent).await else {
        panic!("expected http_request frame");
    };
    tokio::time::sleep(Duration::from_millis(400)).await;
    let late = Message::HttpResponse(ResponseFrame {
        id: request.id,
        status: 200,
        headers: Default::default(),
        body: bytes::Bytes::from_static(b"too late"),
    });
    agent.send(WsMessage::Text(encode(&late))).await.unwrap();

    let response = pending.await.unwrap();
    assert_eq!(response.status(), 504);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "upstream_timeout");

    // the late response was discarded, not delivered, and the session
    // survived it: a fresh request still round-trips
    let agent_task = tokio::spawn(async move {
        reply_pong_body(&mut agent).await;
    });
    let response = client
        .get(broker.url("/api/direct-proxy/u1/ping"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "pong");
    agent_task.await.unwrap();
}

#[tokio::test]
async fn free_tier_session_limit_rejects_second_socket() {
    let broker = spawn_broker(|_| {}).await;
    let token = token_for("u1", None);
    let _first = broker.connect_agent(&token).await;
    broker.wait_for_registration(1).await;

    let mut second = broker.connect_agent(&token).await;
    let Some(Message::Error(error)) = next_app_frame(&mut second).await else {
        panic!("expected error frame on the second session");
    };
    assert_eq!(error.code.as_str(), "session_limit_reached");
    // the socket is closed right after
    assert!(next_app_frame(&mut second).await.is_none());
    assert_eq!(broker.state.registry.active_sessions(), 1);
}

#[tokio::test]
async fn health_endpoint_reports_connections() {
    let broker = spawn_broker(|_| {}).await;
    let token = token_for("u1", Some("premium"));
    let _agent = broker.connect_agent(&token).await;
    broker.wait_for_registration(1).await;

    let response = reqwest::Client::new()
        .get(broker.url("/api/tunnel/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_connections"], 1);
}

#[tokio::test]
async fn admin_endpoints_require_the_admin_token() {
    let broker = spawn_broker(|config| {
        config.admin_token = Some("admin-secret".into());
    })
    .await;
    let client = reqwest::Client::new();
    let url = broker.url("/api/tunnel/diagnostics");

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = client.get(&url).bearer_auth("wrong").send().await.unwrap();
    assert_eq!(response.status(), 403);

    let response = client
        .get(&url)
        .bearer_auth("admin-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["sessions"].is_array());
}

#[tokio::test]
async fn runtime_config_update_applies() {
    let broker = spawn_broker(|config| {
        config.admin_token = Some("admin-secret".into());
    })
    .await;
    let client = reqwest::Client::new();
    let url = broker.url("/api/tunnel/config");

    let response = client
        .put(&url)
        .bearer_auth("admin-secret")
        .json(&serde_json::json!({"request_timeout_ms": 5000}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(broker.state.effective_request_timeout_ms(), 5000);

    // out-of-range values are rejected
    let response = client
        .put(&url)
        .bearer_auth("admin-secret")
        .json(&serde_json::json!({"request_timeout_ms": 10_000_000}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(broker.state.effective_request_timeout_ms(), 5000);
}
