#![allow(dead_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use stargate_deploy::node::Node;

pub const USERNAME: &str = "cassandra";
pub const PASSWORD: &str = "cassandra";

struct NodeState {
    name: String,
    status: Mutex<u16>,
    health: Mutex<u16>,
    hits: AtomicUsize,
    failures: AtomicUsize,
    accepted_token: Mutex<Option<String>>,
    rejection: Mutex<u16>,
    seen_tokens: Mutex<Vec<String>>,
}

/// In-process stand-in for one API node.
#[derive(Clone)]
pub struct MockNode {
    pub addr: SocketAddr,
    state: Arc<NodeState>,
}

impl MockNode {
    pub async fn start(name: &str) -> Self {
        let state = Arc::new(NodeState {
            name: name.to_string(),
            status: Mutex::new(200),
            health: Mutex::new(200),
            hits: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            accepted_token: Mutex::new(None),
            rejection: Mutex::new(401),
            seen_tokens: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/health", get(node_health))
            .fallback(node_api)
            .with_state(state.clone());
        let addr = serve(app).await;
        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn node(&self, id: &str) -> Node {
        Node::parse(id, &self.endpoint(), &format!("{}/health", self.endpoint())).unwrap()
    }

    /// Status returned by every API call from now on.
    pub fn respond_with(&self, status: u16) {
        *self.state.status.lock() = status;
    }

    /// Answer 503 to the next `count` API calls.
    pub fn fail_next(&self, count: usize) {
        self.state.failures.store(count, Ordering::SeqCst);
    }

    pub fn health_with(&self, status: u16) {
        *self.state.health.lock() = status;
    }

    /// Answer 401 to any other token.
    pub fn accept_only(&self, token: &str) {
        self.accept_only_rejecting(token, 401);
    }

    /// Answer `status` to any other token.
    pub fn accept_only_rejecting(&self, token: &str, status: u16) {
        *self.state.rejection.lock() = status;
        *self.state.accepted_token.lock() = Some(token.to_string());
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.state.seen_tokens.lock().clone()
    }
}

async fn node_health(State(state): State<Arc<NodeState>>) -> StatusCode {
    let status = *state.health.lock();
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn node_api(State(state): State<Arc<NodeState>>, headers: HeaderMap) -> (StatusCode, String) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let token = headers
        .get("x-cassandra-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.seen_tokens.lock().push(token.clone());

    let accepted = state.accepted_token.lock().clone();
    if let Some(expected) = accepted {
        if token != expected {
            let status = *state.rejection.lock();
            return (
                StatusCode::from_u16(status).unwrap_or(StatusCode::UNAUTHORIZED),
                "invalid token".to_string(),
            );
        }
    }
    let failing = state
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (StatusCode::SERVICE_UNAVAILABLE, "overloaded".to_string());
    }
    let status = *state.status.lock();
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        state.name.clone(),
    )
}

struct AuthState {
    issued: AtomicUsize,
    requests: AtomicUsize,
    status: Mutex<u16>,
    delay: Mutex<Duration>,
}

/// In-process stand-in for the auth service. Issues `token-1`, `token-2`, ...
#[derive(Clone)]
pub struct MockAuth {
    pub addr: SocketAddr,
    state: Arc<AuthState>,
}

impl MockAuth {
    pub async fn start() -> Self {
        let state = Arc::new(AuthState {
            issued: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            status: Mutex::new(201),
            delay: Mutex::new(Duration::ZERO),
        });
        let app = Router::new()
            .route("/v1/auth", post(issue_token))
            .with_state(state.clone());
        let addr = serve(app).await;
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn respond_with(&self, status: u16) {
        *self.state.status.lock() = status;
    }

    pub fn delay(&self, delay: Duration) {
        *self.state.delay.lock() = delay;
    }

    pub fn issued(&self) -> usize {
        self.state.issued.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }
}

async fn issue_token(State(state): State<Arc<AuthState>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let delay = *state.delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let status = *state.status.lock();
    if status >= 300 {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return (status, Json(json!({ "description": "unavailable" })));
    }
    if body["username"] != USERNAME || body["password"] != PASSWORD {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "description": "bad credentials" })));
    }

    let n = state.issued.fetch_add(1, Ordering::SeqCst) + 1;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::CREATED);
    (status, Json(json!({ "authToken": format!("token-{}", n) })))
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("Mock server error: {}", e);
        }
    });
    addr
}
