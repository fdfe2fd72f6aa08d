//! In-process fake of the coordinator, the registry gateway and node status ports.
//!
//! One server answers all of the paths, so a test can point the coordinator client,
//! the registry and any number of nodes at fake servers spawned on ephemeral ports.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Default)]
struct FakeState {
    config: Value,
    stores: Value,
    kvs: BTreeMap<String, String>,
    posted: Vec<Value>,
    config_gets: usize,
    get_status: Option<u16>,
    post_status: Option<u16>,
    delay: Option<Duration>,
}

type Shared = Arc<Mutex<FakeState>>;

pub struct FakeServer {
    addr: SocketAddr,
    state: Shared,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub async fn spawn() -> Self {
        let state: Shared = Arc::new(Mutex::new(FakeState {
            config: json!({}),
            stores: json!({"stores": []}),
            ..Default::default()
        }));

        let app = Router::new()
            .route("/pd/api/v1/config", get(get_config).post(post_config))
            .route("/config", get(get_config).post(post_config))
            .route("/pd/api/v1/stores", get(get_stores))
            .route("/v3/kv/range", post(kv_range))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("fake server addr");
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        FakeServer {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_config(&self, config: Value) {
        self.state.lock().unwrap().config = config;
    }

    pub fn set_stores(&self, stores: Value) {
        self.state.lock().unwrap().stores = stores;
    }

    pub fn put_kv(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .kvs
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_get_status(&self, status: u16) {
        self.state.lock().unwrap().get_status = Some(status);
    }

    pub fn set_post_status(&self, status: u16) {
        self.state.lock().unwrap().post_status = Some(status);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    pub fn posted_configs(&self) -> Vec<Value> {
        self.state.lock().unwrap().posted.clone()
    }

    pub fn config_gets(&self) -> usize {
        self.state.lock().unwrap().config_gets
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn status_or_ok(status: Option<u16>) -> StatusCode {
    status
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK)
}

async fn get_config(State(state): State<Shared>) -> Response {
    let (delay, status, config) = {
        let mut guard = state.lock().unwrap();
        guard.config_gets += 1;
        (guard.delay, status_or_ok(guard.get_status), guard.config.clone())
    };
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if !status.is_success() {
        return (status, "injected failure").into_response();
    }
    Json(config).into_response()
}

async fn post_config(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut guard = state.lock().unwrap();
    let status = status_or_ok(guard.post_status);
    if !status.is_success() {
        return (status, "injected failure").into_response();
    }
    guard.posted.push(body);
    (StatusCode::OK, "").into_response()
}

async fn get_stores(State(state): State<Shared>) -> Response {
    Json(state.lock().unwrap().stores.clone()).into_response()
}

async fn kv_range(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let decode = |field: &str| {
        body.get(field)
            .and_then(Value::as_str)
            .and_then(|s| STANDARD.decode(s).ok())
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    };
    let Some(key) = decode("key") else {
        return (StatusCode::BAD_REQUEST, "missing key").into_response();
    };
    let range_end = decode("range_end");

    let guard = state.lock().unwrap();
    let kvs: Vec<Value> = guard
        .kvs
        .iter()
        .filter(|(k, _)| match &range_end {
            Some(end) => k.as_str() >= key.as_str() && k.as_str() < end.as_str(),
            None => **k == key,
        })
        .map(|(k, v)| json!({"key": STANDARD.encode(k), "value": STANDARD.encode(v)}))
        .collect();

    Json(json!({"count": kvs.len().to_string(), "kvs": kvs})).into_response()
}
