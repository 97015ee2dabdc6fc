//! Shared fixtures for integration and property tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum_test::TestServer;
use serde_json::{Value, json};
use session_gateway::{
    ApiKeyConfig, Endpoint, Gateway, GatewayConfig, UpstreamFactory, UpstreamParts,
    UpstreamServer,
    api::routes::{AppState, create_router},
    metrics,
    upstream::UpstreamError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast;

// Global metrics handle - only initialize once per test process
static METRICS_HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

pub fn get_metrics_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| metrics::setup_metrics().expect("Failed to setup metrics"))
        .clone()
}

/// Replies to every request with the method name and the calling session
pub struct EchoServer {
    notifications: broadcast::Sender<Value>,
}

#[async_trait]
impl UpstreamServer for EchoServer {
    async fn call(&self, session_id: &str, message: Value) -> Result<Option<Value>, UpstreamError> {
        if message.get("id").is_none_or(Value::is_null) {
            return Ok(None);
        }
        Ok(Some(json!({
            "jsonrpc": "2.0",
            "id": message["id"].clone(),
            "result": { "echo": message["method"].clone(), "session": session_id },
        })))
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }
}

/// Factory that counts creations and teardowns
#[derive(Default)]
pub struct CountingFactory {
    pub created: AtomicUsize,
    pub torn_down: Arc<AtomicUsize>,
    pub fail_create: AtomicBool,
    pub create_delay: Duration,
}

impl CountingFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> usize {
        self.torn_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamFactory for CountingFactory {
    async fn create(&self, namespace_id: &str, _session_id: &str) -> anyhow::Result<UpstreamParts> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("spawn of namespace '{}' failed: secret detail", namespace_id);
        }

        let (notifications, _) = broadcast::channel(16);
        let torn_down = self.torn_down.clone();
        Ok(UpstreamParts::new(
            Arc::new(EchoServer { notifications }),
            move || async move {
                torn_down.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ))
    }
}

fn endpoint(name: &str, auth_required: bool, allow_query_param_auth: bool) -> Endpoint {
    Endpoint {
        name: name.to_string(),
        namespace_id: "ns-test".to_string(),
        auth_required,
        allow_query_param_auth,
    }
}

/// Endpoints `weather`, `shared` (open), `secure` (key, headers only) and
/// `querykey` (key, query parameter allowed); keys `sk-valid` and `sk-revoked`.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        endpoints: vec![
            endpoint("weather", false, false),
            endpoint("shared", false, false),
            endpoint("secure", true, false),
            endpoint("querykey", true, true),
        ],
        api_keys: vec![
            ApiKeyConfig {
                key: "sk-valid".to_string(),
                key_id: "key-1".to_string(),
                identity: "ops-team".to_string(),
                active: true,
            },
            ApiKeyConfig {
                key: "sk-revoked".to_string(),
                key_id: "key-2".to_string(),
                identity: "former".to_string(),
                active: false,
            },
        ],
        ..Default::default()
    }
}

pub struct TestGateway {
    pub server: TestServer,
    pub gateway: Arc<Gateway>,
    pub factory: Arc<CountingFactory>,
}

/// Router over a gateway built from `test_config()`
pub fn create_test_app(factory: Arc<CountingFactory>) -> (Router, Arc<Gateway>) {
    let config = test_config();
    let gateway = Arc::new(Gateway::from_config(&config, factory));

    let state = AppState {
        gateway: gateway.clone(),
        prometheus_handle: get_metrics_handle(),
        sse_keep_alive: config.sse_keepalive(),
    };
    (create_router(state), gateway)
}

/// Helper to create a test server over the gateway
pub fn create_test_gateway(factory: CountingFactory) -> TestGateway {
    let factory = Arc::new(factory);
    let (app, gateway) = create_test_app(factory.clone());
    let server = TestServer::try_new(app).expect("Failed to create test server");

    TestGateway {
        server,
        gateway,
        factory,
    }
}

pub fn request(id: u64, method: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method})
}
