//! Instance cache and session lifecycle benchmarks
//!
//! Benchmarks for:
//! - Acquire/release on a warm instance (no factory call)
//! - Concurrent acquires against one endpoint vs. many endpoints
//! - Full Begin/End through the session registry

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::{Value, json};
use session_gateway::auth::AuthContext;
use session_gateway::session::NoopCleanup;
use session_gateway::transport::{TransportKind, TransportRequest};
use session_gateway::upstream::UpstreamError;
use session_gateway::{
    Endpoint, InstanceCache, SessionRegistry, UpstreamFactory, UpstreamParts, UpstreamServer,
};
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::broadcast;

struct NullServer {
    notifications: broadcast::Sender<Value>,
}

#[async_trait]
impl UpstreamServer for NullServer {
    async fn call(
        &self,
        _session_id: &str,
        message: Value,
    ) -> Result<Option<Value>, UpstreamError> {
        Ok(Some(json!({"jsonrpc": "2.0", "id": message["id"].clone(), "result": {}})))
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }
}

struct NullFactory;

#[async_trait]
impl UpstreamFactory for NullFactory {
    async fn create(
        &self,
        _namespace_id: &str,
        _session_id: &str,
    ) -> anyhow::Result<UpstreamParts> {
        let (notifications, _) = broadcast::channel(4);
        Ok(UpstreamParts::new(
            Arc::new(NullServer { notifications }),
            || async { Ok(()) },
        ))
    }
}

/// Acquire and release while another lease keeps the instance warm
fn bench_warm_acquire(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cache = InstanceCache::new(Arc::new(NullFactory));
    let _keep_warm = rt.block_on(cache.acquire("warm", "ns", "seed")).unwrap();

    c.bench_function("cache_warm_acquire_release", |b| {
        b.to_async(&rt).iter(|| async {
            let lease = cache.acquire("warm", "ns", "s").await.unwrap();
            black_box(lease.handle());
            lease.release().await;
        });
    });
}

/// Concurrent acquires, all on one endpoint or spread across many
fn bench_concurrent_acquire(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cache_concurrent_acquire");

    for endpoints in [1usize, 16] {
        group.bench_with_input(
            BenchmarkId::new("endpoints", endpoints),
            &endpoints,
            |b, &endpoints| {
                b.to_async(&rt).iter(|| async move {
                    let cache = InstanceCache::new(Arc::new(NullFactory));
                    let mut tasks = Vec::with_capacity(64);
                    for i in 0..64 {
                        let cache = cache.clone();
                        tasks.push(tokio::spawn(async move {
                            let name = format!("endpoint-{}", i % endpoints);
                            cache.acquire(&name, "ns", "s").await.unwrap().release().await;
                        }));
                    }
                    for task in tasks {
                        task.await.unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

/// Begin then End a request/response session on a warm endpoint
fn bench_session_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let registry = SessionRegistry::new(
        InstanceCache::new(Arc::new(NullFactory)),
        Arc::new(NoopCleanup),
    );
    let endpoint = Endpoint {
        name: "bench".to_string(),
        namespace_id: "ns".to_string(),
        auth_required: false,
        allow_query_param_auth: false,
    };
    let auth = AuthContext::default();
    let (_keep_warm, _) = rt
        .block_on(registry.begin(
            &endpoint,
            TransportKind::StreamableHttp,
            TransportRequest::Message(json!({"id": 0, "method": "initialize"})),
            &auth,
        ))
        .unwrap();

    c.bench_function("session_begin_end", |b| {
        b.to_async(&rt).iter(|| async {
            let (session, _) = registry
                .begin(
                    &endpoint,
                    TransportKind::StreamableHttp,
                    TransportRequest::Message(json!({"id": 1, "method": "initialize"})),
                    &auth,
                )
                .await
                .unwrap();
            registry.end(&session.id).await.unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_warm_acquire,
    bench_concurrent_acquire,
    bench_session_roundtrip
);
criterion_main!(benches);
