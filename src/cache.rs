//! Per-endpoint upstream instance cache with reference counting
//!
//! Each endpoint name maps to a slot guarded by its own async mutex. The
//! first caller to find a slot empty runs the factory while holding that
//! slot's lock, so concurrent callers for the same endpoint suspend on the
//! in-flight creation and then reuse its result. Unrelated endpoints never
//! contend: the shared map is only touched for the short, synchronous
//! get-or-insert of the slot itself.

use crate::error::GatewayError;
use crate::upstream::{Teardown, UpstreamFactory, UpstreamServer};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A running upstream server shared by every session of one endpoint
pub struct UpstreamInstance {
    pub endpoint: String,
    pub namespace_id: String,
    pub handle: Arc<dyn UpstreamServer>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for UpstreamInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamInstance")
            .field("endpoint", &self.endpoint)
            .field("namespace_id", &self.namespace_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

struct Live {
    instance: Arc<UpstreamInstance>,
    teardown: Teardown,
}

#[derive(Default)]
struct SlotState {
    live: Option<Live>,
    refs: usize,
    /// Set once the slot has been evicted; holders must look the key up again
    retired: bool,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
}

/// Snapshot of one cached instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryStats {
    pub endpoint: String,
    pub namespace_id: String,
    pub ref_count: usize,
}

/// Owns the one-running-instance-per-endpoint invariant
pub struct InstanceCache {
    factory: Arc<dyn UpstreamFactory>,
    slots: DashMap<String, Arc<Slot>>,
}

impl InstanceCache {
    pub fn new(factory: Arc<dyn UpstreamFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            slots: DashMap::new(),
        })
    }

    /// Obtain a reference to the endpoint's instance, creating it if needed.
    ///
    /// The returned lease holds one count on the instance until it is
    /// released (or dropped).
    pub async fn acquire(
        self: &Arc<Self>,
        endpoint: &str,
        namespace_id: &str,
        session_seed: &str,
    ) -> Result<InstanceLease, GatewayError> {
        loop {
            let slot = self
                .slots
                .entry(endpoint.to_string())
                .or_default()
                .clone();

            let mut state = slot.state.lock().await;
            if state.retired {
                continue;
            }

            if state.live.is_none() {
                match self.factory.create(namespace_id, session_seed).await {
                    Ok(parts) => {
                        tracing::info!(
                            endpoint = %endpoint,
                            namespace = %namespace_id,
                            "Upstream instance created"
                        );
                        crate::metrics::record_instance_created(endpoint, namespace_id);
                        state.live = Some(Live {
                            instance: Arc::new(UpstreamInstance {
                                endpoint: endpoint.to_string(),
                                namespace_id: namespace_id.to_string(),
                                handle: parts.handle,
                                created_at: Utc::now(),
                            }),
                            teardown: parts.teardown,
                        });
                    }
                    Err(source) => {
                        crate::metrics::record_instance_creation_failure(endpoint);
                        if state.refs == 0 {
                            state.retired = true;
                            self.slots.remove_if(endpoint, |_, s| Arc::ptr_eq(s, &slot));
                        }
                        return Err(GatewayError::UpstreamCreationFailure {
                            endpoint: endpoint.to_string(),
                            source,
                        });
                    }
                }
            }

            let Some(live) = state.live.as_ref() else {
                continue;
            };
            let instance = live.instance.clone();
            state.refs += 1;

            tracing::debug!(
                endpoint = %endpoint,
                ref_count = state.refs,
                "Upstream instance reference acquired"
            );

            return Ok(InstanceLease {
                cache: self.clone(),
                endpoint: endpoint.to_string(),
                instance,
                released: false,
            });
        }
    }

    /// Drop one reference; the last one tears the instance down and evicts it.
    async fn release_instance(&self, endpoint: &str, instance: &Arc<UpstreamInstance>) {
        let Some(slot) = self.slots.get(endpoint).map(|s| s.clone()) else {
            tracing::warn!(endpoint = %endpoint, "Release for an endpoint with no cached instance");
            return;
        };

        let mut state = slot.state.lock().await;
        let owns_live = state
            .live
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(&live.instance, instance));
        if !owns_live || state.refs == 0 {
            tracing::warn!(endpoint = %endpoint, "Release for a stale instance reference ignored");
            return;
        }

        state.refs -= 1;
        tracing::debug!(
            endpoint = %endpoint,
            ref_count = state.refs,
            "Upstream instance reference released"
        );
        if state.refs > 0 {
            return;
        }

        let live = state.live.take();
        state.retired = true;
        self.slots.remove_if(endpoint, |_, s| Arc::ptr_eq(s, &slot));
        drop(state);

        if let Some(live) = live {
            crate::metrics::record_instance_torn_down(endpoint);
            match (live.teardown)().await {
                Ok(()) => tracing::info!(endpoint = %endpoint, "Upstream instance torn down"),
                Err(e) => tracing::error!(
                    endpoint = %endpoint,
                    error = %e,
                    "Upstream teardown failed; instance evicted anyway"
                ),
            }
        }
    }

    /// Current reference count for an endpoint (0 when nothing is cached)
    pub async fn ref_count(&self, endpoint: &str) -> usize {
        let Some(slot) = self.slots.get(endpoint).map(|s| s.clone()) else {
            return 0;
        };
        let state = slot.state.lock().await;
        if state.live.is_some() { state.refs } else { 0 }
    }

    /// Whether a live instance is cached for the endpoint
    pub async fn contains(&self, endpoint: &str) -> bool {
        let Some(slot) = self.slots.get(endpoint).map(|s| s.clone()) else {
            return false;
        };
        slot.state.lock().await.live.is_some()
    }

    /// Snapshot of all live instances
    pub async fn stats(&self) -> Vec<CacheEntryStats> {
        let slots: Vec<Arc<Slot>> = self.slots.iter().map(|e| e.value().clone()).collect();

        let mut stats = Vec::with_capacity(slots.len());
        for slot in slots {
            let state = slot.state.lock().await;
            if let Some(live) = state.live.as_ref() {
                stats.push(CacheEntryStats {
                    endpoint: live.instance.endpoint.clone(),
                    namespace_id: live.instance.namespace_id.clone(),
                    ref_count: state.refs,
                });
            }
        }
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }
}

/// One counted reference on a cached instance.
///
/// Call [`InstanceLease::release`] to give the reference back. A lease that
/// is dropped unreleased (an early return, a cancelled request) releases
/// itself on a spawned task so the count always balances.
pub struct InstanceLease {
    cache: Arc<InstanceCache>,
    endpoint: String,
    instance: Arc<UpstreamInstance>,
    released: bool,
}

impl InstanceLease {
    pub fn instance(&self) -> &Arc<UpstreamInstance> {
        &self.instance
    }

    pub fn handle(&self) -> Arc<dyn UpstreamServer> {
        self.instance.handle.clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn release(mut self) {
        self.released = true;
        self.cache
            .release_instance(&self.endpoint, &self.instance)
            .await;
    }
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("endpoint", &self.endpoint)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let cache = self.cache.clone();
        let endpoint = std::mem::take(&mut self.endpoint);
        let instance = self.instance.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(endpoint = %endpoint, "Releasing dropped instance lease");
                runtime.spawn(async move {
                    cache.release_instance(&endpoint, &instance).await;
                });
            }
            Err(_) => {
                tracing::warn!(endpoint = %endpoint, "Instance lease dropped outside a runtime");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mocks::MockFactory;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_creates_once_and_counts() {
        let factory = Arc::new(MockFactory::new());
        let cache = InstanceCache::new(factory.clone());

        let a = cache.acquire("weather", "ns", "s1").await.unwrap();
        let b = cache.acquire("weather", "ns", "s2").await.unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(cache.ref_count("weather").await, 2);
        assert!(Arc::ptr_eq(a.instance(), b.instance()));

        a.release().await;
        assert_eq!(cache.ref_count("weather").await, 1);
        assert_eq!(factory.torn_down(), 0);

        b.release().await;
        assert_eq!(cache.ref_count("weather").await, 0);
        assert!(!cache.contains("weather").await);
        assert_eq!(factory.torn_down(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_acquires_create_exactly_once() {
        let factory = Arc::new(MockFactory::with_delay(Duration::from_millis(50)));
        let cache = InstanceCache::new(factory.clone());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .acquire("shared", "ns", &format!("s{i}"))
                    .await
                    .unwrap()
            }));
        }

        let mut leases = Vec::new();
        for task in tasks {
            leases.push(task.await.unwrap());
        }

        assert_eq!(factory.created(), 1);
        assert_eq!(cache.ref_count("shared").await, 16);

        for lease in leases {
            lease.release().await;
        }
        assert_eq!(factory.torn_down(), 1);
    }

    #[tokio::test]
    async fn test_endpoints_sharing_a_namespace_get_separate_instances() {
        let factory = Arc::new(MockFactory::new());
        let cache = InstanceCache::new(factory.clone());

        let a = cache.acquire("alpha", "ns", "s1").await.unwrap();
        let b = cache.acquire("beta", "ns", "s2").await.unwrap();

        assert_eq!(factory.created(), 2);
        assert!(!Arc::ptr_eq(a.instance(), b.instance()));

        let stats = cache.stats().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].endpoint, "alpha");
        assert_eq!(stats[0].ref_count, 1);

        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_creation_failure_leaves_nothing_behind() {
        let factory = Arc::new(MockFactory::new());
        factory.fail_create.store(true, Ordering::SeqCst);
        let cache = InstanceCache::new(factory.clone());

        let err = cache.acquire("broken", "ns", "s1").await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamCreationFailure { .. }));
        assert!(!cache.contains("broken").await);
        assert_eq!(cache.ref_count("broken").await, 0);

        // A later request makes its own attempt
        factory.fail_create.store(false, Ordering::SeqCst);
        let lease = cache.acquire("broken", "ns", "s2").await.unwrap();
        assert_eq!(factory.created(), 2);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_teardown_failure_still_evicts() {
        let factory = Arc::new(MockFactory::new());
        factory.fail_teardown.store(true, Ordering::SeqCst);
        let cache = InstanceCache::new(factory.clone());

        cache.acquire("sticky", "ns", "s1").await.unwrap().release().await;
        assert_eq!(factory.torn_down(), 1);
        assert!(!cache.contains("sticky").await);

        // A fresh instance can be created immediately
        let lease = cache.acquire("sticky", "ns", "s2").await.unwrap();
        assert_eq!(factory.created(), 2);
        lease.release().await;
    }

    #[tokio::test]
    async fn test_dropped_lease_releases_itself() {
        let factory = Arc::new(MockFactory::new());
        let cache = InstanceCache::new(factory.clone());

        {
            let _lease = cache.acquire("weather", "ns", "s1").await.unwrap();
        }

        for _ in 0..100 {
            if factory.torn_down() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(factory.torn_down(), 1);
        assert_eq!(cache.ref_count("weather").await, 0);
    }

    #[tokio::test]
    async fn test_stale_lease_does_not_touch_new_instance() {
        let factory = Arc::new(MockFactory::new());
        let cache = InstanceCache::new(factory.clone());

        let first = cache.acquire("weather", "ns", "s1").await.unwrap();
        let stale_instance = first.instance().clone();
        first.release().await;

        let second = cache.acquire("weather", "ns", "s2").await.unwrap();
        cache.release_instance("weather", &stale_instance).await;

        assert_eq!(cache.ref_count("weather").await, 1);
        assert_eq!(factory.torn_down(), 1);
        second.release().await;
        assert_eq!(factory.torn_down(), 2);
    }
}
