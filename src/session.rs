//! Session registry and lifecycle
//!
//! Sessions move `Uninitialized -> Active -> Closed`. A session only becomes
//! visible to lookups once its transport is connected to the cached upstream
//! instance, and it leaves the registry exactly once, which is what makes
//! double termination a reported error rather than a double release.

use crate::auth::AuthContext;
use crate::cache::{InstanceCache, InstanceLease};
use crate::directory::Endpoint;
use crate::error::GatewayError;
use crate::transport::{
    Transport, TransportKind, TransportRequest, TransportResponse, new_transport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Uninitialized,
    Active,
    Closed,
}

/// Per-session auxiliary state kept outside the gateway
#[async_trait]
pub trait SessionCleanup: Send + Sync {
    async fn cleanup(&self, session_id: &str);
}

/// Cleanup hook for deployments with no per-session state
pub struct NoopCleanup;

#[async_trait]
impl SessionCleanup for NoopCleanup {
    async fn cleanup(&self, _session_id: &str) {}
}

/// One client conversation bound to a transport and an upstream instance
pub struct Session {
    pub id: String,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
    transport: Arc<dyn Transport>,
    lease: Mutex<Option<InstanceLease>>,
    state: RwLock<SessionState>,
    last_activity_ms: AtomicI64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Time since the last Begin/Continue on this session
    pub fn idle_for(&self) -> Duration {
        let idle_ms =
            Utc::now().timestamp_millis() - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }
}

/// Owns every live session and drives Begin / Continue / End
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    cache: Arc<InstanceCache>,
    cleanup: Arc<dyn SessionCleanup>,
}

impl SessionRegistry {
    pub fn new(cache: Arc<InstanceCache>, cleanup: Arc<dyn SessionCleanup>) -> Self {
        Self {
            sessions: DashMap::new(),
            cache,
            cleanup,
        }
    }

    pub fn cache(&self) -> &Arc<InstanceCache> {
        &self.cache
    }

    /// Begin: create a session for `endpoint` and dispatch its first request.
    pub async fn begin(
        &self,
        endpoint: &Endpoint,
        kind: TransportKind,
        request: TransportRequest,
        auth: &AuthContext,
    ) -> Result<(Arc<Session>, TransportResponse), GatewayError> {
        let session_id = uuid::Uuid::new_v4().to_string();

        let lease = self
            .cache
            .acquire(&endpoint.name, &endpoint.namespace_id, &session_id)
            .await?;

        let transport = new_transport(kind, &session_id, &endpoint.name);
        if let Err(e) = transport.connect(lease.handle()).await {
            transport.close().await;
            lease.release().await;
            return Err(e);
        }

        let session = Arc::new(Session {
            id: session_id.clone(),
            endpoint: endpoint.name.clone(),
            created_at: Utc::now(),
            transport: transport.clone(),
            lease: Mutex::new(Some(lease)),
            state: RwLock::new(SessionState::Uninitialized),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        });
        *session.state.write().await = SessionState::Active;

        let published = match self.sessions.entry(session_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                true
            }
            Entry::Occupied(_) => false,
        };
        if !published {
            transport.close().await;
            if let Some(lease) = session.lease.lock().await.take() {
                lease.release().await;
            }
            return Err(GatewayError::InternalFailure(anyhow::anyhow!(
                "Session id collision for '{}'",
                session_id
            )));
        }

        // Undone on drop until the first request returns
        let pending = PendingBegin {
            registry: self,
            session_id: Some(session_id.clone()),
        };

        tracing::info!(
            endpoint = %endpoint.name,
            session_id = %session_id,
            transport = %kind,
            identity = ?auth.identity,
            key_id = ?auth.key_id,
            "Session started"
        );
        crate::metrics::record_session_begun(&endpoint.name, kind);
        crate::metrics::update_active_sessions(self.sessions.len());

        let dispatched = transport.dispatch(request).await;
        pending.disarm();

        match dispatched {
            Ok(response) => Ok((session, response)),
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "First request failed; rolling session back"
                );
                if let Err(end_err) = self.end(&session_id).await {
                    tracing::debug!(
                        session_id = %session_id,
                        error = %end_err,
                        "Rollback raced with End"
                    );
                }
                Err(e)
            }
        }
    }

    /// Continue: forward a request to an existing session's transport.
    pub async fn continue_session(
        &self,
        endpoint: &str,
        session_id: &str,
        request: TransportRequest,
    ) -> Result<TransportResponse, GatewayError> {
        let session = self.lookup(endpoint, session_id)?;
        session.touch();
        session.transport.dispatch(request).await
    }

    /// End a session that must belong to `endpoint`.
    pub async fn end_for(&self, endpoint: &str, session_id: &str) -> Result<(), GatewayError> {
        self.lookup(endpoint, session_id)?;
        self.end(session_id).await
    }

    /// End: close the transport, drop the record, run the cleanup hook and
    /// release the instance reference.
    pub async fn end(&self, session_id: &str) -> Result<(), GatewayError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))?;

        close_session(session, self.cleanup.clone(), self.sessions.len()).await;
        Ok(())
    }

    /// Active session by id, scoped to the endpoint it was created on
    pub fn lookup(&self, endpoint: &str, session_id: &str) -> Result<Arc<Session>, GatewayError> {
        self.get(session_id)
            .filter(|session| session.endpoint == endpoint)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.to_string()))
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.value().clone())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// End every session idle for longer than `max_idle`; returns how many
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.value().idle_for() > max_idle)
            .map(|s| s.key().clone())
            .collect();

        let mut reaped = 0;
        for session_id in idle {
            if self.end(&session_id).await.is_ok() {
                tracing::info!(session_id = %session_id, "Idle session expired");
                reaped += 1;
            }
        }
        reaped
    }

    /// End every live session (shutdown)
    pub async fn end_all(&self) {
        for session_id in self.session_ids() {
            if let Err(e) = self.end(&session_id).await {
                tracing::debug!(
                    session_id = %session_id,
                    error = %e,
                    "Session already gone at shutdown"
                );
            }
        }
    }
}

/// Second half of End, once the record has left the registry
async fn close_session(
    session: Arc<Session>,
    cleanup: Arc<dyn SessionCleanup>,
    remaining: usize,
) {
    session.transport.close().await;
    *session.state.write().await = SessionState::Closed;
    cleanup.cleanup(&session.id).await;

    if let Some(lease) = session.lease.lock().await.take() {
        lease.release().await;
    }

    tracing::info!(
        endpoint = %session.endpoint,
        session_id = %session.id,
        "Session ended"
    );
    crate::metrics::record_session_ended(&session.endpoint);
    crate::metrics::update_active_sessions(remaining);
}

/// Ends a published session if Begin is dropped before its first request
/// completes
struct PendingBegin<'a> {
    registry: &'a SessionRegistry,
    session_id: Option<String>,
}

impl PendingBegin<'_> {
    fn disarm(mut self) {
        self.session_id = None;
    }
}

impl Drop for PendingBegin<'_> {
    fn drop(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };
        let Some((_, session)) = self.registry.sessions.remove(&session_id) else {
            return;
        };
        tracing::warn!(session_id = %session_id, "Begin cancelled; rolling session back");

        let cleanup = self.registry.cleanup.clone();
        let remaining = self.registry.sessions.len();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(close_session(session, cleanup, remaining));
            }
            // The lease releases itself when the session is dropped
            Err(_) => tracing::warn!(
                session_id = %session_id,
                "Begin cancelled outside a runtime"
            ),
        }
    }
}
