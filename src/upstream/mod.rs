//! Upstream protocol-server interfaces
//!
//! The gateway never interprets protocol messages. It hands each client
//! message to an [`UpstreamServer`] and relays whatever comes back, and it
//! obtains servers from an [`UpstreamFactory`] keyed by namespace.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod process;

pub use process::ProcessFactory;

/// Upstream call errors
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream server is closed")]
    Closed,

    #[error("Upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed upstream message: {0}")]
    Protocol(String),
}

/// A running protocol server shared by every session of one endpoint
#[async_trait]
pub trait UpstreamServer: Send + Sync {
    /// Deliver one client message.
    ///
    /// Returns the reply for requests and `None` for messages that expect no
    /// reply (notifications, client responses).
    async fn call(&self, session_id: &str, message: Value) -> Result<Option<Value>, UpstreamError>;

    /// Server-initiated messages
    fn subscribe(&self) -> broadcast::Receiver<Value>;
}

/// Action that stops an upstream server
pub type Teardown = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A freshly created upstream server and the action that stops it
pub struct UpstreamParts {
    pub handle: Arc<dyn UpstreamServer>,
    pub teardown: Teardown,
}

impl UpstreamParts {
    pub fn new<F, Fut>(handle: Arc<dyn UpstreamServer>, teardown: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            handle,
            teardown: Box::new(move || -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(teardown())
            }),
        }
    }
}

/// Creates upstream servers for a namespace
#[async_trait]
pub trait UpstreamFactory: Send + Sync {
    async fn create(&self, namespace_id: &str, session_id: &str) -> anyhow::Result<UpstreamParts>;
}

/// Whether a message expects a reply (carries both `method` and `id`)
pub fn is_request(message: &Value) -> bool {
    message.get("method").is_some() && message.get("id").is_some_and(|id| !id.is_null())
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Echoes requests back as `{"id": .., "result": {"echo": .., "session": ..}}`
    pub struct EchoServer {
        notifications: broadcast::Sender<Value>,
        pub fail_calls: AtomicBool,
        pub stall_calls: AtomicBool,
    }

    impl EchoServer {
        pub fn new() -> Self {
            let (notifications, _) = broadcast::channel(16);
            Self {
                notifications,
                fail_calls: AtomicBool::new(false),
                stall_calls: AtomicBool::new(false),
            }
        }

        pub fn notify(&self, message: Value) {
            let _ = self.notifications.send(message);
        }
    }

    #[async_trait]
    impl UpstreamServer for EchoServer {
        async fn call(
            &self,
            session_id: &str,
            message: Value,
        ) -> Result<Option<Value>, UpstreamError> {
            if self.fail_calls.load(Ordering::SeqCst) {
                return Err(UpstreamError::Closed);
            }
            if self.stall_calls.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if !is_request(&message) {
                return Ok(None);
            }
            Ok(Some(serde_json::json!({
                "jsonrpc": "2.0",
                "id": message["id"].clone(),
                "result": { "echo": message["method"].clone(), "session": session_id },
            })))
        }

        fn subscribe(&self) -> broadcast::Receiver<Value> {
            self.notifications.subscribe()
        }
    }

    /// Counts creations and teardowns; can be told to fail or to hang
    pub struct MockFactory {
        pub created: AtomicUsize,
        pub torn_down: Arc<AtomicUsize>,
        pub fail_create: AtomicBool,
        pub fail_teardown: AtomicBool,
        pub fail_calls: AtomicBool,
        pub stall_calls: AtomicBool,
        pub create_delay: Duration,
    }

    impl MockFactory {
        pub fn new() -> Self {
            Self {
                created: AtomicUsize::new(0),
                torn_down: Arc::new(AtomicUsize::new(0)),
                fail_create: AtomicBool::new(false),
                fail_teardown: AtomicBool::new(false),
                fail_calls: AtomicBool::new(false),
                stall_calls: AtomicBool::new(false),
                create_delay: Duration::ZERO,
            }
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                create_delay: delay,
                ..Self::new()
            }
        }

        pub fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }

        pub fn torn_down(&self) -> usize {
            self.torn_down.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamFactory for MockFactory {
        async fn create(
            &self,
            namespace_id: &str,
            _session_id: &str,
        ) -> anyhow::Result<UpstreamParts> {
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            if self.fail_create.load(Ordering::SeqCst) {
                anyhow::bail!("namespace '{}' failed to start", namespace_id);
            }

            let server = EchoServer::new();
            server
                .fail_calls
                .store(self.fail_calls.load(Ordering::SeqCst), Ordering::SeqCst);
            server
                .stall_calls
                .store(self.stall_calls.load(Ordering::SeqCst), Ordering::SeqCst);

            let torn_down = self.torn_down.clone();
            let fail_teardown = self.fail_teardown.load(Ordering::SeqCst);
            Ok(UpstreamParts::new(Arc::new(server), move || async move {
                torn_down.fetch_add(1, Ordering::SeqCst);
                if fail_teardown {
                    anyhow::bail!("teardown exploded");
                }
                Ok(())
            }))
        }
    }
}
