//! Child-process upstream servers speaking newline-delimited JSON over stdio

use super::{UpstreamError, UpstreamFactory, UpstreamParts, UpstreamServer, is_request};
use crate::config::NamespaceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, broadcast, oneshot};

/// Capacity of the server-notification fan-out channel
const NOTIFICATION_CAPACITY: usize = 256;

/// Spawns one child process per upstream instance
pub struct ProcessFactory {
    namespaces: HashMap<String, NamespaceConfig>,
    shutdown_timeout: Duration,
}

impl ProcessFactory {
    pub fn new(
        namespaces: impl IntoIterator<Item = NamespaceConfig>,
        shutdown_timeout: Duration,
    ) -> Self {
        let namespaces = namespaces
            .into_iter()
            .map(|ns| (ns.id.clone(), ns))
            .collect();

        Self {
            namespaces,
            shutdown_timeout,
        }
    }
}

#[async_trait]
impl UpstreamFactory for ProcessFactory {
    async fn create(&self, namespace_id: &str, session_id: &str) -> Result<UpstreamParts> {
        let namespace = self
            .namespaces
            .get(namespace_id)
            .with_context(|| format!("Unknown namespace '{}'", namespace_id))?;

        let mut child = Command::new(&namespace.command)
            .args(&namespace.args)
            .envs(&namespace.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn upstream for namespace '{}'", namespace_id))?;

        let stdin = child.stdin.take().context("Upstream stdin unavailable")?;
        let stdout = child.stdout.take().context("Upstream stdout unavailable")?;
        let stderr = child.stderr.take().context("Upstream stderr unavailable")?;

        tracing::info!(
            namespace = %namespace_id,
            command = %namespace.command,
            pid = ?child.id(),
            seed_session = %session_id,
            "Upstream process spawned"
        );

        let server = Arc::new(ProcessServer::new(namespace_id, stdin));
        tokio::spawn(read_stdout(
            namespace_id.to_string(),
            stdout,
            server.inner.clone(),
        ));
        tokio::spawn(log_stderr(namespace_id.to_string(), stderr));

        let namespace = namespace_id.to_string();
        let timeout = self.shutdown_timeout;
        Ok(UpstreamParts::new(server, move || {
            stop_child(child, namespace, timeout)
        }))
    }
}

/// An in-flight request awaiting its reply
struct Pending {
    original_id: Value,
    reply: oneshot::Sender<Value>,
}

/// State shared between callers and the stdout reader
struct Inner {
    pending: DashMap<u64, Pending>,
    notifications: broadcast::Sender<Value>,
    alive: AtomicBool,
}

impl Inner {
    /// Hand a message read from the child to its waiting caller, or fan it
    /// out as a server notification.
    fn route(&self, mut message: Value) {
        let is_reply = message.get("method").is_none();
        let gateway_id = message.get("id").and_then(Value::as_u64);

        if is_reply
            && let Some(id) = gateway_id
            && let Some((_, pending)) = self.pending.remove(&id)
        {
            message["id"] = pending.original_id;
            let _ = pending.reply.send(message);
            return;
        }

        let _ = self.notifications.send(message);
    }
}

/// Upstream server backed by a child process.
///
/// Requests from every session share the child's stdin. Each request is
/// rewritten with a gateway-unique id so replies can be matched back to their
/// caller, and the caller's original id is restored on the reply.
pub struct ProcessServer {
    namespace: String,
    stdin: Mutex<ChildStdin>,
    next_id: AtomicU64,
    inner: Arc<Inner>,
}

impl ProcessServer {
    fn new(namespace: &str, stdin: ChildStdin) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            namespace: namespace.to_string(),
            stdin: Mutex::new(stdin),
            next_id: AtomicU64::new(0),
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                notifications,
                alive: AtomicBool::new(true),
            }),
        }
    }

    async fn write(&self, message: &Value) -> Result<(), UpstreamError> {
        let mut line =
            serde_json::to_vec(message).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl UpstreamServer for ProcessServer {
    async fn call(
        &self,
        session_id: &str,
        mut message: Value,
    ) -> Result<Option<Value>, UpstreamError> {
        if !self.inner.alive.load(Ordering::SeqCst) {
            return Err(UpstreamError::Closed);
        }

        if !is_request(&message) {
            self.write(&message).await?;
            return Ok(None);
        }

        let gateway_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let original_id = std::mem::replace(&mut message["id"], Value::from(gateway_id));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            gateway_id,
            Pending {
                original_id,
                reply: tx,
            },
        );

        // The reader clears `pending` after flipping `alive`; re-check so a
        // request registered after that point cannot wait forever.
        if !self.inner.alive.load(Ordering::SeqCst) {
            self.inner.pending.remove(&gateway_id);
            return Err(UpstreamError::Closed);
        }

        if let Err(e) = self.write(&message).await {
            self.inner.pending.remove(&gateway_id);
            return Err(e);
        }

        tracing::trace!(
            namespace = %self.namespace,
            session_id = %session_id,
            gateway_id,
            "Request forwarded upstream"
        );

        rx.await.map(Some).map_err(|_| UpstreamError::Closed)
    }

    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.inner.notifications.subscribe()
    }
}

async fn read_stdout(namespace: String, stdout: ChildStdout, inner: Arc<Inner>) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(message) => inner.route(message),
                    Err(e) => {
                        tracing::warn!(
                            namespace = %namespace,
                            error = %e,
                            "Discarding non-JSON line from upstream"
                        );
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "Upstream stdout read failed");
                break;
            }
        }
    }

    inner.alive.store(false, Ordering::SeqCst);
    // Dropping the senders fails every outstanding call
    inner.pending.clear();
    tracing::debug!(namespace = %namespace, "Upstream stdout closed");
}

async fn log_stderr(namespace: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(namespace = %namespace, line = %line, "Upstream stderr");
    }
}

/// Stop the child gracefully (SIGTERM), escalating to SIGKILL after `timeout`
async fn stop_child(mut child: Child, namespace: String, timeout: Duration) -> Result<()> {
    if child.id().is_none() {
        tracing::debug!(namespace = %namespace, "Upstream process already exited");
        return Ok(());
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            kill(pid, Signal::SIGTERM).context("Failed to send SIGTERM to upstream process")?;
        }

        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for upstream process")?;
                tracing::info!(
                    namespace = %namespace,
                    status = %status,
                    "Upstream process stopped"
                );
            }
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    namespace = %namespace,
                    "Graceful shutdown timeout, sending SIGKILL"
                );
                child.kill().await.context("Failed to kill upstream process")?;
            }
        }
    }

    #[cfg(not(unix))]
    {
        child
            .kill()
            .await
            .context("Failed to kill upstream process")?;
        tracing::info!(namespace = %namespace, "Upstream process stopped");
    }

    Ok(())
}
