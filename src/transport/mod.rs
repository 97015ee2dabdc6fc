//! Session transports
//!
//! A transport carries protocol messages for exactly one session. Two kinds
//! exist: a request/response style (replies come back on the HTTP response)
//! and a push-stream style (replies travel on a long-lived event stream). The
//! session registry only ever sees the [`Transport`] trait.

use crate::error::GatewayError;
use crate::upstream::{UpstreamError, UpstreamServer};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub mod sse;
pub mod streamable;

pub use sse::SseTransport;
pub use streamable::StreamableHttpTransport;

/// Which transport flavor a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Request/response style: replies return on the POST response
    StreamableHttp,
    /// Push-stream style: replies are delivered on the event stream
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StreamableHttp => write!(f, "streamable_http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// What a client asked the transport to do
#[derive(Debug, Clone, PartialEq)]
pub enum TransportRequest {
    /// Client-to-server message, or a batch of them as a JSON array
    Message(Value),
    /// Open the server-to-client event stream
    Listen,
}

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub event: &'static str,
    pub data: String,
}

impl TransportEvent {
    pub fn message(value: &Value) -> Self {
        Self {
            event: "message",
            data: value.to_string(),
        }
    }

    pub fn endpoint(url: impl Into<String>) -> Self {
        Self {
            event: "endpoint",
            data: url.into(),
        }
    }
}

pub type EventStream = BoxStream<'static, TransportEvent>;

/// What the transport produced for a request
pub enum TransportResponse {
    /// A reply to return immediately
    Reply(Value),
    /// Accepted; nothing to return on this response
    Accepted,
    /// A server-to-client event stream
    Stream(EventStream),
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reply(v) => f.debug_tuple("Reply").field(v).finish(),
            Self::Accepted => write!(f, "Accepted"),
            Self::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Lifecycle contract shared by every transport kind
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn session_id(&self) -> &str;

    /// Bind the transport to its upstream server (part of Begin)
    async fn connect(&self, upstream: Arc<dyn UpstreamServer>) -> Result<(), GatewayError>;

    /// Handle one client request (the Begin request and every Continue)
    async fn dispatch(&self, request: TransportRequest)
    -> Result<TransportResponse, GatewayError>;

    /// Stop all streams; further dispatches fail (part of End)
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Build a transport of the given kind for a new session
pub fn new_transport(kind: TransportKind, session_id: &str, endpoint: &str) -> Arc<dyn Transport> {
    match kind {
        TransportKind::StreamableHttp => Arc::new(StreamableHttpTransport::new(session_id)),
        TransportKind::Sse => Arc::new(SseTransport::new(session_id, endpoint)),
    }
}

/// Forward one message or a JSON array batch, collecting replies in order
pub(crate) async fn forward(
    upstream: &dyn UpstreamServer,
    session_id: &str,
    message: Value,
) -> Result<Vec<Value>, GatewayError> {
    let messages = match message {
        Value::Array(batch) => batch,
        single => vec![single],
    };

    let mut replies = Vec::new();
    for message in messages {
        if let Some(reply) = upstream
            .call(session_id, message)
            .await
            .map_err(upstream_failure)?
        {
            replies.push(reply);
        }
    }
    Ok(replies)
}

pub(crate) fn upstream_failure(err: UpstreamError) -> GatewayError {
    GatewayError::InternalFailure(anyhow::Error::new(err).context("Upstream call failed"))
}

/// Relay server notifications until the transport closes
pub(crate) fn notification_stream(
    session_id: String,
    mut notifications: broadcast::Receiver<Value>,
    mut closed: watch::Receiver<bool>,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let already_closed = *closed.borrow();
        if !already_closed {
            loop {
                tokio::select! {
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                    received = notifications.recv() => match received {
                        Ok(message) => yield TransportEvent::message(&message),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                session_id = %session_id,
                                skipped,
                                "Event stream lagged behind upstream notifications"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    })
}
