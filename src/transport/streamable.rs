//! Request/response transport: replies come back on the POST that carried
//! the request, and a GET opens a stream of server-initiated messages.

use super::{
    Transport, TransportKind, TransportRequest, TransportResponse, forward, notification_stream,
};
use crate::error::GatewayError;
use crate::upstream::UpstreamServer;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

pub struct StreamableHttpTransport {
    session_id: String,
    upstream: OnceLock<Arc<dyn UpstreamServer>>,
    closed: watch::Sender<bool>,
}

impl StreamableHttpTransport {
    pub fn new(session_id: &str) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            session_id: session_id.to_string(),
            upstream: OnceLock::new(),
            closed,
        }
    }

    fn upstream(&self) -> Result<&Arc<dyn UpstreamServer>, GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::SessionNotFound(self.session_id.clone()));
        }
        self.upstream.get().ok_or_else(|| {
            GatewayError::InternalFailure(anyhow::anyhow!(
                "Transport for session '{}' is not connected",
                self.session_id
            ))
        })
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn connect(&self, upstream: Arc<dyn UpstreamServer>) -> Result<(), GatewayError> {
        self.upstream.set(upstream).map_err(|_| {
            GatewayError::InternalFailure(anyhow::anyhow!(
                "Transport for session '{}' is already connected",
                self.session_id
            ))
        })
    }

    async fn dispatch(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, GatewayError> {
        let upstream = self.upstream()?;

        match request {
            TransportRequest::Message(message) => {
                let is_batch = message.is_array();
                let mut replies = forward(upstream.as_ref(), &self.session_id, message).await?;

                Ok(match (is_batch, replies.len()) {
                    (_, 0) => TransportResponse::Accepted,
                    (false, _) => TransportResponse::Reply(replies.remove(0)),
                    (true, _) => TransportResponse::Reply(Value::Array(replies)),
                })
            }
            TransportRequest::Listen => Ok(TransportResponse::Stream(notification_stream(
                self.session_id.clone(),
                upstream.subscribe(),
                self.closed.subscribe(),
            ))),
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
