//! Push-stream transport: the client holds one event stream open, posts
//! messages to a separate URL, and receives every reply on the stream.

use super::{
    EventStream, Transport, TransportEvent, TransportKind, TransportRequest, TransportResponse,
    forward, notification_stream,
};
use crate::error::GatewayError;
use crate::upstream::UpstreamServer;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

/// Replies buffered for the event stream before posting callers wait
const OUTBOUND_CAPACITY: usize = 64;

pub struct SseTransport {
    session_id: String,
    message_url: String,
    upstream: OnceLock<Arc<dyn UpstreamServer>>,
    outbound: mpsc::Sender<Value>,
    inbox: Mutex<Option<mpsc::Receiver<Value>>>,
    closed: watch::Sender<bool>,
}

impl SseTransport {
    pub fn new(session_id: &str, endpoint: &str) -> Self {
        let (outbound, inbox) = mpsc::channel(OUTBOUND_CAPACITY);
        let (closed, _) = watch::channel(false);
        Self {
            session_id: session_id.to_string(),
            message_url: format!(
                "/{}/message?sessionId={}",
                urlencoding::encode(endpoint),
                session_id
            ),
            upstream: OnceLock::new(),
            outbound,
            inbox: Mutex::new(Some(inbox)),
            closed,
        }
    }

    /// URL the client posts its messages to
    pub fn message_url(&self) -> &str {
        &self.message_url
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

    async fn open_stream(
        &self,
        upstream: &Arc<dyn UpstreamServer>,
    ) -> Result<EventStream, GatewayError> {
        let inbox = self.inbox.lock().await.take().ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "event stream for session '{}' is already attached",
                self.session_id
            ))
        })?;

        let mut closed = self.closed.subscribe();
        let replies = ReceiverStream::new(inbox)
            .map(|reply| TransportEvent::message(&reply))
            .take_until(async move {
                loop {
                    let is_closed = *closed.borrow_and_update();
                    if is_closed || closed.changed().await.is_err() {
                        break;
                    }
                }
            });
        let notifications = notification_stream(
            self.session_id.clone(),
            upstream.subscribe(),
            self.closed.subscribe(),
        );

        let greeting = futures::stream::once(futures::future::ready(TransportEvent::endpoint(
            self.message_url.clone(),
        )));

        Ok(greeting
            .chain(futures::stream::select(replies, notifications))
            .boxed())
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
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
            TransportRequest::Listen => Ok(TransportResponse::Stream(
                self.open_stream(upstream).await?,
            )),
            TransportRequest::Message(message) => {
                let replies = forward(upstream.as_ref(), &self.session_id, message).await?;
                for reply in replies {
                    if self.outbound.send(reply).await.is_err() {
                        tracing::warn!(
                            session_id = %self.session_id,
                            "Event stream gone; dropping reply"
                        );
                    }
                }
                Ok(TransportResponse::Accepted)
            }
        }
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mocks::EchoServer;
    use serde_json::json;

    async fn connected() -> (SseTransport, Arc<EchoServer>) {
        let server = Arc::new(EchoServer::new());
        let transport = SseTransport::new("s1", "weather");
        transport.connect(server.clone()).await.unwrap();
        (transport, server)
    }

    async fn listen(transport: &SseTransport) -> EventStream {
        match transport.dispatch(TransportRequest::Listen).await.unwrap() {
            TransportResponse::Stream(stream) => stream,
            other => panic!("expected a stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_starts_with_endpoint_event() {
        let (transport, _) = connected().await;
        let mut stream = listen(&transport).await;

        let first = stream.next().await.unwrap();
        assert_eq!(first.event, "endpoint");
        assert_eq!(first.data, "/weather/message?sessionId=s1");
    }

    #[tokio::test]
    async fn test_replies_travel_on_the_stream() {
        let (transport, _) = connected().await;
        let mut stream = listen(&transport).await;
        stream.next().await.unwrap();

        let response = transport
            .dispatch(TransportRequest::Message(
                json!({"jsonrpc": "2.0", "id": 9, "method": "tools/list"}),
            ))
            .await
            .unwrap();
        assert!(matches!(response, TransportResponse::Accepted));

        let event = stream.next().await.unwrap();
        assert_eq!(event.event, "message");
        let reply: Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(reply["id"], 9);
    }

    #[tokio::test]
    async fn test_notifications_travel_on_the_stream() {
        let (transport, server) = connected().await;
        let mut stream = listen(&transport).await;
        stream.next().await.unwrap();

        server.notify(json!({"jsonrpc": "2.0", "method": "resources/updated"}));
        let event = stream.next().await.unwrap();
        assert!(event.data.contains("resources/updated"));
    }

    #[tokio::test]
    async fn test_second_listen_is_rejected() {
        let (transport, _) = connected().await;
        let _stream = listen(&transport).await;
        let err = transport
            .dispatch(TransportRequest::Listen)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (transport, _) = connected().await;
        let mut stream = listen(&transport).await;
        stream.next().await.unwrap();

        transport.close().await;
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_message_url_encodes_endpoint() {
        let transport = SseTransport::new("abc", "my endpoint");
        assert_eq!(transport.message_url(), "/my%20endpoint/message?sessionId=abc");
    }
}
