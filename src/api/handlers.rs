//! API request handlers

use super::models::{EndedResponse, HealthResponse, InstanceInfo};
use super::routes::AppState;
use crate::error::GatewayError;
use crate::gateway::{
    Inbound, Operation, Outcome, SESSION_HEADER, require_session_id, session_id_from,
};
use crate::session::SessionRegistry;
use crate::transport::{EventStream, TransportKind, TransportRequest, TransportResponse};
use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

/// Query parameter naming the session on the push-stream message route
const SESSION_QUERY_PARAM: &str = "sessionId";

/// GET /health - Gateway health check
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let sessions = state.gateway.sessions();
    let upstream_instances = sessions
        .cache()
        .stats()
        .await
        .into_iter()
        .map(InstanceInfo::from)
        .collect();

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
            active_sessions: sessions.count(),
            upstream_instances,
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// POST /{endpoint}/mcp - Begin without a session header, Continue with one
pub async fn streamable_post(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let inbound = Inbound {
        headers: &headers,
        query: &query,
    };
    let message = message_body(&state, &endpoint, &inbound, body).await?;
    let request = TransportRequest::Message(message);
    let operation = match session_id_from(&headers) {
        None => Operation::Begin(request),
        Some(id) => Operation::Continue(id.to_string(), request),
    };

    let outcome = state
        .gateway
        .route(&endpoint, TransportKind::StreamableHttp, operation, &inbound)
        .await?;
    Ok(state.respond(outcome, false))
}

/// GET /{endpoint}/mcp - Open the server-to-client stream of a session
pub async fn streamable_get(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let session_id = require_session_id(session_id_from(&headers))?;

    let outcome = state
        .gateway
        .route(
            &endpoint,
            TransportKind::StreamableHttp,
            Operation::Continue(session_id, TransportRequest::Listen),
            &Inbound {
                headers: &headers,
                query: &query,
            },
        )
        .await?;
    Ok(state.respond(outcome, false))
}

/// DELETE /{endpoint}/mcp - End a session
pub async fn streamable_delete(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let session_id = require_session_id(session_id_from(&headers))?;

    let outcome = state
        .gateway
        .route(
            &endpoint,
            TransportKind::StreamableHttp,
            Operation::End(session_id),
            &Inbound {
                headers: &headers,
                query: &query,
            },
        )
        .await?;
    Ok(state.respond(outcome, false))
}

/// GET /{endpoint}/sse - Begin a push-stream session
pub async fn sse_connect(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let outcome = state
        .gateway
        .route(
            &endpoint,
            TransportKind::Sse,
            Operation::Begin(TransportRequest::Listen),
            &Inbound {
                headers: &headers,
                query: &query,
            },
        )
        .await?;
    Ok(state.respond(outcome, true))
}

/// POST /{endpoint}/message?sessionId= - Continue a push-stream session
pub async fn sse_message(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let session_id = require_session_id(
        query
            .get(SESSION_QUERY_PARAM)
            .map(String::as_str)
            .or_else(|| session_id_from(&headers)),
    )?;
    let inbound = Inbound {
        headers: &headers,
        query: &query,
    };
    let message = message_body(&state, &endpoint, &inbound, body).await?;

    let outcome = state
        .gateway
        .route(
            &endpoint,
            TransportKind::Sse,
            Operation::Continue(session_id, TransportRequest::Message(message)),
            &inbound,
        )
        .await?;
    Ok(state.respond(outcome, false))
}

/// JSON body of a message route.
///
/// A rejected body surfaces as `InvalidRequest`, but only once the endpoint
/// resolves and the caller is admitted, so 404 and 401 keep precedence.
async fn message_body(
    state: &AppState,
    endpoint: &str,
    inbound: &Inbound<'_>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Value, GatewayError> {
    match body {
        Ok(Json(message)) => Ok(message),
        Err(rejection) => {
            state.gateway.admit(endpoint, inbound).await?;
            Err(GatewayError::InvalidRequest(rejection.body_text()))
        }
    }
}

impl AppState {
    /// Turn a routing outcome into an HTTP response.
    ///
    /// With `end_on_disconnect`, a stream produced by Begin ends its session
    /// when the client goes away.
    fn respond(&self, outcome: Outcome, end_on_disconnect: bool) -> Response {
        match outcome {
            Outcome::Begun { session, response } => {
                let sessions = end_on_disconnect.then(|| self.gateway.sessions().clone());
                with_session_header(
                    transport_response(response, self.sse_keep_alive, &session.id, sessions),
                    &session.id,
                )
            }
            Outcome::Continued {
                session_id,
                response,
            } => with_session_header(
                transport_response(response, self.sse_keep_alive, &session_id, None),
                &session_id,
            ),
            Outcome::Ended { session_id } => (
                StatusCode::OK,
                Json(EndedResponse {
                    session_id,
                    status: "ended".to_string(),
                }),
            )
                .into_response(),
        }
    }
}

fn transport_response(
    response: TransportResponse,
    keep_alive: Duration,
    session_id: &str,
    end_on_disconnect: Option<Arc<SessionRegistry>>,
) -> Response {
    match response {
        TransportResponse::Reply(reply) => (StatusCode::OK, Json(reply)).into_response(),
        TransportResponse::Accepted => StatusCode::ACCEPTED.into_response(),
        TransportResponse::Stream(events) => {
            let guard = end_on_disconnect.map(|sessions| EndOnDrop {
                sessions,
                session_id: session_id.to_string(),
            });
            Sse::new(sse_events(events, guard))
                .keep_alive(KeepAlive::new().interval(keep_alive))
                .into_response()
        }
    }
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    match HeaderValue::from_str(session_id) {
        Ok(value) => {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        Err(e) => tracing::warn!(
            session_id = %session_id,
            error = %e,
            "Session id is not a valid header value"
        ),
    }
    response
}

fn sse_events(
    events: EventStream,
    guard: Option<EndOnDrop>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    async_stream::stream! {
        let _guard = guard;
        for await event in events {
            yield Ok(Event::default().event(event.event).data(event.data));
        }
    }
}

/// Ends a push-stream session once its event stream is dropped
struct EndOnDrop {
    sessions: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for EndOnDrop {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session_id = %session_id, "Event stream dropped outside a runtime");
            return;
        };

        runtime.spawn(async move {
            match sessions.end(&session_id).await {
                Ok(()) => tracing::debug!(session_id = %session_id, "Session ended on disconnect"),
                // Already ended by DELETE, the reaper or shutdown
                Err(GatewayError::SessionNotFound(_)) => {}
                Err(e) => tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to end session on disconnect"
                ),
            }
        });
    }
}
