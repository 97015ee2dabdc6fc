//! Request routing: endpoint resolution, the authentication gate, and the
//! mapping from inbound verbs onto Begin / Continue / End.

use crate::auth::{AuthContext, Authenticator, StaticKeyValidator};
use crate::cache::InstanceCache;
use crate::config::GatewayConfig;
use crate::directory::{Endpoint, EndpointDirectory, StaticDirectory, resolve};
use crate::error::{GatewayError, GatewayResult};
use crate::session::{NoopCleanup, Session, SessionRegistry};
use crate::transport::{TransportKind, TransportRequest, TransportResponse};
use crate::upstream::UpstreamFactory;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Header carrying the session identifier
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Lifecycle operation selected for an inbound request
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Begin(TransportRequest),
    Continue(String, TransportRequest),
    End(String),
}

/// Session id from a request, if one was supplied
pub fn session_id_from(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Session id for operations that cannot begin a session
pub fn require_session_id(id: Option<&str>) -> Result<String, GatewayError> {
    id.filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or(GatewayError::MissingSessionIdentifier)
}

/// Result of routing one request
#[derive(Debug)]
pub enum Outcome {
    Begun {
        session: Arc<Session>,
        response: TransportResponse,
    },
    Continued {
        session_id: String,
        response: TransportResponse,
    },
    Ended {
        session_id: String,
    },
}

/// Credentials and query parameters of one inbound request
pub struct Inbound<'a> {
    pub headers: &'a HeaderMap,
    pub query: &'a HashMap<String, String>,
}

/// Entry point for every session-carrying request
pub struct Gateway {
    directory: Arc<dyn EndpointDirectory>,
    authenticator: Authenticator,
    sessions: Arc<SessionRegistry>,
}

impl Gateway {
    pub fn new(
        directory: Arc<dyn EndpointDirectory>,
        authenticator: Authenticator,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            directory,
            authenticator,
            sessions,
        }
    }

    /// Wire the built-in directory and key validator from configuration
    pub fn from_config(config: &GatewayConfig, factory: Arc<dyn UpstreamFactory>) -> Self {
        let directory = Arc::new(StaticDirectory::new(config.endpoints.iter().cloned()));
        let validator = Arc::new(StaticKeyValidator::new(config.api_keys.iter().cloned()));
        let sessions = Arc::new(SessionRegistry::new(
            InstanceCache::new(factory),
            Arc::new(NoopCleanup),
        ));
        Self::new(directory, Authenticator::new(validator), sessions)
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Resolve the endpoint and run the authentication gate
    pub async fn admit(
        &self,
        endpoint_name: &str,
        inbound: &Inbound<'_>,
    ) -> GatewayResult<(Endpoint, AuthContext)> {
        let endpoint = resolve(self.directory.as_ref(), endpoint_name).await?;
        let auth = self
            .authenticator
            .authenticate(&endpoint, inbound.headers, inbound.query)
            .await?;
        Ok((endpoint, auth))
    }

    /// Admit the request, then run the selected lifecycle operation
    pub async fn route(
        &self,
        endpoint_name: &str,
        kind: TransportKind,
        operation: Operation,
        inbound: &Inbound<'_>,
    ) -> GatewayResult<Outcome> {
        let (endpoint, auth) = self.admit(endpoint_name, inbound).await?;

        match operation {
            Operation::Begin(request) => {
                let (session, response) =
                    self.sessions.begin(&endpoint, kind, request, &auth).await?;
                Ok(Outcome::Begun { session, response })
            }
            Operation::Continue(session_id, request) => {
                let response = self
                    .sessions
                    .continue_session(&endpoint.name, &session_id, request)
                    .await?;
                Ok(Outcome::Continued {
                    session_id,
                    response,
                })
            }
            Operation::End(session_id) => {
                self.sessions.end_for(&endpoint.name, &session_id).await?;
                Ok(Outcome::Ended { session_id })
            }
        }
    }
}
