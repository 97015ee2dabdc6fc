//! Error types for gateway responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the gateway can surface to a caller
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Endpoint '{0}' not found")]
    EndpointNotFound(String),

    #[error("Authentication required. Accepted methods: {accepted}")]
    AuthenticationRequired { accepted: String },

    #[error("Invalid or inactive credential")]
    AuthenticationInvalid,

    #[error("Missing or unknown session '{0}'")]
    SessionNotFound(String),

    #[error("Missing session identifier")]
    MissingSessionIdentifier,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to create upstream instance for endpoint '{endpoint}': {source}")]
    UpstreamCreationFailure {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Internal failure: {0}")]
    InternalFailure(#[from] anyhow::Error),
}

impl GatewayError {
    /// Short machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EndpointNotFound(_) => "endpoint_not_found",
            Self::AuthenticationRequired { .. } => "authentication_required",
            Self::AuthenticationInvalid => "authentication_invalid",
            Self::SessionNotFound(_) => "session_not_found",
            Self::MissingSessionIdentifier => "missing_session_identifier",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UpstreamCreationFailure { .. } => "upstream_creation_failure",
            Self::InternalFailure(_) => "internal_failure",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::EndpointNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::AuthenticationRequired { .. } | Self::AuthenticationInvalid => {
                StatusCode::UNAUTHORIZED
            }
            Self::MissingSessionIdentifier | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamCreationFailure { .. } | Self::InternalFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Server-side detail stays in the logs
        let message = match &self {
            Self::UpstreamCreationFailure { endpoint, source } => {
                tracing::error!(endpoint = %endpoint, error = ?source, "Upstream creation failed");
                "Failed to start upstream server".to_string()
            }
            Self::InternalFailure(err) => {
                tracing::error!(error = ?err, "Internal error");
                "Internal server error".to_string()
            }
            other => {
                tracing::debug!(kind = other.kind(), error = %other, "Request rejected");
                other.to_string()
            }
        };

        let body = Json(ErrorResponse {
            error: self.kind().to_string(),
            message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// JSON body returned for every error
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
