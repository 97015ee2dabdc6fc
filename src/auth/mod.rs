//! Per-endpoint API key authentication

use crate::directory::Endpoint;
use crate::error::GatewayError;
use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub mod keys;

pub use keys::StaticKeyValidator;

/// Header carrying a raw API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameters accepted when an endpoint allows query-string credentials
pub const QUERY_PARAM_NAMES: [&str; 2] = ["api_key", "apikey"];

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required. Accepted methods: {accepted}")]
    Required { accepted: String },

    #[error("Invalid or inactive credential")]
    Invalid,

    #[error("Credential validator error: {0}")]
    Validator(#[source] anyhow::Error),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Required { accepted } => GatewayError::AuthenticationRequired { accepted },
            AuthError::Invalid => GatewayError::AuthenticationInvalid,
            AuthError::Validator(e) => GatewayError::InternalFailure(e),
        }
    }
}

/// Where a credential was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    BearerHeader,
    ApiKeyHeader,
    QueryParam,
}

/// Identity attached to a request for auditing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub identity: Option<String>,
    pub key_id: Option<String>,
}

/// Outcome of checking a key with the validator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub identity: Option<String>,
    pub key_id: Option<String>,
}

impl Validation {
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Checks opaque API keys against the administrative key store
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate(&self, key: &str) -> anyhow::Result<Validation>;
}

/// Gates requests according to each endpoint's policy
#[derive(Clone)]
pub struct Authenticator {
    validator: Arc<dyn CredentialValidator>,
}

impl Authenticator {
    pub fn new(validator: Arc<dyn CredentialValidator>) -> Self {
        Self { validator }
    }

    /// Authenticate a request against the endpoint's policy
    pub async fn authenticate(
        &self,
        endpoint: &Endpoint,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
    ) -> Result<AuthContext, AuthError> {
        if !endpoint.auth_required {
            return Ok(AuthContext::default());
        }

        let Some((key, source)) =
            extract_credential(headers, query, endpoint.allow_query_param_auth)
        else {
            tracing::debug!(endpoint = %endpoint.name, "No credential presented");
            crate::metrics::record_auth_failure(&endpoint.name, "required");
            return Err(AuthError::Required {
                accepted: accepted_methods(endpoint),
            });
        };

        let validation = self.validator.validate(key).await.map_err(|e| {
            crate::metrics::record_auth_failure(&endpoint.name, "validator_error");
            AuthError::Validator(e)
        })?;

        if !validation.valid {
            tracing::debug!(
                endpoint = %endpoint.name,
                source = ?source,
                "Credential rejected"
            );
            crate::metrics::record_auth_failure(&endpoint.name, "invalid");
            return Err(AuthError::Invalid);
        }

        Ok(AuthContext {
            identity: validation.identity,
            key_id: validation.key_id,
        })
    }
}

/// Find a candidate credential in priority order: bearer token, API key
/// header, then (only when allowed) the query string.
pub fn extract_credential<'a>(
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
    allow_query_param: bool,
) -> Option<(&'a str, CredentialSource)> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if let Some(token) = bearer {
        return Some((token, CredentialSource::BearerHeader));
    }

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty());
    if let Some(key) = api_key {
        return Some((key, CredentialSource::ApiKeyHeader));
    }

    if !allow_query_param {
        return None;
    }

    QUERY_PARAM_NAMES
        .iter()
        .filter_map(|name| query.get(*name))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .map(|key| (key, CredentialSource::QueryParam))
}

/// Human-readable list of the credential methods an endpoint accepts
pub fn accepted_methods(endpoint: &Endpoint) -> String {
    let mut methods = vec![
        "Authorization: Bearer <api-key> header".to_string(),
        "X-API-Key header".to_string(),
    ];
    if endpoint.allow_query_param_auth {
        methods.push("api_key or apikey query parameter".to_string());
    }
    methods.join(", ")
}
