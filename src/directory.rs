//! Endpoint directory: resolves published endpoint names to their policy

use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A published, routable endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub namespace_id: String,

    #[serde(default)]
    pub auth_required: bool,

    /// Whether `api_key`/`apikey` query parameters are accepted
    #[serde(default)]
    pub allow_query_param_auth: bool,
}

/// Read-only view of the endpoint records owned by the administrative side
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Endpoint>>;
}

/// Look up an endpoint for a single request.
pub async fn resolve(
    directory: &dyn EndpointDirectory,
    name: &str,
) -> Result<Endpoint, GatewayError> {
    directory
        .find_by_name(name)
        .await?
        .ok_or_else(|| GatewayError::EndpointNotFound(name.to_string()))
}

/// In-memory directory seeded from configuration
pub struct StaticDirectory {
    endpoints: RwLock<HashMap<String, Endpoint>>,
}

impl StaticDirectory {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.name.clone(), endpoint))
            .collect();

        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    /// Insert or replace an endpoint record
    pub async fn upsert(&self, endpoint: Endpoint) {
        tracing::info!(endpoint = %endpoint.name, "Endpoint record updated");
        self.endpoints
            .write()
            .await
            .insert(endpoint.name.clone(), endpoint);
    }

    pub async fn remove(&self, name: &str) -> Option<Endpoint> {
        self.endpoints.write().await.remove(name)
    }

    pub async fn count(&self) -> usize {
        self.endpoints.read().await.len()
    }
}

#[async_trait]
impl EndpointDirectory for StaticDirectory {
    async fn find_by_name(&self, name: &str) -> anyhow::Result<Option<Endpoint>> {
        Ok(self.endpoints.read().await.get(name).cloned())
    }
}
