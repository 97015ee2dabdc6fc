//! API response models

use crate::cache::CacheEntryStats;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub active_sessions: usize,
    pub upstream_instances: Vec<InstanceInfo>,
}

/// A cached upstream instance as reported by `/health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub endpoint: String,
    pub namespace_id: String,
    pub ref_count: usize,
}

impl From<CacheEntryStats> for InstanceInfo {
    fn from(stats: CacheEntryStats) -> Self {
        Self {
            endpoint: stats.endpoint,
            namespace_id: stats.namespace_id,
            ref_count: stats.ref_count,
        }
    }
}

/// Body returned when a session is ended
#[derive(Debug, Serialize, Deserialize)]
pub struct EndedResponse {
    pub session_id: String,
    pub status: String,
}
