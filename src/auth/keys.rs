//! Static API key validator backed by configuration

use super::{CredentialValidator, Validation};
use crate::config::ApiKeyConfig;
use async_trait::async_trait;
use std::collections::HashMap;

/// Validates keys against an in-memory table loaded at startup
#[derive(Debug, Default)]
pub struct StaticKeyValidator {
    keys: HashMap<String, ApiKeyConfig>,
}

impl StaticKeyValidator {
    pub fn new(keys: impl IntoIterator<Item = ApiKeyConfig>) -> Self {
        let keys = keys
            .into_iter()
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl CredentialValidator for StaticKeyValidator {
    async fn validate(&self, key: &str) -> anyhow::Result<Validation> {
        match self.keys.get(key) {
            Some(entry) if entry.active => Ok(Validation {
                valid: true,
                identity: Some(entry.identity.clone()),
                key_id: Some(entry.key_id.clone()),
            }),
            Some(entry) => {
                tracing::debug!(key_id = %entry.key_id, "Inactive API key presented");
                Ok(Validation::invalid())
            }
            None => Ok(Validation::invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(key: &str, key_id: &str, active: bool) -> ApiKeyConfig {
        ApiKeyConfig {
            key: key.to_string(),
            key_id: key_id.to_string(),
            identity: "ops-team".to_string(),
            active,
        }
    }

    #[tokio::test]
    async fn test_active_key_is_valid() {
        let validator = StaticKeyValidator::new(vec![key("sk-live", "k1", true)]);
        let result = validator.validate("sk-live").await.unwrap();
        assert!(result.valid);
        assert_eq!(result.identity.as_deref(), Some("ops-team"));
        assert_eq!(result.key_id.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn test_inactive_key_is_invalid() {
        let validator = StaticKeyValidator::new(vec![key("sk-old", "k2", false)]);
        assert!(!validator.validate("sk-old").await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_unknown_key_is_invalid() {
        let validator = StaticKeyValidator::new(vec![key("sk-live", "k1", true)]);
        assert_eq!(validator.len(), 1);
        assert!(!validator.validate("sk-other").await.unwrap().valid);
    }
}
