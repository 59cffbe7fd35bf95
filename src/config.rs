use crate::{constants, Result};
use serde::{Deserialize, Serialize};
use std::env;
use uuid::Uuid;

/// Runtime configuration for one orchestrator instance.
///
/// Loaded from environment variables (with `.env` support) or built
/// programmatically via [`Config::for_gateway`]. Configuration file
/// parsing is left to outer collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier of the gateway this core instance runs on.
    pub gateway_id: String,
    /// Shared secret for HMAC envelope signatures. When absent a random
    /// 32-byte secret is generated at construction.
    pub shared_secret: Option<String>,
    /// Interval between terminal-task cleanup passes.
    pub cleanup_interval_secs: u64,
    /// Interval between local-agent discovery announcements.
    pub announce_interval_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found, using process environment"),
        }

        let gateway_id = env::var("MESH_GATEWAY_ID").map_err(|_| {
            crate::MeshError::ConfigurationError(
                "MESH_GATEWAY_ID environment variable is required".to_string(),
            )
        })?;

        if gateway_id.trim().is_empty() {
            return Err(crate::MeshError::ConfigurationError(
                "MESH_GATEWAY_ID cannot be empty".to_string(),
            ));
        }

        let shared_secret = env::var("MESH_SHARED_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let cleanup_interval_secs = env::var("MESH_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(constants::CLEANUP_INTERVAL_SECS);

        let announce_interval_secs = env::var("MESH_ANNOUNCE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(constants::ANNOUNCE_INTERVAL_SECS);

        Ok(Self {
            gateway_id,
            shared_secret,
            cleanup_interval_secs,
            announce_interval_secs,
        })
    }

    /// Configuration with defaults for the given gateway id.
    pub fn for_gateway(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            shared_secret: None,
            cleanup_interval_secs: constants::CLEANUP_INTERVAL_SECS,
            announce_interval_secs: constants::ANNOUNCE_INTERVAL_SECS,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::for_gateway(format!("gateway-{}", Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_gateway_defaults() {
        let config = Config::for_gateway("gw-test");
        assert_eq!(config.gateway_id, "gw-test");
        assert!(config.shared_secret.is_none());
        assert_eq!(
            config.cleanup_interval_secs,
            constants::CLEANUP_INTERVAL_SECS
        );
        assert_eq!(
            config.announce_interval_secs,
            constants::ANNOUNCE_INTERVAL_SECS
        );
    }

    #[test]
    fn test_default_gateway_ids_are_unique() {
        let a = Config::default();
        let b = Config::default();
        assert_ne!(a.gateway_id, b.gateway_id);
    }
}
