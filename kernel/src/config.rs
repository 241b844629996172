// Admin Node Configuration
//
// Built once at startup (from JSON or the defaults) and passed to each
// component that needs it. There is no process-wide mutable state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admin::{ProtocolVersion, CURRENT_PROTOCOL_VERSION};
use crate::cluster::NodeAddress;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the routing client retries while the coordinator is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n * backoff_ms`.
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 50,
        }
    }
}

/// Configuration of one admin node, loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Resource id used in the plan state log.
    pub node_name: String,
    /// Cluster-unique node number; part of every plan id this node assigns.
    pub node_id: u16,
    pub address: NodeAddress,
    /// Fail loudly on internal inconsistencies instead of logging them.
    pub test_mode: bool,
    /// Deltas retained per metadata instance; `None` keeps all of them.
    pub metadata_history_limit: Option<usize>,
    /// Finished plans kept queryable; older ones are forgotten together
    /// with their idempotency keys. `None` keeps all of them.
    pub plan_retention: Option<usize>,
    pub min_protocol_version: ProtocolVersion,
    pub client_retry: RetryPolicy,
}

impl AdminConfig {
    /// Built-in configuration used when no file is provided.
    pub fn default_config() -> Self {
        Self {
            node_name: "admin1".into(),
            node_id: 1,
            address: NodeAddress::new("localhost", 5000),
            test_mode: false,
            metadata_history_limit: Some(1000),
            plan_retention: Some(1000),
            min_protocol_version: ProtocolVersion(1),
            client_retry: RetryPolicy::default(),
        }
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node_name must not be empty".into()));
        }
        if self.metadata_history_limit == Some(0) {
            return Err(ConfigError::Invalid(
                "metadata_history_limit must be positive".into(),
            ));
        }
        if self.plan_retention == Some(0) {
            return Err(ConfigError::Invalid("plan_retention must be positive".into()));
        }
        if self.min_protocol_version > CURRENT_PROTOCOL_VERSION {
            return Err(ConfigError::Invalid(format!(
                "min_protocol_version {} is newer than {}",
                self.min_protocol_version, CURRENT_PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self::default_config()
    }
}
