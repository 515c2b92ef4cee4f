use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path, time::Duration};

use crate::error::ConfigError;

pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:4000/callback";
pub const DEFAULT_CALLBACK_PATH: &str = "/callback";
/// Enforced default. Some documentation quotes 5000ms; this value wins.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 50_000;

/// `subscriptions.callback` block of the gateway config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    /// Public address of the callback endpoint, as reachable by subgraphs.
    pub public_url: String,
    /// Path the gateway serves callbacks on.
    pub path: String,
    /// Liveness contract in milliseconds.
    pub heartbeat_interval: u64,
    /// Header templates sent on the initiating request.
    pub headers: HashMap<String, String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        CallbackConfig {
            public_url: DEFAULT_PUBLIC_URL.to_string(),
            path: DEFAULT_CALLBACK_PATH.to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_MS,
            headers: HashMap::new(),
        }
    }
}

impl CallbackConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn callback_url(&self, subscription_id: &str) -> String {
        format!("{}/{}", self.public_url.trim_end_matches('/'), subscription_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubgraphConfig {
    pub name: String,
    pub routing_url: String,
}

impl Default for SubgraphConfig {
    fn default() -> Self {
        SubgraphConfig {
            name: "subgraph".to_string(),
            routing_url: "http://localhost:4001/graphql".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    pub callback: CallbackConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub subgraph: SubgraphConfig,
    pub subscriptions: SubscriptionsConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            port: 4000,
            subgraph: SubgraphConfig::default(),
            subscriptions: SubscriptionsConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        tracing::info!(path = %config_path.display(), "loading gateway config");
        let config_contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let config: GatewayConfig =
            serde_yaml::from_str(&config_contents).map_err(|source| ConfigError::Parse {
                path: config_path.to_path_buf(),
                source,
            })?;
        config.subscriptions.callback.validate()?;
        Ok(config)
    }
}
