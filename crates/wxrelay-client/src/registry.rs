//! Instance registry: one lazily-built client per configured instance.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::info;
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{ClientError, Result};
use crate::{DEFAULT_TIMEOUT_SECS, WxApiClient};

/// Configuration of one remote instance.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    /// Opaque unique id; referenced by listeners, rules and messages.
    pub instance_id: String,
    /// Display name for logs and the status snapshot.
    #[serde(default)]
    pub name: String,
    /// Daemon base URL, e.g. `http://10.0.0.5:8080`.
    pub base_url: String,
    /// `X-API-Key` value.
    pub api_key: SecretString,
    /// Disabled instances keep their config but are never polled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

const fn default_enabled() -> bool {
    true
}

const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Owns the configured instances and their clients.
///
/// Clients are built on first use and shared afterwards; each client
/// serialises its own requests, so per-instance ordering holds while
/// distinct instances are polled in parallel.
pub struct InstanceRegistry {
    configs: Vec<InstanceConfig>,
    clients: DashMap<String, Arc<WxApiClient>>,
    last_seen: DashMap<String, i64>,
}

impl InstanceRegistry {
    /// Builds the registry from configured instances.
    #[must_use]
    pub fn new(configs: Vec<InstanceConfig>) -> Self {
        Self {
            configs,
            clients: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// Ids of all enabled instances, in configuration order.
    #[must_use]
    pub fn instance_ids(&self) -> Vec<String> {
        self.configs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.instance_id.clone())
            .collect()
    }

    /// The client for `instance_id`, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnknownInstance`] for unconfigured or disabled
    /// ids, or a configuration error if the client cannot be built.
    pub fn client(&self, instance_id: &str) -> Result<Arc<WxApiClient>> {
        if let Some(client) = self.clients.get(instance_id) {
            return Ok(Arc::clone(&client));
        }

        let config = self
            .configs
            .iter()
            .find(|c| c.enabled && c.instance_id == instance_id)
            .ok_or_else(|| ClientError::UnknownInstance(instance_id.to_string()))?;

        // The entry holds the shard lock, so two racing callers cannot end
        // up with distinct clients (which would break per-instance request
        // serialisation).
        match self.clients.entry(instance_id.to_string()) {
            Entry::Occupied(existing) => Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let client = Arc::new(WxApiClient::new(
                    &config.base_url,
                    config.api_key.clone(),
                    config.timeout_seconds,
                )?);
                info!("built client for instance {instance_id} ({})", config.base_url);
                slot.insert(Arc::clone(&client));
                Ok(client)
            }
        }
    }

    /// Records a successful exchange with the instance.
    pub fn mark_seen(&self, instance_id: &str, now: i64) {
        self.last_seen.insert(instance_id.to_string(), now);
    }

    /// Unix timestamp of the last successful exchange, if any.
    #[must_use]
    pub fn last_seen(&self, instance_id: &str) -> Option<i64> {
        self.last_seen.get(instance_id).map(|entry| *entry)
    }
}
