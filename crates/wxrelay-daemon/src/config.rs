//! Daemon configuration.
//!
//! Loaded from `<data>/config.toml`. Platforms and delivery rules live in the
//! store (the admin surface maintains them); the config file carries the
//! instances, the tunables and the fixed-listener seed.
//!
//! ## Example Configuration
//!
//! ```toml
//! [settings]
//! poll_interval_seconds = 5
//! timeout_minutes = 30
//! delivery_workers = 4
//!
//! [[instances]]
//! instance_id = "desk-1"
//! name = "office desk"
//! base_url = "http://10.0.0.5:8080"
//! api_key = "wx-key-1"
//!
//! [[fixed_listeners]]
//! session_name = "ops group"
//! enabled = true
//! description = "always listen here"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use wxrelay_client::InstanceConfig;
use wxrelay_common::FixedListener;

use crate::error::{DaemonError, Result};

/// Database file name under the data dir.
const DB_FILE_NAME: &str = "wxauto_mgt.db";

/// Daemon configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Tunables.
    #[serde(default)]
    pub settings: Settings,

    /// Remote WeChat instances to poll.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Fixed-listener declarations, merged into the store at boot.
    #[serde(default)]
    pub fixed_listeners: Vec<FixedListener>,
}

/// Tunables with spec'd defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Main-window and per-listener poll cadence in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Idle minutes before an auto-added listener is inactivated.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    /// Cap on active listeners per instance.
    #[serde(default = "default_max_listeners")]
    pub max_listeners: u32,

    /// Size of the delivery worker pool.
    #[serde(default = "default_delivery_workers")]
    pub delivery_workers: u32,

    /// Burst-merge window in milliseconds.
    #[serde(default = "default_merge_window_ms")]
    pub merge_window_ms: u64,

    /// Wall-clock deadline for platform calls in seconds.
    #[serde(default = "default_platform_timeout")]
    pub platform_call_timeout_seconds: u64,

    /// Tighter deadline for the accounting platform.
    #[serde(default = "default_accounting_timeout")]
    pub accounting_call_timeout_seconds: u64,

    /// Days a conversation mapping may idle before the purge drops it.
    #[serde(default = "default_purge_days")]
    pub conversation_purge_days: u64,

    /// Data directory; defaults to the platform-local data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Attachment downloads directory; defaults to `<data>/downloads`.
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,

    /// Characters per chunk for typing-mode sends. The remote pacing
    /// contract is daemon-specific, hence a knob rather than a constant.
    #[serde(default = "default_typing_chunk_size")]
    pub typing_chunk_size: u32,

    /// Delay between typing-mode chunks in milliseconds.
    #[serde(default = "default_typing_chunk_delay")]
    pub typing_chunk_delay_ms: u64,

    /// Grace period for in-flight deliveries on shutdown, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            timeout_minutes: default_timeout_minutes(),
            max_listeners: default_max_listeners(),
            delivery_workers: default_delivery_workers(),
            merge_window_ms: default_merge_window_ms(),
            platform_call_timeout_seconds: default_platform_timeout(),
            accounting_call_timeout_seconds: default_accounting_timeout(),
            conversation_purge_days: default_purge_days(),
            data_dir: None,
            downloads_dir: None,
            typing_chunk_size: default_typing_chunk_size(),
            typing_chunk_delay_ms: default_typing_chunk_delay(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

const fn default_poll_interval() -> u64 {
    5
}

const fn default_timeout_minutes() -> u64 {
    30
}

const fn default_max_listeners() -> u32 {
    30
}

const fn default_delivery_workers() -> u32 {
    4
}

const fn default_merge_window_ms() -> u64 {
    1500
}

const fn default_platform_timeout() -> u64 {
    60
}

const fn default_accounting_timeout() -> u64 {
    30
}

const fn default_purge_days() -> u64 {
    30
}

const fn default_typing_chunk_size() -> u32 {
    8
}

const fn default_typing_chunk_delay() -> u64 {
    120
}

const fn default_shutdown_grace() -> u64 {
    10
}

impl DaemonConfig {
    /// Loads configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or does not parse.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Loads configuration from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, does not parse, or fails
    /// validation.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DaemonError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// The default configuration file path, `<data>/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error when the platform data dir cannot be determined.
    pub fn default_path() -> Result<PathBuf> {
        Ok(default_data_dir()?.join("config.toml"))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error on duplicate instance ids or zero-sized pools.
    pub fn validate(&self) -> Result<()> {
        if self.settings.delivery_workers == 0 {
            return Err(DaemonError::Config(
                "delivery_workers must be at least 1".to_string(),
            ));
        }
        if self.settings.poll_interval_seconds == 0 {
            return Err(DaemonError::Config(
                "poll_interval_seconds must be at least 1".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for instance in &self.instances {
            if !seen.insert(&instance.instance_id) {
                return Err(DaemonError::Config(format!(
                    "duplicate instance id '{}'",
                    instance.instance_id
                )));
            }
        }
        Ok(())
    }

    /// The effective data directory, created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be determined or created.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let dir = match &self.settings.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// The SQLite database path.
    ///
    /// # Errors
    ///
    /// Returns an error when the data dir is unavailable.
    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DB_FILE_NAME))
    }

    /// The attachment downloads directory, created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be determined or created.
    pub fn downloads_dir(&self) -> Result<PathBuf> {
        let dir = match &self.settings.downloads_dir {
            Some(dir) => dir.clone(),
            None => self.data_dir()?.join("downloads"),
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join("wxrelay"))
        .ok_or_else(|| DaemonError::Config("cannot determine data directory".to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sample_config_toml() -> &'static str {
        r#"
[settings]
poll_interval_seconds = 3
timeout_minutes = 15
max_listeners = 10
delivery_workers = 2
merge_window_ms = 2000

[[instances]]
instance_id = "desk-1"
name = "office desk"
base_url = "http://10.0.0.5:8080"
api_key = "wx-key-1"

[[instances]]
instance_id = "desk-2"
base_url = "http://10.0.0.6:8080"
api_key = "wx-key-2"
enabled = false

[[fixed_listeners]]
session_name = "ops group"
enabled = true
description = "always listen here"
        "#
    }

    #[test]
    fn parses_sample_config() {
        let config: DaemonConfig = toml::from_str(sample_config_toml()).unwrap();
        assert_eq!(config.settings.poll_interval_seconds, 3);
        assert_eq!(config.settings.merge_window_ms, 2000);
        assert_eq!(config.instances.len(), 2);
        assert!(!config.instances[1].enabled);
        assert_eq!(config.fixed_listeners.len(), 1);
        config.validate().unwrap();
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.settings.poll_interval_seconds, 5);
        assert_eq!(config.settings.timeout_minutes, 30);
        assert_eq!(config.settings.max_listeners, 30);
        assert_eq!(config.settings.delivery_workers, 4);
        assert_eq!(config.settings.merge_window_ms, 1500);
        assert_eq!(config.settings.platform_call_timeout_seconds, 60);
        assert_eq!(config.settings.accounting_call_timeout_seconds, 30);
        assert_eq!(config.settings.conversation_purge_days, 30);
        assert_eq!(config.settings.shutdown_grace_seconds, 10);
    }

    #[test]
    fn rejects_duplicate_instance_ids() {
        let toml = r#"
[[instances]]
instance_id = "desk-1"
base_url = "http://a:1"
api_key = "k"

[[instances]]
instance_id = "desk-1"
base_url = "http://b:2"
api_key = "k"
        "#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn rejects_zero_workers() {
        let toml = "[settings]\ndelivery_workers = 0\n";
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn load_from_missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = DaemonConfig::load_from(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[test]
    fn directories_derive_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!("[settings]\ndata_dir = {:?}\n", dir.path().join("wx"));
        let config: DaemonConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.db_path().unwrap().file_name().unwrap(), "wxauto_mgt.db");
        assert!(config.downloads_dir().unwrap().ends_with("downloads"));
    }
}
