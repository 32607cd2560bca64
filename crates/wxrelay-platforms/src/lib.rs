//! # wxrelay-platforms
//!
//! Pluggable service platforms: each kind turns an inbound WeChat message
//! into a reply. All workers implement the [`Platform`] trait; the
//! [`PlatformRegistry`] owns one worker per enabled platform row and can hot
//! reload itself from the store when the admin surface changes a row.
//!
//! Construction is cheap and does no network I/O; a malformed config makes
//! [`create_platform`] fail and the registry skips that platform while the
//! rest keep running. [`Platform::test_connection`] is the explicit network
//! probe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{error, info};

use wxrelay_common::{FileType, MessageSendMode, PlatformDescriptor, PlatformKind, PlatformReply};
use wxrelay_store::Store;

mod coze;
mod dify;
mod error;
mod keyword;
mod openai;
mod zhiweijz;

pub use coze::CozePlatform;
pub use dify::DifyPlatform;
pub use error::{PlatformError, Result};
pub use keyword::KeywordPlatform;
pub use openai::OpenAiPlatform;
pub use zhiweijz::ZhiweijzPlatform;

/// Longest upstream error-body excerpt carried in a [`PlatformError::Api`].
pub(crate) const ERROR_BODY_LIMIT: usize = 200;

/// Builds an [`PlatformError::Api`] with a truncated body excerpt.
pub(crate) fn api_error(status: u16, body: &str) -> PlatformError {
    PlatformError::Api {
        status,
        body: body.chars().take(ERROR_BODY_LIMIT).collect(),
    }
}

/// The input to one platform invocation.
///
/// Built by the delivery service after merging, rule resolution and
/// conversation lookup; the platform only ever sees this record.
#[derive(Debug, Clone)]
pub struct PlatformRequest {
    /// Originating instance.
    pub instance_id: String,
    /// Primary message id, used for content-addressed scratch names.
    pub message_id: String,
    /// Chat the message arrived in.
    pub chat_name: String,
    /// Raw sender name.
    pub sender: String,
    /// Sender's remark name, when present.
    pub sender_remark: Option<String>,
    /// Derived per-user id, see `wxrelay_common::derive_user_id`.
    pub user_id: String,
    /// Message text; bursts arrive already merged with newline separators.
    pub content: String,
    /// Stored conversation id for continuity, when one exists.
    pub conversation_id: Option<String>,
    /// Attachment path under the downloads dir, when the message carries one.
    pub file_path: Option<String>,
    /// Attachment kind.
    pub file_type: FileType,
}

/// Uniform contract all service platforms implement.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Unique platform id.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str;

    /// Platform kind.
    fn kind(&self) -> PlatformKind;

    /// How replies should be pushed to the chat.
    fn send_mode(&self) -> MessageSendMode;

    /// Full network probe of the upstream service.
    ///
    /// # Errors
    ///
    /// Returns the upstream or transport failure.
    async fn test_connection(&self) -> Result<serde_json::Value>;

    /// Turns one inbound message into a reply.
    ///
    /// # Errors
    ///
    /// Returns an error when the upstream call fails; a reply with
    /// `should_reply = false` is the non-error way to stay silent.
    async fn process_message(&self, request: &PlatformRequest) -> Result<PlatformReply>;

    /// Releases held resources. Called on registry reload and shutdown.
    async fn cleanup(&self) {}
}

/// Builds the worker for a platform row.
///
/// # Errors
///
/// Returns [`PlatformError::Config`] when the config blob does not parse for
/// the row's kind.
pub fn create_platform(descriptor: &PlatformDescriptor) -> Result<Arc<dyn Platform>> {
    let worker: Arc<dyn Platform> = match descriptor.kind {
        PlatformKind::Dify => Arc::new(DifyPlatform::from_descriptor(descriptor)?),
        PlatformKind::Openai => Arc::new(OpenAiPlatform::from_descriptor(descriptor)?),
        PlatformKind::Coze => Arc::new(CozePlatform::from_descriptor(descriptor)?),
        PlatformKind::Keyword => Arc::new(KeywordPlatform::from_descriptor(descriptor)?),
        PlatformKind::Zhiweijz => Arc::new(ZhiweijzPlatform::from_descriptor(descriptor)?),
    };
    Ok(worker)
}

/// Request counters for one platform.
#[derive(Default)]
struct PlatformStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of a platform's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PlatformStatsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

struct RegistryEntry {
    descriptor: PlatformDescriptor,
    worker: Arc<dyn Platform>,
}

/// Owns the live platform workers, keyed by platform id.
#[derive(Default)]
pub struct PlatformRegistry {
    entries: DashMap<String, RegistryEntry>,
    stats: DashMap<String, Arc<PlatformStats>>,
}

impl PlatformRegistry {
    /// Builds an empty registry; call [`PlatformRegistry::reload`] to
    /// populate it.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronises the workers with the enabled platform rows in the store.
    ///
    /// Added rows get new workers, changed rows are rebuilt, removed rows
    /// are dropped after cleanup. Rows whose config fails to parse are
    /// logged and skipped; conversation state lives in the conversation map
    /// and survives any reload.
    ///
    /// # Errors
    ///
    /// Returns the store failure when the platform list cannot be read.
    pub async fn reload(&self, store: &Store) -> wxrelay_store::Result<()> {
        let descriptors = store.list_platforms(true).await?;

        let keep: Vec<String> = descriptors.iter().map(|d| d.platform_id.clone()).collect();
        let stale: Vec<String> = self
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !keep.contains(id))
            .collect();
        for id in stale {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.worker.cleanup().await;
                info!("dropped platform {id}");
            }
        }

        for descriptor in descriptors {
            let unchanged = self
                .entries
                .get(&descriptor.platform_id)
                .is_some_and(|entry| {
                    entry.descriptor.kind == descriptor.kind
                        && entry.descriptor.config == descriptor.config
                        && entry.descriptor.name == descriptor.name
                });
            if unchanged {
                continue;
            }
            match create_platform(&descriptor) {
                Ok(worker) => {
                    let id = descriptor.platform_id.clone();
                    if let Some(previous) = self.entries.insert(
                        id.clone(),
                        RegistryEntry {
                            descriptor,
                            worker,
                        },
                    ) {
                        previous.worker.cleanup().await;
                        info!("rebuilt platform {id}");
                    } else {
                        info!("added platform {id}");
                    }
                }
                Err(e) => {
                    error!(
                        "platform {} refused to build: {e}",
                        descriptor.platform_id
                    );
                }
            }
        }
        Ok(())
    }

    /// The worker for `platform_id`, if one is live.
    #[must_use]
    pub fn get(&self, platform_id: &str) -> Option<Arc<dyn Platform>> {
        self.entries
            .get(platform_id)
            .map(|entry| Arc::clone(&entry.worker))
    }

    /// Ids of all live platforms.
    #[must_use]
    pub fn platform_ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Bumps the request counters for one platform.
    pub fn record_outcome(&self, platform_id: &str, success: bool) {
        let stats = self
            .stats
            .entry(platform_id.to_string())
            .or_default()
            .clone();
        stats.total.fetch_add(1, Ordering::Relaxed);
        if success {
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counter snapshot per platform id.
    #[must_use]
    pub fn stats_snapshot(&self) -> Vec<(String, PlatformStatsSnapshot)> {
        self.stats
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    PlatformStatsSnapshot {
                        total: entry.total.load(Ordering::Relaxed),
                        succeeded: entry.succeeded.load(Ordering::Relaxed),
                        failed: entry.failed.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    /// Cleans up every worker. Called on shutdown.
    pub async fn shutdown(&self) {
        let ids = self.platform_ids();
        for id in ids {
            if let Some((_, entry)) = self.entries.remove(&id) {
                entry.worker.cleanup().await;
            }
        }
    }
}
