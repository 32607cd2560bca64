//! Delivery service: claims pending messages, merges bursts, resolves
//! rules, invokes platforms and pushes the replies back.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use wxrelay_client::InstanceRegistry;
use wxrelay_common::{
    ConversationKey, DeliveryStatus, Message, MessageSendMode, PlatformKind, Rule, SkipReason,
    derive_user_id,
};
use wxrelay_platforms::{PlatformError, PlatformRegistry, PlatformRequest};
use wxrelay_store::{ConversationMap, Store, write_with_retry};

use crate::error::Result;
use crate::health::{ErrorRing, FatalSignal, PipelineCounters};
use crate::listener::unix_now;
use crate::rules::{RuleEngine, RuleResolution};

/// How long an idle worker sleeps before looking for work again.
const IDLE_BACKOFF: Duration = Duration::from_millis(500);

/// How many pending rows one claim pass inspects.
const CLAIM_BATCH: u32 = 16;

/// Tunables for the delivery pool.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Number of worker tasks.
    pub workers: u32,
    /// Burst-merge window in milliseconds.
    pub merge_window_ms: u64,
    /// Wall-clock deadline for platform calls.
    pub platform_timeout: Duration,
    /// Tighter deadline for the accounting platform.
    pub accounting_timeout: Duration,
    /// Where the remote daemon's relative attachment paths are rooted.
    pub downloads_dir: PathBuf,
    /// Characters per typing-mode chunk.
    pub typing_chunk_size: u32,
    /// Delay between typing-mode chunks in milliseconds.
    pub typing_chunk_delay_ms: u64,
}

/// The delivery worker pool.
pub struct DeliveryService {
    store: Store,
    conversations: Arc<ConversationMap>,
    platforms: Arc<PlatformRegistry>,
    instances: Arc<InstanceRegistry>,
    rules: Arc<RuleEngine>,
    settings: DeliverySettings,
    /// Per-`(instance, chat, sender)` claim guard. FIFO claiming plus this
    /// guard keeps replies for one tuple in source order across workers.
    in_flight: DashMap<(String, String, String), ()>,
    counters: Arc<PipelineCounters>,
    errors: Arc<ErrorRing>,
    fatal: Arc<FatalSignal>,
}

impl DeliveryService {
    /// Builds the service.
    #[must_use]
    pub fn new(
        store: Store,
        conversations: Arc<ConversationMap>,
        platforms: Arc<PlatformRegistry>,
        instances: Arc<InstanceRegistry>,
        rules: Arc<RuleEngine>,
        settings: DeliverySettings,
        counters: Arc<PipelineCounters>,
        errors: Arc<ErrorRing>,
        fatal: Arc<FatalSignal>,
    ) -> Self {
        Self {
            store,
            conversations,
            platforms,
            instances,
            rules,
            settings,
            in_flight: DashMap::new(),
            counters,
            errors,
            fatal,
        }
    }

    /// One worker loop; the supervisor spawns `settings.workers` of these.
    pub async fn run_worker(self: Arc<Self>, worker: u32, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker, "delivery worker started");
        loop {
            tokio::select! {
                claimed = self.claim_next() => {
                    match claimed {
                        Ok(Some(message)) => {
                            let tuple = tuple_key(&message);
                            if let Err(e) = self.process(message).await {
                                warn!(worker, error = %e, "delivery iteration failed");
                                self.errors.push("delivery", e.to_string(), unix_now());
                                if e.is_store_fatal() {
                                    self.fatal.raise(e.to_string());
                                    break;
                                }
                            }
                            self.in_flight.remove(&tuple);
                        }
                        Ok(None) => tokio::time::sleep(IDLE_BACKOFF).await,
                        Err(e) => {
                            warn!(worker, error = %e, "claim failed");
                            self.errors.push("delivery", e.to_string(), unix_now());
                            if e.is_store_fatal() {
                                self.fatal.raise(e.to_string());
                                break;
                            }
                            tokio::time::sleep(IDLE_BACKOFF).await;
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!(worker, "delivery worker stopped");
    }

    /// Claims the oldest pending message whose tuple is not already being
    /// processed by another worker.
    async fn claim_next(&self) -> Result<Option<Message>> {
        let candidates = self.store.list_pending(CLAIM_BATCH).await?;
        for candidate in candidates {
            let tuple = tuple_key(&candidate);
            if self.in_flight.contains_key(&tuple) {
                continue;
            }
            // Reserve the tuple before the row so a racing worker backs off.
            if self.in_flight.insert(tuple.clone(), ()).is_some() {
                continue;
            }
            let claimed = self
                .store
                .claim_for_delivery(candidate.instance_id.clone(), candidate.message_id.clone())
                .await;
            match claimed {
                Ok(true) => return Ok(Some(candidate)),
                Ok(false) => {
                    self.in_flight.remove(&tuple);
                }
                Err(e) => {
                    self.in_flight.remove(&tuple);
                    return Err(e.into());
                }
            }
        }
        Ok(None)
    }

    /// Runs the full delivery pipeline for one claimed message.
    async fn process(&self, mut message: Message) -> Result<()> {
        let now = unix_now();

        // Absorb the burst before anything else looks at the content.
        let content = self.merge_burst(&mut message, now).await?;

        // Resolution runs against the merged content so the @-filter sees
        // exactly what the platform would.
        let rule = match self
            .rules
            .resolve_detailed(&message.instance_id, &message.chat_name, &content)
        {
            RuleResolution::Matched(rule) => rule,
            RuleResolution::MissedMention => {
                return self.skip(&message, SkipReason::NotAt, now).await;
            }
            RuleResolution::NoRule => {
                debug!(message_id = %message.message_id, "no rule matched");
                return self.skip(&message, SkipReason::NoRule, now).await;
            }
        };

        let Some(platform) = self.platforms.get(&rule.platform_id) else {
            warn!(platform_id = %rule.platform_id, "rule points at a dead platform");
            return self
                .fail(&message, &rule.platform_id, "platform not available", now)
                .await;
        };

        let user_id = derive_user_id(
            &message.chat_name,
            &message.sender,
            message.sender_remark.as_deref(),
        );
        let key = ConversationKey::new(
            message.instance_id.clone(),
            message.chat_name.clone(),
            user_id.clone(),
            rule.platform_id.clone(),
        );
        let conversation_id = self.conversations.get(&key).await?;

        let request = PlatformRequest {
            instance_id: message.instance_id.clone(),
            message_id: message.message_id.clone(),
            chat_name: message.chat_name.clone(),
            sender: message.sender.clone(),
            sender_remark: message.sender_remark.clone(),
            user_id,
            content,
            conversation_id,
            // Voice and video are not uploadable upstream; only image/file
            // attachments travel with the request.
            file_path: message
                .has_attachment()
                .then(|| message.local_file_path.as_ref())
                .flatten()
                .map(|path| self.settings.downloads_dir.join(path).to_string_lossy().into_owned()),
            file_type: message.file_type,
        };

        let timeout = if platform.kind() == PlatformKind::Zhiweijz {
            self.settings.accounting_timeout
        } else {
            self.settings.platform_timeout
        };

        let outcome = tokio::time::timeout(timeout, platform.process_message(&request)).await;
        let reply = match outcome {
            Err(_) => {
                self.platforms.record_outcome(&rule.platform_id, false);
                return self
                    .fail(
                        &message,
                        &rule.platform_id,
                        &format!("platform call timed out after {}s", timeout.as_secs()),
                        now,
                    )
                    .await;
            }
            Ok(Err(e)) => {
                self.platforms.record_outcome(&rule.platform_id, false);
                if let PlatformError::SessionInvalid { conversation_id } = &e {
                    // Drop the stale mapping; the next inbound message
                    // starts a fresh session. No retry in this cycle.
                    self.invalidate_conversation(&message, &key, conversation_id)
                        .await?;
                }
                return self.fail(&message, &rule.platform_id, &e.to_string(), now).await;
            }
            Ok(Ok(reply)) => reply,
        };
        self.platforms.record_outcome(&rule.platform_id, true);

        if let Some(stale) = &reply.stale_conversation_id {
            self.invalidate_conversation(&message, &key, stale).await?;
        }
        if let Some(new_id) = &reply.conversation_id {
            self.conversations.put(key.clone(), new_id.clone(), now).await?;
        }

        if !reply.should_reply || reply.content.trim().is_empty() {
            debug!(message_id = %message.message_id, "platform declined to reply");
            return self.skip(&message, SkipReason::PlatformDeclined, now).await;
        }

        match self.send_reply(&message, &rule, platform.send_mode(), &reply.content).await {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                write_with_retry("record delivery", || {
                    self.store.record_delivery(
                        message.instance_id.clone(),
                        message.message_id.clone(),
                        DeliveryStatus::Delivered,
                        Some(rule.platform_id.clone()),
                        Some(reply.content.clone()),
                        unix_now(),
                    )
                })
                .await?;
                info!(
                    message_id = %message.message_id,
                    platform_id = %rule.platform_id,
                    "reply delivered"
                );
                Ok(())
            }
            Err(e) => {
                self.fail(&message, &rule.platform_id, &format!("send failed: {e}"), now)
                    .await
            }
        }
    }

    /// Claims same-tuple pending peers inside the merge window and returns
    /// the combined content, oldest first.
    async fn merge_burst(&self, message: &mut Message, now: i64) -> Result<String> {
        let window_ms = self.settings.merge_window_ms;
        if window_ms == 0 {
            return Ok(message.content.clone());
        }
        let window_secs = i64::try_from(window_ms.div_ceil(1000)).unwrap_or(i64::MAX);
        let peers = self.store.claim_merge_peers(message, window_secs).await?;
        if peers.is_empty() {
            return Ok(message.content.clone());
        }

        let peer_ids: Vec<String> = peers.iter().map(|p| p.message_id.clone()).collect();
        write_with_retry("record merge", || {
            self.store.record_merge(
                message.instance_id.clone(),
                message.message_id.clone(),
                peer_ids.clone(),
                now,
            )
        })
        .await?;
        self.counters
            .skipped
            .fetch_add(peer_ids.len() as u64, Ordering::Relaxed);

        let mut combined = vec![message.content.clone()];
        combined.extend(peers.into_iter().map(|p| p.content));
        message.merged = true;
        message.merged_count = i64::try_from(peer_ids.len()).unwrap_or(0) + 1;
        message.merged_ids = peer_ids;
        info!(
            message_id = %message.message_id,
            absorbed = message.merged_count - 1,
            "burst merged"
        );
        Ok(combined.join("\n"))
    }

    /// Composes and pushes the outgoing reply.
    async fn send_reply(
        &self,
        message: &Message,
        rule: &Rule,
        send_mode: MessageSendMode,
        content: &str,
    ) -> Result<()> {
        let client = self.instances.client(&message.instance_id)?;

        let mut text = content.to_string();
        let mut at_list: Vec<String> = Vec::new();
        if rule.reply_at_sender && message.is_group_message() {
            let sender = message.effective_sender().to_string();
            text = format!("@{sender} {text}");
            at_list.push(sender);
        }

        match send_mode {
            MessageSendMode::Normal => {
                client.send(&message.chat_name, &text, &at_list).await?;
            }
            MessageSendMode::Typing => {
                client
                    .send_typing(
                        &message.chat_name,
                        &text,
                        self.settings.typing_chunk_size,
                        self.settings.typing_chunk_delay_ms,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn skip(&self, message: &Message, reason: SkipReason, now: i64) -> Result<()> {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        write_with_retry("mark skipped", || {
            self.store.mark_skipped(
                message.instance_id.clone(),
                message.message_id.clone(),
                reason,
                now,
            )
        })
        .await?;
        Ok(())
    }

    async fn fail(
        &self,
        message: &Message,
        platform_id: &str,
        summary: &str,
        now: i64,
    ) -> Result<()> {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.errors.push(
            "delivery",
            format!("{}: {summary}", message.message_id),
            now,
        );
        write_with_retry("record failure", || {
            self.store.record_delivery(
                message.instance_id.clone(),
                message.message_id.clone(),
                DeliveryStatus::Failed,
                Some(platform_id.to_string()),
                Some(summary.to_string()),
                now,
            )
        })
        .await?;
        Ok(())
    }

    /// Drops the stale conversation mapping and clears the legacy
    /// per-listener slot when it carries the same id.
    async fn invalidate_conversation(
        &self,
        message: &Message,
        key: &ConversationKey,
        stale_id: &str,
    ) -> Result<()> {
        info!(
            message_id = %message.message_id,
            conversation_id = %stale_id,
            "invalidating stale conversation"
        );
        self.conversations.delete(key).await?;
        let listener = self
            .store
            .get_listener(message.instance_id.clone(), message.chat_name.clone())
            .await?;
        if listener.is_some_and(|l| l.conversation_id.as_deref() == Some(stale_id)) {
            self.store
                .set_listener_conversation(
                    message.instance_id.clone(),
                    message.chat_name.clone(),
                    None,
                )
                .await?;
        }
        Ok(())
    }
}

fn tuple_key(message: &Message) -> (String, String, String) {
    (
        message.instance_id.clone(),
        message.chat_name.clone(),
        message.sender.clone(),
    )
}
