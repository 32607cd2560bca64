//! Message ingress: normalisation, filtering and deduplicated persistence.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, trace};
use uuid::Uuid;

use wxrelay_client::RemoteMessage;
use wxrelay_common::{FileType, NewMessage};
use wxrelay_store::{Store, write_with_retry};

use crate::error::Result;
use crate::health::PipelineCounters;

/// Converts raw remote messages into store rows.
pub struct MessageIngress {
    store: Store,
    counters: Arc<PipelineCounters>,
}

impl MessageIngress {
    /// Builds the ingress boundary.
    #[must_use]
    pub fn new(store: Store, counters: Arc<PipelineCounters>) -> Self {
        Self { store, counters }
    }

    /// Normalises and persists one raw message.
    ///
    /// Returns the normalised record when a new row was created, `None` for
    /// filtered messages and duplicates.
    ///
    /// # Errors
    ///
    /// Returns the store failure after the bounded write retry is exhausted.
    pub async fn ingest(
        &self,
        instance_id: &str,
        raw: RemoteMessage,
        now: i64,
    ) -> Result<Option<NewMessage>> {
        let message = normalise(instance_id, raw, now);
        if message.is_filtered() {
            trace!(message_id = %message.message_id, "dropped filtered message");
            return Ok(None);
        }

        let inserted = write_with_retry("insert message", || {
            self.store.insert_message(message.clone())
        })
        .await?;
        if inserted {
            self.counters.ingressed.fetch_add(1, Ordering::Relaxed);
            debug!(
                instance_id,
                message_id = %message.message_id,
                chat = %message.chat_name,
                "message ingested"
            );
            Ok(Some(message))
        } else {
            trace!(message_id = %message.message_id, "duplicate message ignored");
            Ok(None)
        }
    }
}

/// Builds the strict record from the remote's loose JSON.
fn normalise(instance_id: &str, raw: RemoteMessage, now: i64) -> NewMessage {
    let sender = raw.sender.unwrap_or_default().trim().to_string();
    let chat_name = raw.chat_name.unwrap_or_default().trim().to_string();
    let sender_remark = raw
        .sender_remark
        .map(|remark| remark.trim().to_string())
        .filter(|remark| !remark.is_empty());
    let file_type = raw
        .file_type
        .as_deref()
        .map(FileType::parse)
        .unwrap_or_default();

    NewMessage {
        instance_id: instance_id.to_string(),
        // Messages without a remote id still need a stable primary key.
        message_id: raw.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        chat_name,
        message_type: raw.message_type.unwrap_or_default().trim().to_string(),
        mtype: raw.mtype.unwrap_or_default(),
        sender,
        sender_remark,
        content: raw.content.unwrap_or_default(),
        create_time: raw.timestamp.unwrap_or(now),
        local_file_path: raw.local_file_path,
        original_file_path: raw.original_file_path,
        file_type,
        file_size: raw.file_size,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn raw(id: &str, sender: &str, content: &str) -> RemoteMessage {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "mtype": 1,
            "type": "friend",
            "sender": sender,
            "content": content,
            "chat_name": "alice"
        }))
        .unwrap()
    }

    fn ingress() -> MessageIngress {
        MessageIngress::new(
            Store::open_in_memory().unwrap(),
            Arc::new(PipelineCounters::new()),
        )
    }

    #[tokio::test]
    async fn persists_and_counts_new_messages() {
        let ingress = ingress();
        let message = ingress
            .ingest("a", raw("m1", "alice", "hi"), 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message_id, "m1");
        assert_eq!(ingress.counters.snapshot().ingressed, 1);
    }

    #[tokio::test]
    async fn duplicates_are_silent_noops() {
        let ingress = ingress();
        ingress.ingest("a", raw("m1", "alice", "hi"), 100).await.unwrap();
        let second = ingress.ingest("a", raw("m1", "alice", "hi"), 101).await.unwrap();
        assert!(second.is_none());
        assert_eq!(ingress.counters.snapshot().ingressed, 1);
    }

    #[tokio::test]
    async fn self_messages_are_dropped_before_the_store() {
        let ingress = ingress();
        assert!(ingress
            .ingest("a", raw("m1", "Self", "echo"), 100)
            .await
            .unwrap()
            .is_none());
        assert_eq!(ingress.counters.snapshot().ingressed, 0);
    }

    #[tokio::test]
    async fn system_notice_mtypes_are_dropped() {
        let ingress = ingress();
        let notice: RemoteMessage = serde_json::from_value(serde_json::json!({
            "id": "m9", "mtype": "10000", "sender": "alice", "chat_name": "alice"
        }))
        .unwrap();
        assert!(ingress.ingest("a", notice, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn whitespace_and_remarks_are_normalised() {
        let ingress = ingress();
        let raw: RemoteMessage = serde_json::from_value(serde_json::json!({
            "id": "m1", "mtype": 1, "type": "group",
            "sender": "  bob ", "sender_remark": "  ",
            "content": "hi", "chat_name": " dev group "
        }))
        .unwrap();
        let message = ingress.ingest("a", raw, 100).await.unwrap().unwrap();
        assert_eq!(message.sender, "bob");
        assert_eq!(message.chat_name, "dev group");
        // A blank remark normalises away entirely.
        assert_eq!(message.sender_remark, None);
    }

    #[tokio::test]
    async fn attachment_fields_are_carried_through() {
        let ingress = ingress();
        let raw: RemoteMessage = serde_json::from_value(serde_json::json!({
            "id": "m1", "mtype": 3, "type": "friend", "sender": "alice",
            "chat_name": "alice", "content": "[图片]",
            "local_file_path": "pics/m1.png", "file_type": "image", "file_size": 2048
        }))
        .unwrap();
        let message = ingress.ingest("a", raw, 100).await.unwrap().unwrap();
        assert_eq!(message.file_type, FileType::Image);
        assert_eq!(message.local_file_path.as_deref(), Some("pics/m1.png"));
        assert_eq!(message.file_size, Some(2048));
    }

    #[tokio::test]
    async fn missing_id_gets_a_generated_one() {
        let ingress = ingress();
        let raw: RemoteMessage = serde_json::from_value(serde_json::json!({
            "mtype": 1, "sender": "alice", "chat_name": "alice", "content": "x"
        }))
        .unwrap();
        let message = ingress.ingest("a", raw, 100).await.unwrap().unwrap();
        assert!(!message.message_id.is_empty());
        assert_eq!(message.create_time, 100);
    }
}
