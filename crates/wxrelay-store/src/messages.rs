//! Message persistence: ingestion, delivery claims, merges and outcomes.

use rusqlite::{Connection, OptionalExtension, Row, params};

use wxrelay_common::{DeliveryStatus, FileType, Message, NewMessage, SkipReason};

use crate::db::Store;
use crate::error::Result;

/// Column list shared by every message SELECT; must stay in sync with
/// [`message_from_row`].
const MESSAGE_COLUMNS: &str = "instance_id, message_id, chat_name, message_type, mtype, sender, \
     sender_remark, content, create_time, processed, delivery_status, delivery_time, \
     skip_reason, platform_id, reply_content, reply_status, reply_time, merged, merged_count, \
     merged_ids, local_file_path, original_file_path, file_type, file_size";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let skip_reason: Option<String> = row.get(12)?;
    let merged_ids: Option<String> = row.get(19)?;
    let file_type: String = row.get(22)?;
    Ok(Message {
        instance_id: row.get(0)?,
        message_id: row.get(1)?,
        chat_name: row.get(2)?,
        message_type: row.get(3)?,
        mtype: row.get(4)?,
        sender: row.get(5)?,
        sender_remark: row.get(6)?,
        content: row.get(7)?,
        create_time: row.get(8)?,
        processed: row.get::<_, i64>(9)? != 0,
        delivery_status: DeliveryStatus::from_i64(row.get(10)?),
        delivery_time: row.get(11)?,
        skip_reason: skip_reason.as_deref().and_then(SkipReason::parse),
        platform_id: row.get(13)?,
        reply_content: row.get(14)?,
        reply_status: row.get(15)?,
        reply_time: row.get(16)?,
        merged: row.get::<_, i64>(17)? != 0,
        merged_count: row.get(18)?,
        merged_ids: merged_ids
            .as_deref()
            .map(|s| serde_json::from_str(s).unwrap_or_default())
            .unwrap_or_default(),
        local_file_path: row.get(20)?,
        original_file_path: row.get(21)?,
        file_type: FileType::parse(&file_type),
        file_size: row.get(23)?,
    })
}

impl Store {
    /// Persists a normalised inbound message with `delivery_status=pending`.
    ///
    /// Returns `false` without writing when the message matches the
    /// self/time/system filter or when `(instance_id, message_id)` already
    /// exists; both are expected no-ops, not errors.
    ///
    /// # Errors
    ///
    /// Returns any non-uniqueness database failure.
    pub async fn insert_message(&self, message: NewMessage) -> Result<bool> {
        if message.is_filtered() {
            return Ok(false);
        }
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages
                     (instance_id, message_id, chat_name, message_type, mtype, sender,
                      sender_remark, content, create_time, local_file_path,
                      original_file_path, file_type, file_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    message.instance_id,
                    message.message_id,
                    message.chat_name,
                    message.message_type,
                    message.mtype,
                    message.sender,
                    message.sender_remark,
                    message.content,
                    message.create_time,
                    message.local_file_path,
                    message.original_file_path,
                    message.file_type.as_str(),
                    message.file_size,
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    /// Lists unclaimed pending messages in `create_time` order.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn list_pending(&self, limit: u32) -> Result<Vec<Message>> {
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE delivery_status = 0 AND processed = 0
                 ORDER BY create_time ASC, id ASC
                 LIMIT ?1"
            ))?;
            let messages = stmt
                .query_map([limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }

    /// Atomically claims a pending message for delivery.
    ///
    /// Returns `false` when another worker already owns it or its status
    /// moved on.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn claim_for_delivery(&self, instance_id: String, message_id: String) -> Result<bool> {
        self.run(move |conn| {
            let claimed = conn.execute(
                "UPDATE messages SET processed = 1
                 WHERE instance_id = ?1 AND message_id = ?2
                   AND delivery_status = 0 AND processed = 0",
                params![instance_id, message_id],
            )?;
            Ok(claimed == 1)
        })
        .await
    }

    /// Claims all unclaimed pending peers of the primary message within the
    /// merge window: same instance, chat and sender, `create_time` within
    /// `window_secs` of the primary.
    ///
    /// The claim happens in the same serialised write as the select, so two
    /// workers can never absorb the same peer.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn claim_merge_peers(
        &self,
        primary: &Message,
        window_secs: i64,
    ) -> Result<Vec<Message>> {
        let instance_id = primary.instance_id.clone();
        let message_id = primary.message_id.clone();
        let chat_name = primary.chat_name.clone();
        let sender = primary.sender.clone();
        let create_time = primary.create_time;
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE instance_id = ?1 AND chat_name = ?2 AND sender = ?3
                   AND message_id != ?4
                   AND delivery_status = 0 AND processed = 0
                   AND create_time >= ?5 AND create_time <= ?6
                 ORDER BY create_time ASC, id ASC"
            ))?;
            let peers = stmt
                .query_map(
                    params![
                        instance_id,
                        chat_name,
                        sender,
                        message_id,
                        create_time - window_secs,
                        create_time + window_secs
                    ],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<Message>, _>>()?;
            drop(stmt);

            for peer in &peers {
                conn.execute(
                    "UPDATE messages SET processed = 1
                     WHERE instance_id = ?1 AND message_id = ?2",
                    params![peer.instance_id, peer.message_id],
                )?;
            }
            Ok(peers)
        })
        .await
    }

    /// Records a merge: the primary absorbs `absorbed_ids`, which are marked
    /// `skipped(merged)`.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn record_merge(
        &self,
        instance_id: String,
        primary_id: String,
        absorbed_ids: Vec<String>,
        now: i64,
    ) -> Result<()> {
        self.run(move |conn| {
            let merged_ids = serde_json::to_string(&absorbed_ids)?;
            conn.execute(
                "UPDATE messages
                 SET merged = 1, merged_count = ?3, merged_ids = ?4
                 WHERE instance_id = ?1 AND message_id = ?2",
                params![
                    instance_id,
                    primary_id,
                    absorbed_ids.len() as i64 + 1,
                    merged_ids
                ],
            )?;
            for absorbed in &absorbed_ids {
                mark_skipped_row(conn, &instance_id, absorbed, SkipReason::Merged, now)?;
            }
            Ok(())
        })
        .await
    }

    /// Records the delivery outcome of a claimed message.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn record_delivery(
        &self,
        instance_id: String,
        message_id: String,
        status: DeliveryStatus,
        platform_id: Option<String>,
        reply_content: Option<String>,
        now: i64,
    ) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE messages
                 SET delivery_status = ?3, delivery_time = ?4, platform_id = COALESCE(?5, platform_id),
                     reply_content = ?6, reply_status = ?7, reply_time = ?4, processed = 1
                 WHERE instance_id = ?1 AND message_id = ?2",
                params![
                    instance_id,
                    message_id,
                    status.as_i64(),
                    now,
                    platform_id,
                    reply_content,
                    i64::from(status == DeliveryStatus::Delivered),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Marks a claimed message as skipped with the given reason.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn mark_skipped(
        &self,
        instance_id: String,
        message_id: String,
        reason: SkipReason,
        now: i64,
    ) -> Result<()> {
        self.run(move |conn| mark_skipped_row(conn, &instance_id, &message_id, reason, now))
            .await
    }

    /// Admin action: returns a failed message to the pending pool.
    ///
    /// # Errors
    ///
    /// Returns any database failure; returns `Ok(false)` when the message is
    /// not in the failed state.
    pub async fn requeue_failed(&self, instance_id: String, message_id: String) -> Result<bool> {
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE messages
                 SET delivery_status = 0, processed = 0, delivery_time = NULL,
                     reply_content = NULL, reply_time = NULL, skip_reason = NULL
                 WHERE instance_id = ?1 AND message_id = ?2 AND delivery_status = 2",
                params![instance_id, message_id],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Fetches one message row.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn get_message(
        &self,
        instance_id: String,
        message_id: String,
    ) -> Result<Option<Message>> {
        self.run_read(move |conn| {
            let message = conn
                .query_row(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages
                         WHERE instance_id = ?1 AND message_id = ?2"
                    ),
                    params![instance_id, message_id],
                    message_from_row,
                )
                .optional()?;
            Ok(message)
        })
        .await
    }
}

fn mark_skipped_row(
    conn: &Connection,
    instance_id: &str,
    message_id: &str,
    reason: SkipReason,
    now: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE messages
         SET delivery_status = 3, skip_reason = ?3, delivery_time = ?4, processed = 1
         WHERE instance_id = ?1 AND message_id = ?2",
        params![instance_id, message_id, reason.as_str(), now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn new_message(message_id: &str, sender: &str, create_time: i64) -> NewMessage {
        NewMessage {
            instance_id: "a".to_string(),
            message_id: message_id.to_string(),
            chat_name: "alice".to_string(),
            message_type: "friend".to_string(),
            mtype: "1".to_string(),
            sender: sender.to_string(),
            sender_remark: None,
            content: format!("content of {message_id}"),
            create_time,
            local_file_path: None,
            original_file_path: None,
            file_type: FileType::None,
            file_size: None,
        }
    }

    #[tokio::test]
    async fn insertion_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.insert_message(new_message("m1", "alice", 1)).await.unwrap());
        assert!(!store.insert_message(new_message("m1", "alice", 1)).await.unwrap());
        assert_eq!(store.list_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn filtered_messages_never_persist() {
        let store = Store::open_in_memory().unwrap();
        let mut message = new_message("m1", "Self", 1);
        assert!(!store.insert_message(message.clone()).await.unwrap());

        message.sender = "alice".to_string();
        message.mtype = "10000".to_string();
        assert!(!store.insert_message(message).await.unwrap());
        assert!(store.list_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = Store::open_in_memory().unwrap();
        store.insert_message(new_message("m1", "alice", 1)).await.unwrap();
        assert!(store
            .claim_for_delivery("a".to_string(), "m1".to_string())
            .await
            .unwrap());
        assert!(!store
            .claim_for_delivery("a".to_string(), "m1".to_string())
            .await
            .unwrap());
        assert!(store.list_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_absorbs_peers_in_window() {
        let store = Store::open_in_memory().unwrap();
        store.insert_message(new_message("m1", "alice", 100)).await.unwrap();
        store.insert_message(new_message("m2", "alice", 101)).await.unwrap();
        store.insert_message(new_message("m3", "alice", 101)).await.unwrap();
        // Outside the window.
        store.insert_message(new_message("m4", "alice", 200)).await.unwrap();
        // Different sender.
        store.insert_message(new_message("m5", "bob", 100)).await.unwrap();

        store
            .claim_for_delivery("a".to_string(), "m1".to_string())
            .await
            .unwrap();
        let primary = store
            .get_message("a".to_string(), "m1".to_string())
            .await
            .unwrap()
            .unwrap();
        let peers = store.claim_merge_peers(&primary, 2).await.unwrap();
        let peer_ids: Vec<_> = peers.iter().map(|p| p.message_id.clone()).collect();
        assert_eq!(peer_ids, vec!["m2".to_string(), "m3".to_string()]);

        store
            .record_merge("a".to_string(), "m1".to_string(), peer_ids, 102)
            .await
            .unwrap();

        let primary = store
            .get_message("a".to_string(), "m1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(primary.merged);
        assert_eq!(primary.merged_count, 3);
        assert_eq!(primary.merged_ids, vec!["m2".to_string(), "m3".to_string()]);

        let peer = store
            .get_message("a".to_string(), "m2".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer.delivery_status, DeliveryStatus::Skipped);
        assert_eq!(peer.skip_reason, Some(SkipReason::Merged));
        assert!(!peer.merged);

        // m4 and m5 stay pending.
        assert_eq!(store.list_pending(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delivery_outcome_is_recorded() {
        let store = Store::open_in_memory().unwrap();
        store.insert_message(new_message("m1", "alice", 1)).await.unwrap();
        store
            .claim_for_delivery("a".to_string(), "m1".to_string())
            .await
            .unwrap();
        store
            .record_delivery(
                "a".to_string(),
                "m1".to_string(),
                DeliveryStatus::Delivered,
                Some("openai1".to_string()),
                Some("hello back".to_string()),
                50,
            )
            .await
            .unwrap();

        let message = store
            .get_message("a".to_string(), "m1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
        assert_eq!(message.platform_id.as_deref(), Some("openai1"));
        assert_eq!(message.reply_content.as_deref(), Some("hello back"));
        assert_eq!(message.delivery_time, Some(50));
        assert_eq!(message.reply_status, 1);
    }

    #[tokio::test]
    async fn requeue_only_touches_failed_messages() {
        let store = Store::open_in_memory().unwrap();
        store.insert_message(new_message("m1", "alice", 1)).await.unwrap();
        assert!(!store
            .requeue_failed("a".to_string(), "m1".to_string())
            .await
            .unwrap());

        store
            .record_delivery(
                "a".to_string(),
                "m1".to_string(),
                DeliveryStatus::Failed,
                None,
                Some("boom".to_string()),
                10,
            )
            .await
            .unwrap();
        assert!(store
            .requeue_failed("a".to_string(), "m1".to_string())
            .await
            .unwrap());

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message_id, "m1");
    }
}
