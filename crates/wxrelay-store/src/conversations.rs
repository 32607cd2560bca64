//! Conversation persistence and the in-memory map in front of it.

use dashmap::DashMap;
use rusqlite::{OptionalExtension, params};

use wxrelay_common::ConversationKey;

use crate::db::Store;
use crate::error::Result;

impl Store {
    /// Reads one conversation mapping.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn get_conversation(&self, key: ConversationKey) -> Result<Option<String>> {
        self.run_read(move |conn| {
            let conversation_id = conn
                .query_row(
                    "SELECT conversation_id FROM user_conversations
                     WHERE instance_id = ?1 AND chat_name = ?2 AND user_id = ?3
                       AND platform_id = ?4",
                    params![key.instance_id, key.chat_name, key.user_id, key.platform_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(conversation_id)
        })
        .await
    }

    /// Writes a conversation mapping, refreshing `last_active`.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn put_conversation(
        &self,
        key: ConversationKey,
        conversation_id: String,
        now: i64,
    ) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO user_conversations
                     (instance_id, chat_name, user_id, platform_id, conversation_id,
                      create_time, last_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(instance_id, chat_name, user_id, platform_id) DO UPDATE SET
                     conversation_id = excluded.conversation_id,
                     last_active = excluded.last_active",
                params![
                    key.instance_id,
                    key.chat_name,
                    key.user_id,
                    key.platform_id,
                    conversation_id,
                    now
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes one conversation mapping.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn delete_conversation(&self, key: ConversationKey) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM user_conversations
                 WHERE instance_id = ?1 AND chat_name = ?2 AND user_id = ?3 AND platform_id = ?4",
                params![key.instance_id, key.chat_name, key.user_id, key.platform_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Drops mappings idle since before `cutoff`. Returns the number purged.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn purge_conversations_older_than(&self, cutoff: i64) -> Result<usize> {
        self.run(move |conn| {
            let purged = conn.execute(
                "DELETE FROM user_conversations WHERE last_active < ?1",
                params![cutoff],
            )?;
            Ok(purged)
        })
        .await
    }
}

/// Thread-safe conversation cache in front of the store.
///
/// Reads hit the cache first; writes go through to the store and update the
/// cache. Cache entries are dropped together with their rows, so a stale
/// upstream session can never be served from memory after invalidation.
pub struct ConversationMap {
    store: Store,
    cache: DashMap<ConversationKey, String>,
}

impl ConversationMap {
    /// Builds an empty map over the store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Looks up the conversation id for a key.
    ///
    /// # Errors
    ///
    /// Returns any database failure on a cache miss.
    pub async fn get(&self, key: &ConversationKey) -> Result<Option<String>> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit.clone()));
        }
        let loaded = self.store.get_conversation(key.clone()).await?;
        if let Some(conversation_id) = &loaded {
            self.cache.insert(key.clone(), conversation_id.clone());
        }
        Ok(loaded)
    }

    /// Persists a conversation id and refreshes its activity time.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn put(&self, key: ConversationKey, conversation_id: String, now: i64) -> Result<()> {
        self.store
            .put_conversation(key.clone(), conversation_id.clone(), now)
            .await?;
        self.cache.insert(key, conversation_id);
        Ok(())
    }

    /// Drops a mapping, typically after the upstream reported the session
    /// invalid.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn delete(&self, key: &ConversationKey) -> Result<()> {
        self.cache.remove(key);
        self.store.delete_conversation(key.clone()).await
    }

    /// Purges mappings idle since before `cutoff` from store and cache.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn purge_older_than(&self, cutoff: i64) -> Result<usize> {
        let purged = self.store.purge_conversations_older_than(cutoff).await?;
        if purged > 0 {
            // Cheaper than tracking per-entry ages in memory.
            self.cache.clear();
        }
        Ok(purged)
    }
}
