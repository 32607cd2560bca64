//! Listener and fixed-listener persistence.

use rusqlite::{OptionalExtension, Row, params};

use wxrelay_common::{FixedListener, Listener, ListenerStatus};

use crate::db::Store;
use crate::error::Result;

const LISTENER_COLUMNS: &str = "instance_id, chat_name, last_message_time, last_check_time, \
     create_time, status, manual_added, conversation_id";

fn listener_from_row(row: &Row<'_>) -> rusqlite::Result<Listener> {
    let status: String = row.get(5)?;
    Ok(Listener {
        instance_id: row.get(0)?,
        chat_name: row.get(1)?,
        last_message_time: row.get(2)?,
        last_check_time: row.get(3)?,
        create_time: row.get(4)?,
        status: ListenerStatus::parse(&status),
        manual_added: row.get::<_, i64>(6)? != 0,
        conversation_id: row.get(7)?,
    })
}

impl Store {
    /// Inserts or reactivates a listener.
    ///
    /// An existing row is flipped back to `active` and its
    /// `last_message_time` refreshed; the manual flag only ever ratchets up
    /// so an auto-poll can never demote an operator-added listener.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn upsert_listener(
        &self,
        instance_id: String,
        chat_name: String,
        manual_added: bool,
        now: i64,
    ) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO listeners
                     (instance_id, chat_name, last_message_time, last_check_time, create_time,
                      status, manual_added)
                 VALUES (?1, ?2, ?3, ?3, ?3, 'active', ?4)
                 ON CONFLICT(instance_id, chat_name) DO UPDATE SET
                     status = 'active',
                     last_message_time = excluded.last_message_time,
                     manual_added = MAX(listeners.manual_added, excluded.manual_added)",
                params![instance_id, chat_name, now, i64::from(manual_added)],
            )?;
            Ok(())
        })
        .await
    }

    /// Lists listeners, optionally filtered by instance and status.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn list_listeners(
        &self,
        instance_id: Option<String>,
        status: Option<ListenerStatus>,
    ) -> Result<Vec<Listener>> {
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LISTENER_COLUMNS} FROM listeners
                 WHERE (?1 IS NULL OR instance_id = ?1)
                   AND (?2 IS NULL OR status = ?2)
                 ORDER BY instance_id, chat_name"
            ))?;
            let listeners = stmt
                .query_map(
                    params![instance_id, status.map(ListenerStatus::as_str)],
                    listener_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(listeners)
        })
        .await
    }

    /// Fetches one listener row.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn get_listener(
        &self,
        instance_id: String,
        chat_name: String,
    ) -> Result<Option<Listener>> {
        self.run_read(move |conn| {
            let listener = conn
                .query_row(
                    &format!(
                        "SELECT {LISTENER_COLUMNS} FROM listeners
                         WHERE instance_id = ?1 AND chat_name = ?2"
                    ),
                    params![instance_id, chat_name],
                    listener_from_row,
                )
                .optional()?;
            Ok(listener)
        })
        .await
    }

    /// Flips a listener's status. Rows are never deleted by the pipeline.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn set_listener_status(
        &self,
        instance_id: String,
        chat_name: String,
        status: ListenerStatus,
    ) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE listeners SET status = ?3 WHERE instance_id = ?1 AND chat_name = ?2",
                params![instance_id, chat_name, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Refreshes `last_message_time` after traffic from the chat.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn touch_listener_message(
        &self,
        instance_id: String,
        chat_name: String,
        now: i64,
    ) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE listeners SET last_message_time = ?3
                 WHERE instance_id = ?1 AND chat_name = ?2",
                params![instance_id, chat_name, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Refreshes `last_check_time` after a per-listener poll.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn touch_listener_check(
        &self,
        instance_id: String,
        chat_name: String,
        now: i64,
    ) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE listeners SET last_check_time = ?3
                 WHERE instance_id = ?1 AND chat_name = ?2",
                params![instance_id, chat_name, now],
            )?;
            Ok(())
        })
        .await
    }

    /// Writes or clears the legacy per-listener conversation slot.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn set_listener_conversation(
        &self,
        instance_id: String,
        chat_name: String,
        conversation_id: Option<String>,
    ) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE listeners SET conversation_id = ?3
                 WHERE instance_id = ?1 AND chat_name = ?2",
                params![instance_id, chat_name, conversation_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Number of active listeners on one instance, for the cap check.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn count_active_listeners(&self, instance_id: String) -> Result<u32> {
        self.run_read(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM listeners WHERE instance_id = ?1 AND status = 'active'",
                params![instance_id],
                |row| row.get(0),
            )?;
            Ok(u32::try_from(count).unwrap_or(u32::MAX))
        })
        .await
    }

    /// Lists fixed-listener declarations.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn list_fixed_listeners(&self, enabled_only: bool) -> Result<Vec<FixedListener>> {
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_name, enabled, description FROM fixed_listeners
                 WHERE (?1 = 0 OR enabled = 1)
                 ORDER BY session_name",
            )?;
            let fixed = stmt
                .query_map(params![i64::from(enabled_only)], |row| {
                    Ok(FixedListener {
                        session_name: row.get(0)?,
                        enabled: row.get::<_, i64>(1)? != 0,
                        description: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(fixed)
        })
        .await
    }

    /// Inserts or updates a fixed-listener declaration.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn upsert_fixed_listener(&self, fixed: FixedListener, now: i64) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO fixed_listeners (session_name, enabled, description, create_time)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_name) DO UPDATE SET
                     enabled = excluded.enabled,
                     description = excluded.description",
                params![
                    fixed.session_name,
                    i64::from(fixed.enabled),
                    fixed.description,
                    now
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn upsert_reactivates_and_keeps_manual_flag() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_listener("a".to_string(), "grp".to_string(), true, 100)
            .await
            .unwrap();
        store
            .set_listener_status("a".to_string(), "grp".to_string(), ListenerStatus::Inactive)
            .await
            .unwrap();

        // Auto re-add must reactivate without clearing the manual flag.
        store
            .upsert_listener("a".to_string(), "grp".to_string(), false, 200)
            .await
            .unwrap();
        let listener = store
            .get_listener("a".to_string(), "grp".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.status, ListenerStatus::Active);
        assert!(listener.manual_added);
        assert_eq!(listener.last_message_time, 200);
    }

    #[tokio::test]
    async fn status_filter_and_count() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_listener("a".to_string(), "grp1".to_string(), false, 1)
            .await
            .unwrap();
        store
            .upsert_listener("a".to_string(), "grp2".to_string(), false, 1)
            .await
            .unwrap();
        store
            .set_listener_status("a".to_string(), "grp2".to_string(), ListenerStatus::Inactive)
            .await
            .unwrap();

        let active = store
            .list_listeners(Some("a".to_string()), Some(ListenerStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].chat_name, "grp1");
        assert_eq!(store.count_active_listeners("a".to_string()).await.unwrap(), 1);
        // Inactivation never deletes the row.
        assert_eq!(store.list_listeners(None, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn legacy_conversation_slot_roundtrips() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_listener("a".to_string(), "alice".to_string(), false, 1)
            .await
            .unwrap();
        store
            .set_listener_conversation(
                "a".to_string(),
                "alice".to_string(),
                Some("c-1".to_string()),
            )
            .await
            .unwrap();
        let listener = store
            .get_listener("a".to_string(), "alice".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.conversation_id.as_deref(), Some("c-1"));

        store
            .set_listener_conversation("a".to_string(), "alice".to_string(), None)
            .await
            .unwrap();
        let listener = store
            .get_listener("a".to_string(), "alice".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.conversation_id, None);
    }

    #[tokio::test]
    async fn fixed_listeners_filter_enabled() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_fixed_listener(
                FixedListener {
                    session_name: "ops group".to_string(),
                    enabled: true,
                    description: String::new(),
                },
                1,
            )
            .await
            .unwrap();
        store
            .upsert_fixed_listener(
                FixedListener {
                    session_name: "old group".to_string(),
                    enabled: false,
                    description: "retired".to_string(),
                },
                1,
            )
            .await
            .unwrap();

        assert_eq!(store.list_fixed_listeners(true).await.unwrap().len(), 1);
        assert_eq!(store.list_fixed_listeners(false).await.unwrap().len(), 2);
    }
}
