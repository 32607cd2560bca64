//! Database handle, schema creation and forward-only migrations.
//!
//! One writer `rusqlite::Connection` behind a mutex serialises all
//! mutations; WAL mode lets a small pool of read-only connections serve
//! queries while a write is in flight. Async callers go through
//! [`Store::run`] / [`Store::run_read`], which move the closure onto the
//! blocking thread pool so the tokio workers never block on SQLite.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Read-only connections kept open against a file-backed database.
const READ_POOL_SIZE: usize = 4;

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Store {
    writer: Arc<Mutex<Connection>>,
    /// Empty for in-memory databases, which cannot share state across
    /// connections; reads then fall back to the writer.
    readers: Arc<Vec<Mutex<Connection>>>,
    next_reader: Arc<AtomicUsize>,
}

impl Store {
    /// Opens (creating if needed) the database at `path` and migrates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or a migration fails.
    pub fn open(path: &Path) -> Result<Self> {
        let writer = Connection::open(path)?;
        let store = Self::from_writer(writer)?;

        let mut readers = Vec::with_capacity(READ_POOL_SIZE);
        for _ in 0..READ_POOL_SIZE {
            let conn = Connection::open(path)?;
            conn.execute_batch("PRAGMA query_only=ON;")?;
            readers.push(Mutex::new(conn));
        }
        Ok(Self {
            readers: Arc::new(readers),
            ..store
        })
    }

    /// Opens an in-memory database. Used by tests and nothing else.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_writer(conn)
    }

    fn from_writer(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrate(&conn)?;
        reset_orphaned_claims(&conn)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            readers: Arc::new(Vec::new()),
            next_reader: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Runs a mutation against the writer connection on the blocking thread
    /// pool. All writes serialise here.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Fatal`] if the lock is poisoned or the blocking
    /// task is cancelled, otherwise whatever `f` returns.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Fatal(format!("connection lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Fatal(format!("blocking task failed: {e}")))?
    }

    /// Runs a query against the read pool; reads proceed concurrently with
    /// each other and with the writer thanks to WAL.
    ///
    /// # Errors
    ///
    /// Same contract as [`Store::run`].
    pub async fn run_read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.readers.is_empty() {
            return self.run(f).await;
        }
        let readers = Arc::clone(&self.readers);
        let slot = self.next_reader.fetch_add(1, Ordering::Relaxed) % readers.len();
        tokio::task::spawn_blocking(move || {
            let guard = readers[slot]
                .lock()
                .map_err(|e| StoreError::Fatal(format!("connection lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Fatal(format!("blocking task failed: {e}")))?
    }

    /// Synchronous variant of [`Store::run`] for startup and tests.
    ///
    /// # Errors
    ///
    /// Same contract as [`Store::run`].
    pub fn run_sync<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self
            .writer
            .lock()
            .map_err(|e| StoreError::Fatal(format!("connection lock poisoned: {e}")))?;
        f(&guard)
    }
}

/// Creates missing tables and applies forward-only column additions.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            instance_id TEXT NOT NULL,
            message_id TEXT NOT NULL,
            chat_name TEXT NOT NULL,
            message_type TEXT NOT NULL DEFAULT '',
            mtype TEXT NOT NULL DEFAULT '',
            sender TEXT NOT NULL DEFAULT '',
            sender_remark TEXT,
            content TEXT NOT NULL DEFAULT '',
            create_time INTEGER NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            delivery_status INTEGER NOT NULL DEFAULT 0,
            delivery_time INTEGER,
            platform_id TEXT,
            reply_content TEXT,
            reply_status INTEGER NOT NULL DEFAULT 0,
            reply_time INTEGER,
            merged INTEGER NOT NULL DEFAULT 0,
            merged_count INTEGER NOT NULL DEFAULT 1,
            merged_ids TEXT,
            local_file_path TEXT,
            original_file_path TEXT,
            file_size INTEGER,
            UNIQUE(instance_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_delivery_status ON messages(delivery_status);
        CREATE INDEX IF NOT EXISTS idx_messages_platform_id ON messages(platform_id);
        CREATE INDEX IF NOT EXISTS idx_messages_create_time ON messages(create_time);

        CREATE TABLE IF NOT EXISTS listeners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            instance_id TEXT NOT NULL,
            chat_name TEXT NOT NULL,
            last_message_time INTEGER NOT NULL DEFAULT 0,
            create_time INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            manual_added INTEGER NOT NULL DEFAULT 0,
            conversation_id TEXT,
            UNIQUE(instance_id, chat_name)
        );
        CREATE INDEX IF NOT EXISTS idx_listeners_status ON listeners(status);
        CREATE INDEX IF NOT EXISTS idx_listeners_last_message_time ON listeners(last_message_time);

        CREATE TABLE IF NOT EXISTS service_platforms (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            platform_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            config TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            create_time INTEGER NOT NULL,
            update_time INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS delivery_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            instance_id TEXT NOT NULL,
            chat_pattern TEXT NOT NULL,
            platform_id TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            create_time INTEGER NOT NULL,
            update_time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_delivery_rules_priority ON delivery_rules(priority);

        CREATE TABLE IF NOT EXISTS user_conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            instance_id TEXT NOT NULL,
            chat_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            platform_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            create_time INTEGER NOT NULL,
            last_active INTEGER NOT NULL,
            UNIQUE(instance_id, chat_name, user_id, platform_id)
        );

        CREATE TABLE IF NOT EXISTS fixed_listeners (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_name TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            description TEXT NOT NULL DEFAULT '',
            create_time INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_fixed_listeners_enabled ON fixed_listeners(enabled);",
    )?;

    // Forward-only column additions; .ok() swallows "duplicate column".
    conn.execute_batch("ALTER TABLE messages ADD COLUMN skip_reason TEXT;")
        .ok();
    conn.execute_batch("ALTER TABLE messages ADD COLUMN file_type TEXT NOT NULL DEFAULT 'none';")
        .ok();
    conn.execute_batch("ALTER TABLE listeners ADD COLUMN last_check_time INTEGER NOT NULL DEFAULT 0;")
        .ok();
    conn.execute_batch("ALTER TABLE delivery_rules ADD COLUMN only_at_messages INTEGER NOT NULL DEFAULT 0;")
        .ok();
    conn.execute_batch("ALTER TABLE delivery_rules ADD COLUMN at_name TEXT;")
        .ok();
    conn.execute_batch("ALTER TABLE delivery_rules ADD COLUMN reply_at_sender INTEGER NOT NULL DEFAULT 0;")
        .ok();

    migrate_legacy_conversations(conn)?;

    debug!("schema migration complete");
    Ok(())
}

/// One-time copy of legacy per-listener conversation ids into
/// `user_conversations`, keyed `user_id = chat_name`.
///
/// Only runs when exactly one enabled dify platform exists, since the legacy
/// slot never recorded which platform it belonged to. The slot itself is
/// left in place for back-compat and is cleared on stale sessions.
fn migrate_legacy_conversations(conn: &Connection) -> Result<()> {
    let done: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'legacy_conversations_migrated'",
            [],
            |row| row.get(0),
        )
        .map_or_else(|_| None, Some);
    if done.is_some() {
        return Ok(());
    }

    let mut stmt = conn.prepare(
        "SELECT platform_id FROM service_platforms WHERE type = 'dify' AND enabled = 1",
    )?;
    let dify_ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    drop(stmt);

    if let [platform_id] = dify_ids.as_slice() {
        let migrated = conn.execute(
            "INSERT OR IGNORE INTO user_conversations
                 (instance_id, chat_name, user_id, platform_id, conversation_id,
                  create_time, last_active)
             SELECT instance_id, chat_name, chat_name, ?1, conversation_id,
                    strftime('%s', 'now'), strftime('%s', 'now')
             FROM listeners
             WHERE conversation_id IS NOT NULL AND conversation_id != ''",
            [platform_id],
        )?;
        if migrated > 0 {
            info!("migrated {migrated} legacy listener conversation ids");
        }
    } else if !dify_ids.is_empty() {
        warn!(
            "skipping legacy conversation migration: {} dify platforms configured",
            dify_ids.len()
        );
    }

    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('legacy_conversations_migrated', '1')",
        [],
    )?;
    Ok(())
}

/// Returns claims orphaned by a crash (claimed but never resolved) to the
/// pending pool.
fn reset_orphaned_claims(conn: &Connection) -> Result<()> {
    let reset = conn.execute(
        "UPDATE messages SET processed = 0 WHERE processed = 1 AND delivery_status = 0",
        [],
    )?;
    if reset > 0 {
        info!("returned {reset} orphaned delivery claims to pending");
    }
    Ok(())
}
