//! # wxrelay-store
//!
//! SQLite-backed state for the wxrelay pipeline.
//!
//! A single write-serialised connection in WAL mode holds messages,
//! listeners, platforms, rules, per-user conversations and fixed-listener
//! declarations. Async callers reach it through [`Store::run`], which moves
//! the work onto the blocking thread pool.

mod conversations;
mod db;
mod error;
mod listeners;
mod messages;
mod platforms;
mod retry;

pub use conversations::ConversationMap;
pub use db::Store;
pub use error::{Result, StoreError};
pub use retry::write_with_retry;
