//! Listener records: per-chat subscriptions on a remote instance.

use serde::{Deserialize, Serialize};

/// Whether a listener is currently being polled.
///
/// Listeners are never deleted by the pipeline; timing out only flips an
/// auto-added listener to `Inactive`, and a new message from the chat
/// resurrects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerStatus {
    Active,
    Inactive,
}

impl ListenerStatus {
    /// Stable string form stored in the `status` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    /// Parses the stored string form; unknown values read as `Inactive`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "active" {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// A persistent subscription to one chat on one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    /// Owning instance.
    pub instance_id: String,
    /// Chat being listened to.
    pub chat_name: String,
    /// Unix timestamp of the last message seen from this chat.
    pub last_message_time: i64,
    /// Unix timestamp of the last per-listener poll.
    pub last_check_time: i64,
    /// Unix timestamp the listener row was created.
    pub create_time: i64,
    /// Polling state.
    pub status: ListenerStatus,
    /// Whether the listener was added by an operator (or fixed-listener
    /// config) rather than auto-discovered. Manual listeners never time out.
    pub manual_added: bool,
    /// Legacy per-listener conversation slot. Kept for back-compat and
    /// cleared on stale sessions; routing reads the conversation map instead.
    pub conversation_id: Option<String>,
}

impl Listener {
    /// Whether housekeeping may inactivate this listener after `timeout_secs`
    /// without traffic.
    #[must_use]
    pub const fn eligible_for_timeout(&self, now: i64, timeout_secs: i64) -> bool {
        !self.manual_added
            && matches!(self.status, ListenerStatus::Active)
            && now - self.last_message_time > timeout_secs
    }
}

/// A chat declared in configuration that must always have an active,
/// manually-flagged listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedListener {
    /// Chat name the listener must cover.
    pub session_name: String,
    /// Disabled entries are kept but not reconciled.
    pub enabled: bool,
    /// Free-form operator note.
    #[serde(default)]
    pub description: String,
}
