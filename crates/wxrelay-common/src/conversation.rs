//! Conversation continuity keys.

use serde::{Deserialize, Serialize};

/// Key of one persisted conversation mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    /// Originating instance.
    pub instance_id: String,
    /// Chat the conversation lives in.
    pub chat_name: String,
    /// Derived user id, see [`derive_user_id`].
    pub user_id: String,
    /// Platform the conversation belongs to.
    pub platform_id: String,
}

impl ConversationKey {
    /// Builds the key for a message routed to `platform_id`.
    #[must_use]
    pub fn new(
        instance_id: impl Into<String>,
        chat_name: impl Into<String>,
        user_id: impl Into<String>,
        platform_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            chat_name: chat_name.into(),
            user_id: user_id.into(),
            platform_id: platform_id.into(),
        }
    }
}

/// A persisted `(key) -> conversation_id` mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    /// Mapping key.
    pub key: ConversationKey,
    /// Upstream conversation id.
    pub conversation_id: String,
    /// Unix timestamp of the last use; drives the retention purge.
    pub last_active: i64,
    /// Unix timestamp the mapping was first created.
    pub create_time: i64,
}

/// Derives the per-user conversation id component.
///
/// The effective sender is the remark name when one is set, else the raw
/// sender. Group chats qualify it as `<chat_name>==<sender>` so two members
/// with the same display name in different groups stay distinct; private
/// chats (sender equals chat name) use the sender alone.
#[must_use]
pub fn derive_user_id(chat_name: &str, sender: &str, sender_remark: Option<&str>) -> String {
    let effective = match sender_remark {
        Some(remark) if !remark.is_empty() => remark,
        _ => sender,
    };
    if !effective.is_empty() && !chat_name.is_empty() && effective != chat_name {
        format!("{chat_name}=={effective}")
    } else {
        effective.to_string()
    }
}
