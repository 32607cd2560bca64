//! Persisted message records and delivery lifecycle types.

use serde::{Deserialize, Serialize};

/// Raw message type codes the remote daemon uses for system notices.
///
/// Messages carrying these codes (recalls, system banners) are dropped at
/// the ingress boundary and never persisted.
const FILTERED_MTYPES: [&str; 2] = ["10000", "10002"];

/// Delivery lifecycle of a persisted message.
///
/// Transitions are monotonic: `Pending` may move to exactly one of
/// `Delivered`, `Failed` or `Skipped`. A `Failed` message returns to
/// `Pending` only through explicit admin action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for a delivery worker.
    Pending,
    /// Reply produced and sent through the originating instance.
    Delivered,
    /// Platform or send failure; kept with the error summary for diagnosis.
    Failed,
    /// Intentionally not delivered (no rule, merged away, platform declined).
    Skipped,
}

impl DeliveryStatus {
    /// Numeric encoding used in the database (`pending=0 … skipped=3`).
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Delivered => 1,
            Self::Failed => 2,
            Self::Skipped => 3,
        }
    }

    /// Decodes the database representation; unknown values read as `Pending`.
    #[must_use]
    pub const fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Delivered,
            2 => Self::Failed,
            3 => Self::Skipped,
            _ => Self::Pending,
        }
    }
}

/// Why a message ended up `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// No enabled rule matched the message.
    NoRule,
    /// The winning rule requires an at-mention the message does not carry.
    NotAt,
    /// Absorbed into an earlier message during the merge window.
    Merged,
    /// The platform answered but asked for no reply to be sent.
    PlatformDeclined,
}

impl SkipReason {
    /// Stable string form stored in the `skip_reason` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoRule => "no_rule",
            Self::NotAt => "not_at",
            Self::Merged => "merged",
            Self::PlatformDeclined => "platform_declined",
        }
    }

    /// Parses the stored string form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "no_rule" => Some(Self::NoRule),
            "not_at" => Some(Self::NotAt),
            "merged" => Some(Self::Merged),
            "platform_declined" => Some(Self::PlatformDeclined),
            _ => None,
        }
    }
}

/// Kind of attachment carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Image,
    File,
    Voice,
    Video,
    #[default]
    None,
}

impl FileType {
    /// Stable string form stored in the `file_type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::File => "file",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::None => "none",
        }
    }

    /// Parses the stored string form; unknown values read as `None`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "image" => Self::Image,
            "file" => Self::File,
            "voice" => Self::Voice,
            "video" => Self::Video,
            _ => Self::None,
        }
    }
}

/// A normalised inbound message ready for insertion.
///
/// Produced by the ingress boundary from the remote daemon's raw JSON; the
/// rest of the pipeline only ever sees this record or the full [`Message`]
/// row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    /// Instance the message was polled from.
    pub instance_id: String,
    /// Remote message id; unique together with `instance_id`.
    pub message_id: String,
    /// Chat (private contact or group) the message arrived in.
    pub chat_name: String,
    /// String tag from the remote: `friend`, `group`, `self`, `time`, ...
    pub message_type: String,
    /// Raw numeric type code from the remote, as a string.
    pub mtype: String,
    /// Message sender.
    pub sender: String,
    /// Sender's remark name, when the account has one configured.
    pub sender_remark: Option<String>,
    /// Text content, or the attachment reference for file-ish messages.
    pub content: String,
    /// Unix timestamp of arrival.
    pub create_time: i64,
    /// Path below the downloads dir where the remote saved the attachment.
    pub local_file_path: Option<String>,
    /// Path of the attachment on the remote host, when reported.
    pub original_file_path: Option<String>,
    /// Attachment kind.
    pub file_type: FileType,
    /// Attachment size in bytes, when reported.
    pub file_size: Option<i64>,
}

impl NewMessage {
    /// Whether this message must never be persisted.
    ///
    /// Self-echoes, time banners and system notices (`mtype` 10000/10002)
    /// are filtered here and by the store's insert guard.
    #[must_use]
    pub fn is_filtered(&self) -> bool {
        let sender = self.sender.to_lowercase();
        let message_type = self.message_type.to_lowercase();
        sender == "self"
            || message_type == "self"
            || message_type == "time"
            || FILTERED_MTYPES.contains(&self.mtype.as_str())
    }
}

/// A full message row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Instance the message was polled from.
    pub instance_id: String,
    /// Remote message id; unique together with `instance_id`.
    pub message_id: String,
    /// Chat the message arrived in.
    pub chat_name: String,
    /// String tag from the remote: `friend`, `group`, `self`, `time`, ...
    pub message_type: String,
    /// Raw numeric type code from the remote, as a string.
    pub mtype: String,
    /// Message sender.
    pub sender: String,
    /// Sender's remark name, when present.
    pub sender_remark: Option<String>,
    /// Text content, possibly the concatenation of merged peers.
    pub content: String,
    /// Unix timestamp of arrival.
    pub create_time: i64,
    /// In-flight claim marker; set while a delivery worker owns the row.
    pub processed: bool,
    /// Delivery lifecycle state.
    pub delivery_status: DeliveryStatus,
    /// Unix timestamp of the delivery outcome, when decided.
    pub delivery_time: Option<i64>,
    /// Reason the message was skipped, when `delivery_status` is `Skipped`.
    pub skip_reason: Option<SkipReason>,
    /// Platform the message was routed to.
    pub platform_id: Option<String>,
    /// Reply text produced by the platform, or the error summary on failure.
    pub reply_content: Option<String>,
    /// Raw reply status code kept for the admin surface.
    pub reply_status: i64,
    /// Unix timestamp the reply was sent.
    pub reply_time: Option<i64>,
    /// Whether this row absorbed peers during the merge window.
    pub merged: bool,
    /// Number of messages represented by this row (1 when unmerged).
    pub merged_count: i64,
    /// Message ids absorbed into this row.
    pub merged_ids: Vec<String>,
    /// Path below the downloads dir where the attachment was saved.
    pub local_file_path: Option<String>,
    /// Path of the attachment on the remote host.
    pub original_file_path: Option<String>,
    /// Attachment kind.
    pub file_type: FileType,
    /// Attachment size in bytes.
    pub file_size: Option<i64>,
}

impl Message {
    /// Whether the message came from a group chat rather than a private one.
    ///
    /// Group messages have a sender distinct from the chat name; private
    /// chats repeat the contact name in both fields.
    #[must_use]
    pub fn is_group_message(&self) -> bool {
        !self.sender.is_empty() && self.sender != self.chat_name
    }

    /// The name to address the sender by: remark when present, else sender.
    #[must_use]
    pub fn effective_sender(&self) -> &str {
        match self.sender_remark.as_deref() {
            Some(remark) if !remark.is_empty() => remark,
            _ => &self.sender,
        }
    }

    /// Whether the message carries an attachment the platforms can consume.
    #[must_use]
    pub fn has_attachment(&self) -> bool {
        matches!(self.file_type, FileType::Image | FileType::File) && self.local_file_path.is_some()
    }
}
