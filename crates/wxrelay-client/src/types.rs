//! Wire types for the remote WeChat daemon API.
//!
//! The daemon wraps every response in a `{code, message, data}` envelope;
//! non-zero `code` means a business error regardless of the HTTP status.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// Response envelope common to all endpoints.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    /// Business status; zero on success.
    pub code: i64,
    /// Human-readable status text.
    #[serde(default)]
    pub message: String,
    /// Endpoint-specific payload.
    pub data: Option<T>,
}

/// `GET /api/wechat/status` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WeChatStatus {
    /// Whether the WeChat client on the remote host is up.
    #[serde(default)]
    pub online: bool,
    /// Remote uptime in seconds.
    #[serde(default)]
    pub uptime: Option<f64>,
    /// Anything else the daemon reports, kept for the status snapshot.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// One gauge from `GET /api/system/resources`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceGauge {
    /// Utilisation percentage.
    #[serde(default)]
    pub usage_percent: Option<f64>,
    /// Used amount (MB for memory).
    #[serde(default)]
    pub used: Option<f64>,
    /// Total amount.
    #[serde(default)]
    pub total: Option<f64>,
}

/// `GET /api/system/resources` payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemResources {
    /// CPU gauge.
    #[serde(default)]
    pub cpu: Option<ResourceGauge>,
    /// Memory gauge.
    #[serde(default)]
    pub memory: Option<ResourceGauge>,
}

/// Payload of the unread poll and the per-listener fetch: messages grouped
/// by chat name.
#[derive(Debug, Default, Deserialize)]
pub struct MessagesPayload {
    /// Chat name to message list.
    #[serde(default)]
    pub messages: HashMap<String, Vec<RemoteMessage>>,
}

/// One raw message as the remote daemon reports it.
///
/// Field presence varies with daemon version and message kind, so everything
/// beyond the id is optional and normalisation happens at the ingress
/// boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteMessage {
    /// Remote message id.
    #[serde(default)]
    pub id: Option<String>,
    /// Numeric message type code; arrives as number or string.
    #[serde(default, rename = "mtype", deserialize_with = "de_opt_stringish")]
    pub mtype: Option<String>,
    /// String type tag: `friend`, `group`, `self`, `time`, ...
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    /// Sender name.
    #[serde(default)]
    pub sender: Option<String>,
    /// Sender remark name.
    #[serde(default)]
    pub sender_remark: Option<String>,
    /// Text content or attachment reference.
    #[serde(default)]
    pub content: Option<String>,
    /// Chat the message belongs to; filled in by the client when the daemon
    /// groups messages by chat instead of tagging each one.
    #[serde(default)]
    pub chat_name: Option<String>,
    /// Unix timestamp of the message on the remote.
    #[serde(default)]
    pub timestamp: Option<i64>,
    /// Where the daemon saved the attachment, relative to its downloads dir.
    #[serde(default)]
    pub local_file_path: Option<String>,
    /// Attachment path on the remote host.
    #[serde(default)]
    pub original_file_path: Option<String>,
    /// Attachment kind: `image`, `file`, `voice`, `video`.
    #[serde(default)]
    pub file_type: Option<String>,
    /// Attachment size in bytes.
    #[serde(default)]
    pub file_size: Option<i64>,
}

/// Flags controlling which attachment kinds the daemon saves during a poll.
///
/// The daemon expects these as lowercase string booleans in the query.
#[derive(Debug, Clone, Copy)]
pub struct PollFlags {
    pub save_pic: bool,
    pub save_video: bool,
    pub save_file: bool,
    pub save_voice: bool,
    pub parse_url: bool,
}

impl Default for PollFlags {
    fn default() -> Self {
        Self {
            save_pic: true,
            save_video: false,
            save_file: true,
            save_voice: false,
            parse_url: false,
        }
    }
}

impl PollFlags {
    /// The query-parameter form the daemon expects (`savePic=true`...).
    #[must_use]
    pub fn as_query(&self) -> [(&'static str, &'static str); 5] {
        [
            ("savePic", bool_str(self.save_pic)),
            ("saveVideo", bool_str(self.save_video)),
            ("saveFile", bool_str(self.save_file)),
            ("saveVoice", bool_str(self.save_voice)),
            ("parseUrl", bool_str(self.parse_url)),
        ]
    }
}

const fn bool_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Accepts a JSON number or string and yields its string form.
fn de_opt_stringish<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_parses_with_missing_message() {
        let envelope: ApiEnvelope<WeChatStatus> =
            serde_json::from_value(json!({"code": 0, "data": {"online": true, "uptime": 12.5}}))
                .unwrap();
        assert_eq!(envelope.code, 0);
        let status = envelope.data.unwrap();
        assert!(status.online);
        assert_eq!(status.uptime, Some(12.5));
    }

    #[test]
    fn remote_message_accepts_numeric_and_string_mtype() {
        let numeric: RemoteMessage =
            serde_json::from_value(json!({"id": "m1", "mtype": 1, "sender": "alice"})).unwrap();
        assert_eq!(numeric.mtype.as_deref(), Some("1"));

        let string: RemoteMessage =
            serde_json::from_value(json!({"id": "m2", "mtype": "10000"})).unwrap();
        assert_eq!(string.mtype.as_deref(), Some("10000"));
    }

    #[test]
    fn messages_payload_groups_by_chat() {
        let payload: MessagesPayload = serde_json::from_value(json!({
            "messages": {
                "alice": [{"id": "m1", "content": "hi"}],
                "dev group": [{"id": "m2"}, {"id": "m3"}]
            }
        }))
        .unwrap();
        assert_eq!(payload.messages["alice"].len(), 1);
        assert_eq!(payload.messages["dev group"].len(), 2);
    }

    #[test]
    fn poll_flags_serialise_as_lowercase_strings() {
        let query = PollFlags::default().as_query();
        assert!(query.contains(&("savePic", "true")));
        assert!(query.contains(&("saveVoice", "false")));
    }
}
