//! Service platform records, per-kind configuration and reply types.
//!
//! The platform trait itself lives in `wxrelay-platforms`; the types here are
//! shared with the delivery side so the two crates stay acyclic.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Configuration keys whose values are masked in [`PlatformDescriptor::safe_config`].
const SENSITIVE_KEYS: [&str; 4] = ["api_key", "token", "secret", "password"];

/// The kind of service platform backing a rule target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Dify chat application (`/chat-messages`, blocking mode).
    Dify,
    /// Any OpenAI-compatible chat completions endpoint.
    Openai,
    /// Coze v3 bot with the create/retrieve/message-list polling flow.
    Coze,
    /// Local keyword matcher; no network I/O.
    Keyword,
    /// The zhiweijz smart-accounting service.
    Zhiweijz,
}

impl PlatformKind {
    /// Stable string form stored in the `type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dify => "dify",
            Self::Openai => "openai",
            Self::Coze => "coze",
            Self::Keyword => "keyword",
            Self::Zhiweijz => "zhiweijz",
        }
    }

    /// Parses the stored string form.
    ///
    /// `keyword_match` is accepted as a legacy alias for `keyword`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dify" => Some(Self::Dify),
            "openai" => Some(Self::Openai),
            "coze" => Some(Self::Coze),
            "keyword" | "keyword_match" => Some(Self::Keyword),
            "zhiweijz" => Some(Self::Zhiweijz),
            _ => None,
        }
    }
}

/// How replies are pushed to the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSendMode {
    /// Single send call with the full text.
    #[default]
    Normal,
    /// Character-paced send through the remote's typing endpoint.
    Typing,
}

/// A platform row as stored: identity plus an opaque, kind-specific config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    /// Unique platform id.
    pub platform_id: String,
    /// Display name.
    pub name: String,
    /// Platform kind; selects the worker implementation.
    pub kind: PlatformKind,
    /// Kind-specific configuration blob.
    pub config: serde_json::Value,
    /// Disabled platforms keep their rows but get no worker.
    pub enabled: bool,
    /// Unix timestamp the row was created.
    pub create_time: i64,
    /// Unix timestamp of the last update.
    pub update_time: i64,
}

impl PlatformDescriptor {
    /// The configured send mode, defaulting to [`MessageSendMode::Normal`].
    #[must_use]
    pub fn send_mode(&self) -> MessageSendMode {
        self.config
            .get("message_send_mode")
            .and_then(serde_json::Value::as_str)
            .and_then(|mode| match mode {
                "typing" => Some(MessageSendMode::Typing),
                "normal" => Some(MessageSendMode::Normal),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// A copy of the config with secret-bearing values masked, for logs and
    /// the admin surface.
    #[must_use]
    pub fn safe_config(&self) -> serde_json::Value {
        let mut config = self.config.clone();
        if let Some(map) = config.as_object_mut() {
            for key in SENSITIVE_KEYS {
                if let Some(value) = map.get_mut(key) {
                    *value = serde_json::Value::String("******".to_string());
                }
            }
        }
        config
    }
}

/// The outcome of one platform invocation.
#[derive(Debug, Default)]
pub struct PlatformReply {
    /// Reply text; may be empty when the platform has nothing to say.
    pub content: String,
    /// Whether the delivery service should push the content to the chat.
    pub should_reply: bool,
    /// New conversation id to persist for continuity, when one was created.
    pub conversation_id: Option<String>,
    /// A previously stored conversation id the upstream no longer knows.
    /// The caller must drop its mapping so the next message starts fresh.
    pub stale_conversation_id: Option<String>,
    /// Raw upstream response, kept for logs.
    pub raw: Option<serde_json::Value>,
}

impl PlatformReply {
    /// A plain text reply.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            should_reply: true,
            ..Self::default()
        }
    }

    /// A reply the caller should not send (matched nothing, irrelevant, ...).
    #[must_use]
    pub fn declined(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            should_reply: false,
            ..Self::default()
        }
    }

    /// Attaches the conversation id to persist.
    #[must_use]
    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Attaches the raw upstream response for logging.
    #[must_use]
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Dify platform configuration.
#[derive(Debug, Deserialize)]
pub struct DifyConfig {
    /// API base, e.g. `https://api.dify.ai/v1`.
    pub api_base: String,
    /// Application API key.
    pub api_key: SecretString,
    /// Legacy app-wide conversation id; per-user ids supersede it.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Fallback `user` field for requests without a derivable user id.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Reply push mode.
    #[serde(default)]
    pub message_send_mode: MessageSendMode,
}

/// OpenAI-compatible platform configuration.
#[derive(Debug, Deserialize)]
pub struct OpenAiConfig {
    /// API base; any chat-completions-compatible endpoint works.
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    /// Bearer API key.
    pub api_key: SecretString,
    /// Model name.
    #[serde(default = "default_openai_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// System prompt prepended to every call.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Completion token cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Reply push mode.
    #[serde(default)]
    pub message_send_mode: MessageSendMode,
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-3.5-turbo".to_string()
}

const fn default_temperature() -> f64 {
    0.7
}

fn default_system_prompt() -> String {
    "你是一个有用的助手。".to_string()
}

const fn default_max_tokens() -> u32 {
    1000
}

/// Coze platform configuration.
#[derive(Debug, Deserialize)]
pub struct CozeConfig {
    /// API base; the public Coze endpoint unless overridden.
    #[serde(default = "default_coze_base")]
    pub api_base: String,
    /// Personal access token.
    pub api_key: SecretString,
    /// Workspace the bot lives in; used by the connection test.
    #[serde(default)]
    pub workspace_id: String,
    /// Bot to converse with.
    pub bot_id: String,
    /// Whether to thread consecutive messages of one user into one
    /// conversation.
    #[serde(default)]
    pub continuous_conversation: bool,
    /// Reply push mode.
    #[serde(default)]
    pub message_send_mode: MessageSendMode,
}

fn default_coze_base() -> String {
    "https://api.coze.cn".to_string()
}

/// How a keyword rule compares message content against its keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Whole-content equality, case-insensitive.
    #[default]
    Exact,
    /// Substring, case-insensitive.
    Contains,
    /// Sequence similarity of at least 0.8, case-insensitive.
    Fuzzy,
}

/// One declarative keyword-reply rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    /// Keywords that trigger the rule.
    pub keywords: Vec<String>,
    /// Comparison mode.
    #[serde(default)]
    pub match_type: MatchType,
    /// Candidate replies.
    pub replies: Vec<String>,
    /// Pick a random reply rather than the first.
    #[serde(default)]
    pub is_random_reply: bool,
    /// Per-rule reply delay floor in seconds; falls back to the platform's.
    #[serde(default)]
    pub min_reply_time: Option<f64>,
    /// Per-rule reply delay ceiling in seconds; falls back to the platform's.
    #[serde(default)]
    pub max_reply_time: Option<f64>,
}

/// Keyword platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordConfig {
    /// Ordered rule list; the first match wins.
    #[serde(default)]
    pub rules: Vec<KeywordRule>,
    /// Default reply delay floor in seconds.
    #[serde(default = "default_min_reply_time")]
    pub min_reply_time: f64,
    /// Default reply delay ceiling in seconds.
    #[serde(default = "default_max_reply_time")]
    pub max_reply_time: f64,
    /// Reply push mode.
    #[serde(default)]
    pub message_send_mode: MessageSendMode,
}

const fn default_min_reply_time() -> f64 {
    1.0
}

const fn default_max_reply_time() -> f64 {
    3.0
}

/// Accounting (zhiweijz) platform configuration.
#[derive(Debug, Deserialize)]
pub struct ZhiweijzConfig {
    /// Accounting server base URL.
    pub server_url: String,
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: SecretString,
    /// Account book bookings are written to.
    pub account_book_id: String,
    /// Display name of the account book, for the connection test output.
    #[serde(default)]
    pub account_book_name: Option<String>,
    /// Re-login automatically when the token is missing or expired.
    #[serde(default = "default_true")]
    pub auto_login: bool,
    /// Send the "irrelevant" notice back to the chat instead of staying
    /// silent when a message has nothing to do with bookkeeping.
    #[serde(default)]
    pub warn_on_irrelevant: bool,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Reply push mode.
    #[serde(default)]
    pub message_send_mode: MessageSendMode,
}

const fn default_true() -> bool {
    true
}

const fn default_request_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn kind_roundtrips_and_accepts_legacy_alias() {
        for kind in [
            PlatformKind::Dify,
            PlatformKind::Openai,
            PlatformKind::Coze,
            PlatformKind::Keyword,
            PlatformKind::Zhiweijz,
        ] {
            assert_eq!(PlatformKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PlatformKind::parse("keyword_match"), Some(PlatformKind::Keyword));
        assert_eq!(PlatformKind::parse("slack"), None);
    }

    #[test]
    fn safe_config_masks_secrets() {
        let descriptor = PlatformDescriptor {
            platform_id: "p1".to_string(),
            name: "test".to_string(),
            kind: PlatformKind::Openai,
            config: json!({"api_key": "sk-123", "model": "gpt-4", "password": "hunter2"}),
            enabled: true,
            create_time: 0,
            update_time: 0,
        };
        let safe = descriptor.safe_config();
        assert_eq!(safe["api_key"], "******");
        assert_eq!(safe["password"], "******");
        assert_eq!(safe["model"], "gpt-4");
    }

    #[test]
    fn send_mode_defaults_to_normal() {
        let mut descriptor = PlatformDescriptor {
            platform_id: "p1".to_string(),
            name: "test".to_string(),
            kind: PlatformKind::Keyword,
            config: json!({}),
            enabled: true,
            create_time: 0,
            update_time: 0,
        };
        assert_eq!(descriptor.send_mode(), MessageSendMode::Normal);
        descriptor.config = json!({"message_send_mode": "typing"});
        assert_eq!(descriptor.send_mode(), MessageSendMode::Typing);
        descriptor.config = json!({"message_send_mode": "morse"});
        assert_eq!(descriptor.send_mode(), MessageSendMode::Normal);
    }

    #[test]
    fn openai_config_fills_defaults() {
        let config: OpenAiConfig = serde_json::from_value(json!({"api_key": "sk-1"})).unwrap();
        assert_eq!(config.api_base, "https://api.openai.com/v1");
        assert_eq!(config.model, "gpt-3.5-turbo");
        assert_eq!(config.max_tokens, 1000);
        assert!((config.temperature - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn keyword_config_parses_rules() {
        let config: KeywordConfig = serde_json::from_value(json!({
            "rules": [
                {"keywords": ["hi"], "match_type": "contains", "replies": ["hello"]},
                {"keywords": ["ping"], "replies": ["pong"], "is_random_reply": true,
                 "min_reply_time": 0.0, "max_reply_time": 0.5}
            ],
            "min_reply_time": 2.0
        }))
        .unwrap();
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].match_type, MatchType::Contains);
        assert_eq!(config.rules[1].match_type, MatchType::Exact);
        assert!((config.min_reply_time - 2.0).abs() < f64::EPSILON);
        assert!((config.max_reply_time - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn zhiweijz_config_defaults() {
        let config: ZhiweijzConfig = serde_json::from_value(json!({
            "server_url": "https://jz.example.com",
            "username": "u",
            "password": "p",
            "account_book_id": "book-1"
        }))
        .unwrap();
        assert!(config.auto_login);
        assert!(!config.warn_on_irrelevant);
        assert_eq!(config.request_timeout, 30);
    }
}
