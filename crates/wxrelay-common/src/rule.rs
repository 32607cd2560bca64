//! Delivery rules: routing from (instance, chat, @-mention) to a platform.

use log::warn;
use serde::{Deserialize, Serialize};

/// Prefix marking a chat pattern as a regular expression.
const REGEX_PREFIX: &str = "regex:";

/// One routing rule.
///
/// Selection among matching rules is by `priority` descending, then
/// `rule_id` ascending; the rule engine owns that ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule id.
    pub rule_id: String,
    /// Display name.
    pub name: String,
    /// Instance the rule applies to, or `*` for all.
    pub instance_id: String,
    /// Chat matcher: exact name, `regex:<pattern>`, or `*`.
    pub chat_pattern: String,
    /// Target platform.
    pub platform_id: String,
    /// Higher wins.
    pub priority: i64,
    /// Disabled rules are kept but never match.
    pub enabled: bool,
    /// Only match messages that at-mention `at_name`.
    pub only_at_messages: bool,
    /// Name that must appear as `@<at_name>` when `only_at_messages` is set.
    pub at_name: Option<String>,
    /// Prefix the reply with `@<sender>` for group messages.
    pub reply_at_sender: bool,
}

impl Rule {
    /// Whether the rule covers the given instance.
    #[must_use]
    pub fn matches_instance(&self, instance_id: &str) -> bool {
        self.instance_id == "*" || self.instance_id == instance_id
    }

    /// Whether the chat pattern covers the given chat name.
    ///
    /// An invalid `regex:` pattern matches nothing; the error is logged once
    /// per evaluation rather than failing the whole rule pass.
    #[must_use]
    pub fn matches_chat(&self, chat_name: &str) -> bool {
        if self.chat_pattern == "*" {
            return true;
        }
        if let Some(pattern) = self.chat_pattern.strip_prefix(REGEX_PREFIX) {
            return match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(chat_name),
                Err(e) => {
                    warn!("rule {} has an invalid chat pattern: {e}", self.rule_id);
                    false
                }
            };
        }
        self.chat_pattern == chat_name
    }

    /// Whether the message content satisfies the rule's @-filter.
    ///
    /// Rules without `only_at_messages` always pass. The mention must appear
    /// as a whole `@name` token, matched case-sensitively.
    #[must_use]
    pub fn matches_at_filter(&self, content: &str) -> bool {
        if !self.only_at_messages {
            return true;
        }
        let Some(at_name) = self.at_name.as_deref().filter(|name| !name.is_empty()) else {
            return false;
        };
        content_mentions(content, at_name)
    }
}

/// Whether `content` contains `@<name>` as a whole token.
///
/// The token ends at whitespace, at another `@`, or at the end of content.
/// WeChat inserts U+2005 after group at-mentions, so that is a boundary too.
#[must_use]
pub fn content_mentions(content: &str, name: &str) -> bool {
    let needle = format!("@{name}");
    let mut rest = content;
    while let Some(pos) = rest.find(&needle) {
        let after = &rest[pos + needle.len()..];
        let boundary = after
            .chars()
            .next()
            .is_none_or(|c| c.is_whitespace() || c == '@' || c == '\u{2005}');
        if boundary {
            return true;
        }
        rest = &rest[pos + 1..];
    }
    false
}
