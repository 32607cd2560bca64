//! Keyword matcher platform: declarative rules, no network I/O.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::Rng;
use rand::seq::IndexedRandom;

use wxrelay_common::{
    KeywordConfig, KeywordRule, MatchType, MessageSendMode, PlatformDescriptor, PlatformKind,
    PlatformReply,
};

use crate::error::{PlatformError, Result};
use crate::{Platform, PlatformRequest};

/// Similarity threshold for fuzzy matches.
const FUZZY_THRESHOLD: f64 = 0.8;

/// Keyword-reply platform.
pub struct KeywordPlatform {
    id: String,
    name: String,
    config: KeywordConfig,
}

impl KeywordPlatform {
    /// Builds the platform from a stored descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Config`] for a malformed config blob or an
    /// inverted default delay range.
    pub fn from_descriptor(descriptor: &PlatformDescriptor) -> Result<Self> {
        let config: KeywordConfig = serde_json::from_value(descriptor.config.clone())
            .map_err(|e| PlatformError::Config(format!("keyword config: {e}")))?;
        validate(&config)?;
        Ok(Self {
            id: descriptor.platform_id.clone(),
            name: descriptor.name.clone(),
            config,
        })
    }

    fn find_match(&self, content: &str) -> Option<&KeywordRule> {
        self.config
            .rules
            .iter()
            .find(|rule| matches_rule(content, rule))
    }
}

fn validate(config: &KeywordConfig) -> Result<()> {
    if config.min_reply_time < 0.0 || config.max_reply_time < 0.0 {
        return Err(PlatformError::Config(
            "reply delays must be non-negative".to_string(),
        ));
    }
    for (index, rule) in config.rules.iter().enumerate() {
        if rule.keywords.is_empty() {
            return Err(PlatformError::Config(format!(
                "rule #{} has no keywords",
                index + 1
            )));
        }
        if rule.replies.is_empty() {
            return Err(PlatformError::Config(format!(
                "rule #{} has no replies",
                index + 1
            )));
        }
    }
    Ok(())
}

fn matches_rule(content: &str, rule: &KeywordRule) -> bool {
    let content_lower = content.to_lowercase();
    rule.keywords.iter().any(|keyword| {
        let keyword_lower = keyword.to_lowercase();
        match rule.match_type {
            MatchType::Exact => content_lower == keyword_lower,
            MatchType::Contains => content_lower.contains(&keyword_lower),
            MatchType::Fuzzy => similarity(&content_lower, &keyword_lower) >= FUZZY_THRESHOLD,
        }
    })
}

/// Sequence similarity in `[0, 1]`: twice the longest common subsequence
/// over the summed lengths, the classic ratio measure.
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut previous = vec![0_usize; b.len() + 1];
    let mut current = vec![0_usize; b.len() + 1];
    for ch_a in &a {
        for (j, ch_b) in b.iter().enumerate() {
            current[j + 1] = if ch_a == ch_b {
                previous[j] + 1
            } else {
                previous[j + 1].max(current[j])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    let lcs = previous[b.len()];
    #[allow(clippy::cast_precision_loss)]
    {
        2.0 * lcs as f64 / (a.len() + b.len()) as f64
    }
}

#[async_trait]
impl Platform for KeywordPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Keyword
    }

    fn send_mode(&self) -> MessageSendMode {
        self.config.message_send_mode
    }

    async fn test_connection(&self) -> Result<serde_json::Value> {
        // No upstream; the probe is the structural validation plus a summary.
        validate(&self.config)?;
        Ok(serde_json::json!({
            "rules_count": self.config.rules.len(),
            "min_reply_time": self.config.min_reply_time,
            "max_reply_time": self.config.max_reply_time,
        }))
    }

    async fn process_message(&self, request: &PlatformRequest) -> Result<PlatformReply> {
        let Some(rule) = self.find_match(&request.content) else {
            debug!("no keyword rule matched for {}", request.message_id);
            return Ok(PlatformReply::declined(""));
        };

        let (reply, delay) = {
            let mut rng = rand::rng();
            let reply = if rule.is_random_reply && rule.replies.len() > 1 {
                rule.replies
                    .choose(&mut rng)
                    .cloned()
                    .unwrap_or_default()
            } else {
                rule.replies.first().cloned().unwrap_or_default()
            };

            let mut min = rule.min_reply_time.unwrap_or(self.config.min_reply_time);
            let mut max = rule.max_reply_time.unwrap_or(self.config.max_reply_time);
            if min > max {
                std::mem::swap(&mut min, &mut max);
            }
            let delay = if max > min {
                rng.random_range(min..=max)
            } else {
                min
            };
            (reply, delay)
        };

        if delay > 0.0 {
            info!("keyword reply delayed {delay:.2}s for {}", request.message_id);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        Ok(PlatformReply::text(reply).with_raw(serde_json::json!({
            "matched_keywords": rule.keywords,
            "delay_seconds": delay,
        })))
    }
}
