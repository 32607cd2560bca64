//! Rule engine: picks the platform for an inbound message.

use std::sync::{Arc, RwLock};

use tracing::debug;

use wxrelay_common::Rule;
use wxrelay_store::Store;

use crate::error::Result;

/// Selects delivery rules against a read-copy-updated snapshot.
///
/// [`RuleEngine::reload`] builds a fresh snapshot from the store and swaps it
/// atomically; in-flight resolutions keep the snapshot they started with.
pub struct RuleEngine {
    store: Store,
    snapshot: RwLock<Arc<Vec<Rule>>>,
}

impl RuleEngine {
    /// Builds an engine with an empty snapshot; call
    /// [`RuleEngine::reload`] before first use.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Rebuilds the rule snapshot from the store.
    ///
    /// # Errors
    ///
    /// Returns the store failure; the previous snapshot stays in place.
    pub async fn reload(&self) -> Result<()> {
        let rules = self.store.list_rules().await?;
        debug!(count = rules.len(), "rule snapshot reloaded");
        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = Arc::new(rules);
        }
        Ok(())
    }

    /// Resolves the winning rule for a message, if any.
    ///
    /// Rules are filtered by enabled flag, instance, chat pattern and
    /// @-mention requirement; the store already orders them by priority
    /// descending then rule id ascending, so the first survivor wins and the
    /// selection is deterministic for fixed inputs.
    #[must_use]
    pub fn resolve(&self, instance_id: &str, chat_name: &str, content: &str) -> Option<Rule> {
        match self.resolve_detailed(instance_id, chat_name, content) {
            RuleResolution::Matched(rule) => Some(rule),
            _ => None,
        }
    }

    /// Like [`RuleEngine::resolve`], but distinguishes "no rule covers this
    /// chat" from "a rule would have matched but its @-mention is missing",
    /// so the delivery outcome can record the right skip reason.
    #[must_use]
    pub fn resolve_detailed(
        &self,
        instance_id: &str,
        chat_name: &str,
        content: &str,
    ) -> RuleResolution {
        let Ok(snapshot) = self.snapshot.read().map(|guard| Arc::clone(&guard)) else {
            return RuleResolution::NoRule;
        };
        let mut missed_mention = false;
        for rule in snapshot.iter() {
            if !(rule.enabled
                && rule.matches_instance(instance_id)
                && rule.matches_chat(chat_name))
            {
                continue;
            }
            if rule.matches_at_filter(content) {
                return RuleResolution::Matched(rule.clone());
            }
            missed_mention = true;
        }
        if missed_mention {
            RuleResolution::MissedMention
        } else {
            RuleResolution::NoRule
        }
    }
}

/// Outcome of a rule resolution.
#[derive(Debug, Clone)]
pub enum RuleResolution {
    /// A rule matched; route to its platform.
    Matched(Rule),
    /// Only @-restricted rules covered the chat and the mention is missing.
    MissedMention,
    /// Nothing covers this message.
    NoRule,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn rule(rule_id: &str, instance_id: &str, chat_pattern: &str, priority: i64) -> Rule {
        Rule {
            rule_id: rule_id.to_string(),
            name: rule_id.to_string(),
            instance_id: instance_id.to_string(),
            chat_pattern: chat_pattern.to_string(),
            platform_id: format!("platform-of-{rule_id}"),
            priority,
            enabled: true,
            only_at_messages: false,
            at_name: None,
            reply_at_sender: false,
        }
    }

    async fn engine_with(rules: Vec<Rule>) -> RuleEngine {
        let store = Store::open_in_memory().unwrap();
        for rule in rules {
            store.upsert_rule(rule, 1).await.unwrap();
        }
        let engine = RuleEngine::new(store);
        engine.reload().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn highest_priority_wins_with_rule_id_tiebreak() {
        let engine = engine_with(vec![
            rule("r-b", "*", "*", 5),
            rule("r-a", "*", "*", 5),
            rule("r-low", "*", "*", 1),
        ])
        .await;

        // Deterministic for fixed inputs: priority desc, rule_id asc.
        for _ in 0..3 {
            let winner = engine.resolve("inst", "chat", "hello").unwrap();
            assert_eq!(winner.rule_id, "r-a");
        }
    }

    #[tokio::test]
    async fn instance_specific_beats_nothing_but_respects_filters() {
        let engine = engine_with(vec![
            rule("r-other", "inst-2", "*", 10),
            rule("r-mine", "inst-1", "*", 1),
        ])
        .await;

        let winner = engine.resolve("inst-1", "chat", "hello").unwrap();
        assert_eq!(winner.rule_id, "r-mine");
    }

    #[tokio::test]
    async fn disabled_rules_never_match() {
        let mut disabled = rule("r-off", "*", "*", 10);
        disabled.enabled = false;
        let engine = engine_with(vec![disabled, rule("r-on", "*", "*", 1)]).await;

        let winner = engine.resolve("inst", "chat", "hello").unwrap();
        assert_eq!(winner.rule_id, "r-on");
    }

    #[tokio::test]
    async fn at_filter_drops_unmentioned_messages() {
        let mut at_rule = rule("r-at", "*", "*", 10);
        at_rule.only_at_messages = true;
        at_rule.at_name = Some("bot".to_string());
        let engine = engine_with(vec![at_rule]).await;

        assert!(engine.resolve("inst", "grp", "hello").is_none());
        let winner = engine.resolve("inst", "grp", "@bot hello").unwrap();
        assert_eq!(winner.rule_id, "r-at");
    }

    #[tokio::test]
    async fn regex_patterns_select_by_chat() {
        let engine = engine_with(vec![rule("r-dev", "*", "regex:^dev .*", 1)]).await;
        assert!(engine.resolve("inst", "dev group", "x").is_some());
        assert!(engine.resolve("inst", "ops group", "x").is_none());
    }

    #[tokio::test]
    async fn missed_mention_is_distinguished_from_no_rule() {
        let mut at_rule = rule("r-at", "*", "grp", 10);
        at_rule.only_at_messages = true;
        at_rule.at_name = Some("bot".to_string());
        let engine = engine_with(vec![at_rule]).await;

        assert!(matches!(
            engine.resolve_detailed("inst", "grp", "hello"),
            RuleResolution::MissedMention
        ));
        assert!(matches!(
            engine.resolve_detailed("inst", "other-chat", "hello"),
            RuleResolution::NoRule
        ));
        assert!(matches!(
            engine.resolve_detailed("inst", "grp", "@bot hello"),
            RuleResolution::Matched(_)
        ));
    }

    #[tokio::test]
    async fn no_rules_means_no_route() {
        let engine = engine_with(vec![]).await;
        assert!(engine.resolve("inst", "chat", "hello").is_none());
    }

    #[tokio::test]
    async fn reload_picks_up_new_rules() {
        let store = Store::open_in_memory().unwrap();
        let engine = RuleEngine::new(store.clone());
        engine.reload().await.unwrap();
        assert!(engine.resolve("inst", "chat", "x").is_none());

        store.upsert_rule(rule("r-new", "*", "*", 1), 2).await.unwrap();
        engine.reload().await.unwrap();
        assert!(engine.resolve("inst", "chat", "x").is_some());
    }
}
