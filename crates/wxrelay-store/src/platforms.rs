//! Platform and rule persistence.

use rusqlite::{OptionalExtension, Row, params};

use wxrelay_common::{PlatformDescriptor, PlatformKind, Rule};

use crate::db::Store;
use crate::error::{Result, StoreError};

fn platform_from_row(row: &Row<'_>) -> rusqlite::Result<(PlatformDescriptor, bool)> {
    let kind: String = row.get(2)?;
    let config: String = row.get(3)?;
    let parsed_kind = PlatformKind::parse(&kind);
    Ok((
        PlatformDescriptor {
            platform_id: row.get(0)?,
            name: row.get(1)?,
            // Unknown kinds are surfaced to the caller via the bool flag.
            kind: parsed_kind.unwrap_or(PlatformKind::Keyword),
            config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
            enabled: row.get::<_, i64>(4)? != 0,
            create_time: row.get(5)?,
            update_time: row.get(6)?,
        },
        parsed_kind.is_some(),
    ))
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<Rule> {
    Ok(Rule {
        rule_id: row.get(0)?,
        name: row.get(1)?,
        instance_id: row.get(2)?,
        chat_pattern: row.get(3)?,
        platform_id: row.get(4)?,
        priority: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        only_at_messages: row.get::<_, i64>(7)? != 0,
        at_name: row.get(8)?,
        reply_at_sender: row.get::<_, i64>(9)? != 0,
    })
}

const RULE_COLUMNS: &str = "rule_id, name, instance_id, chat_pattern, platform_id, priority, \
     enabled, only_at_messages, at_name, reply_at_sender";

impl Store {
    /// Inserts or updates a platform row.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn upsert_platform(&self, descriptor: PlatformDescriptor) -> Result<()> {
        self.run(move |conn| {
            let config = serde_json::to_string(&descriptor.config)?;
            conn.execute(
                "INSERT INTO service_platforms
                     (platform_id, name, type, config, enabled, create_time, update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(platform_id) DO UPDATE SET
                     name = excluded.name,
                     type = excluded.type,
                     config = excluded.config,
                     enabled = excluded.enabled,
                     update_time = excluded.update_time",
                params![
                    descriptor.platform_id,
                    descriptor.name,
                    descriptor.kind.as_str(),
                    config,
                    i64::from(descriptor.enabled),
                    descriptor.create_time,
                    descriptor.update_time,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Fetches one platform row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for missing or unknown-kind rows.
    pub async fn get_platform(&self, platform_id: String) -> Result<PlatformDescriptor> {
        self.run_read(move |conn| {
            let row = conn
                .query_row(
                    "SELECT platform_id, name, type, config, enabled, create_time, update_time
                     FROM service_platforms WHERE platform_id = ?1",
                    params![platform_id],
                    platform_from_row,
                )
                .optional()?;
            match row {
                Some((descriptor, true)) => Ok(descriptor),
                Some((descriptor, false)) => Err(StoreError::NotFound(format!(
                    "platform {} has an unknown type",
                    descriptor.platform_id
                ))),
                None => Err(StoreError::NotFound(format!("platform {platform_id}"))),
            }
        })
        .await
    }

    /// Lists platform rows. Rows with an unrecognised type are skipped.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn list_platforms(&self, enabled_only: bool) -> Result<Vec<PlatformDescriptor>> {
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT platform_id, name, type, config, enabled, create_time, update_time
                 FROM service_platforms
                 WHERE (?1 = 0 OR enabled = 1)
                 ORDER BY platform_id",
            )?;
            let platforms = stmt
                .query_map(params![i64::from(enabled_only)], platform_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .filter_map(|(descriptor, known)| known.then_some(descriptor))
                .collect();
            Ok(platforms)
        })
        .await
    }

    /// Deletes a platform row.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn delete_platform(&self, platform_id: String) -> Result<bool> {
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM service_platforms WHERE platform_id = ?1",
                params![platform_id],
            )?;
            Ok(deleted == 1)
        })
        .await
    }

    /// Inserts or updates a rule row.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn upsert_rule(&self, rule: Rule, now: i64) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO delivery_rules
                     (rule_id, name, instance_id, chat_pattern, platform_id, priority, enabled,
                      only_at_messages, at_name, reply_at_sender, create_time, update_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT(rule_id) DO UPDATE SET
                     name = excluded.name,
                     instance_id = excluded.instance_id,
                     chat_pattern = excluded.chat_pattern,
                     platform_id = excluded.platform_id,
                     priority = excluded.priority,
                     enabled = excluded.enabled,
                     only_at_messages = excluded.only_at_messages,
                     at_name = excluded.at_name,
                     reply_at_sender = excluded.reply_at_sender,
                     update_time = excluded.update_time",
                params![
                    rule.rule_id,
                    rule.name,
                    rule.instance_id,
                    rule.chat_pattern,
                    rule.platform_id,
                    rule.priority,
                    i64::from(rule.enabled),
                    i64::from(rule.only_at_messages),
                    rule.at_name,
                    i64::from(rule.reply_at_sender),
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Lists all rules in the rule engine's selection order: priority
    /// descending, then rule id ascending.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        self.run_read(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM delivery_rules
                 ORDER BY priority DESC, rule_id ASC"
            ))?;
            let rules = stmt
                .query_map([], rule_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rules)
        })
        .await
    }

    /// Fetches one rule row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for missing rules.
    pub async fn get_rule(&self, rule_id: String) -> Result<Rule> {
        self.run_read(move |conn| {
            conn.query_row(
                &format!("SELECT {RULE_COLUMNS} FROM delivery_rules WHERE rule_id = ?1"),
                params![rule_id],
                rule_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("rule {rule_id}")))
        })
        .await
    }

    /// Deletes a rule row.
    ///
    /// # Errors
    ///
    /// Returns any database failure.
    pub async fn delete_rule(&self, rule_id: String) -> Result<bool> {
        self.run(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM delivery_rules WHERE rule_id = ?1",
                params![rule_id],
            )?;
            Ok(deleted == 1)
        })
        .await
    }
}
