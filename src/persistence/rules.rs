use rusqlite::{params, Row};
use tracing::instrument;

use super::database::Database;
use super::error::StoreError;
use crate::automation::rule::{Rule, RuleScope, TriggerCondition};
use crate::mqtt::config::{ConnectionId, Qos};

const COLUMNS: &str = "id, name, enabled, trigger_topic, trigger_condition, trigger_value, \
                       response_topic, response_payload, response_qos, response_retain, delay_ms, connection_id";

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let condition: String = row.get(4)?;
    Ok(Rule {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get(2)?,
        trigger_topic: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        condition: TriggerCondition::parse(&condition),
        condition_value: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        response_topic: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        response_payload: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        response_qos: Qos::from_level(row.get(8)?),
        response_retain: row.get(9)?,
        delay_ms: row.get(10)?,
        scope: RuleScope::from_raw(row.get(11)?),
    })
}

/// Automation rules, stored in the `scripts` table.
pub struct RuleRepo {
    db: Database,
}

impl RuleRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, rule), fields(name = %rule.name))]
    pub fn insert(&self, rule: &Rule) -> Result<Rule, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scripts (name, enabled, trigger_topic, trigger_condition, trigger_value,
                 response_topic, response_payload, response_qos, response_retain, delay_ms, connection_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    rule.name,
                    rule.enabled,
                    rule.trigger_topic,
                    rule.condition.as_str(),
                    rule.condition_value,
                    rule.response_topic,
                    rule.response_payload,
                    rule.response_qos.level(),
                    rule.response_retain,
                    rule.delay_ms,
                    rule.scope.to_raw(),
                ],
            )?;
            Ok(Rule {
                id: conn.last_insert_rowid(),
                ..rule.clone()
            })
        })
    }

    #[instrument(skip(self, rule), fields(rule_id = rule.id))]
    pub fn update(&self, rule: &Rule) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scripts SET name = ?1, enabled = ?2, trigger_topic = ?3, trigger_condition = ?4,
                 trigger_value = ?5, response_topic = ?6, response_payload = ?7, response_qos = ?8,
                 response_retain = ?9, delay_ms = ?10, connection_id = ?11 WHERE id = ?12",
                params![
                    rule.name,
                    rule.enabled,
                    rule.trigger_topic,
                    rule.condition.as_str(),
                    rule.condition_value,
                    rule.response_topic,
                    rule.response_payload,
                    rule.response_qos.level(),
                    rule.response_retain,
                    rule.delay_ms,
                    rule.scope.to_raw(),
                    rule.id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("rule {}", rule.id)));
            }
            Ok(())
        })
    }

    pub fn get(&self, id: i64) -> Result<Rule, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(&format!("SELECT {COLUMNS} FROM scripts WHERE id = ?1"), [id], row_to_rule)
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("rule {id}")),
                    other => other.into(),
                })
        })
    }

    pub fn list(&self) -> Result<Vec<Rule>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM scripts ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_rule)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Rules owned by `connection_id` plus those for all connections, in id order.
    pub fn list_for(&self, connection_id: ConnectionId) -> Result<Vec<Rule>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM scripts WHERE connection_id = ?1 OR connection_id < 0 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([connection_id.0], row_to_rule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM scripts WHERE id = ?1", [id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RuleRepo {
        RuleRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn insert_round_trip() {
        let repo = repo();
        let rule = repo
            .insert(&Rule {
                name: "alarm".to_string(),
                trigger_topic: "sensors/+/temp".to_string(),
                condition: TriggerCondition::Regex,
                condition_value: r"^\d{2,}".to_string(),
                response_topic: "alerts".to_string(),
                response_qos: Qos::ExactlyOnce,
                delay_ms: 1500,
                scope: RuleScope::Connection(ConnectionId(4)),
                ..Rule::default()
            })
            .unwrap();

        assert_eq!(repo.list().unwrap(), vec![rule.clone()]);
        assert_eq!(repo.get(rule.id).unwrap(), rule);
        assert!(matches!(repo.get(rule.id + 1), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn unknown_condition_kind_survives_storage() {
        let repo = repo();
        repo.insert(&Rule {
            condition: TriggerCondition::Unknown("lessThan".to_string()),
            ..Rule::default()
        })
        .unwrap();
        assert_eq!(
            repo.list().unwrap()[0].condition,
            TriggerCondition::Unknown("lessThan".to_string())
        );
    }

    #[test]
    fn list_for_includes_global_rules() {
        let repo = repo();
        let global = repo.insert(&Rule::default()).unwrap();
        let own = repo
            .insert(&Rule {
                scope: RuleScope::Connection(ConnectionId(1)),
                ..Rule::default()
            })
            .unwrap();
        repo.insert(&Rule {
            scope: RuleScope::Connection(ConnectionId(2)),
            ..Rule::default()
        })
        .unwrap();

        let ids: Vec<_> = repo.list_for(ConnectionId(1)).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![global.id, own.id]);
    }

    #[test]
    fn update_missing_rule_is_not_found() {
        let repo = repo();
        let mut rule = repo.insert(&Rule::default()).unwrap();
        rule.enabled = false;
        repo.update(&rule).unwrap();
        assert!(!repo.list().unwrap()[0].enabled);

        repo.delete(rule.id).unwrap();
        assert!(matches!(repo.update(&rule), Err(StoreError::NotFound(_))));
    }
}
