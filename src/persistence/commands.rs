use rusqlite::{params, Row};

use super::database::Database;
use super::error::StoreError;
use crate::commands::CommandConfig;
use crate::mqtt::config::{ConnectionId, Qos};

const COLUMNS: &str = "id, name, topic, payload, qos, retain, loop_enabled, loop_interval_ms, connection_id";

fn row_to_command(row: &Row<'_>) -> rusqlite::Result<CommandConfig> {
    let interval: i64 = row.get(7)?;
    let connection: i64 = row.get(8)?;
    Ok(CommandConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        topic: row.get(2)?,
        payload: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        qos: Qos::from_level(row.get(4)?),
        retain: row.get(5)?,
        loop_enabled: row.get(6)?,
        loop_interval_ms: u64::try_from(interval).unwrap_or(0),
        connection_id: (connection >= 0).then_some(ConnectionId(connection)),
    })
}

fn connection_column(command: &CommandConfig) -> i64 {
    command.connection_id.map_or(-1, |id| id.0)
}

pub struct CommandRepo {
    db: Database,
}

impl CommandRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, command: &CommandConfig) -> Result<CommandConfig, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO commands (name, topic, payload, qos, retain, loop_enabled, loop_interval_ms, connection_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    command.name,
                    command.topic,
                    command.payload,
                    command.qos.level(),
                    command.retain,
                    command.loop_enabled,
                    command.loop_interval_ms as i64,
                    connection_column(command),
                ],
            )?;
            Ok(CommandConfig {
                id: conn.last_insert_rowid(),
                ..command.clone()
            })
        })
    }

    pub fn update(&self, command: &CommandConfig) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE commands SET name = ?1, topic = ?2, payload = ?3, qos = ?4, retain = ?5,
                 loop_enabled = ?6, loop_interval_ms = ?7, connection_id = ?8 WHERE id = ?9",
                params![
                    command.name,
                    command.topic,
                    command.payload,
                    command.qos.level(),
                    command.retain,
                    command.loop_enabled,
                    command.loop_interval_ms as i64,
                    connection_column(command),
                    command.id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("command {}", command.id)));
            }
            Ok(())
        })
    }

    pub fn get(&self, id: i64) -> Result<CommandConfig, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM commands WHERE id = ?1"),
                [id],
                row_to_command,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("command {id}")),
                other => other.into(),
            })
        })
    }

    pub fn list(&self) -> Result<Vec<CommandConfig>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM commands ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_command)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Commands shown for `connection_id`: its own plus those for every connection.
    pub fn list_for(&self, connection_id: ConnectionId) -> Result<Vec<CommandConfig>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM commands WHERE connection_id = ?1 OR connection_id < 0 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map([connection_id.0], row_to_command)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM commands WHERE id = ?1", [id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_listing_and_round_trip() {
        let repo = CommandRepo::new(Database::in_memory().unwrap());
        let everywhere = repo
            .insert(&CommandConfig {
                name: "ping".to_string(),
                topic: "ping".to_string(),
                ..CommandConfig::default()
            })
            .unwrap();
        let scoped = repo
            .insert(&CommandConfig {
                name: "lamp".to_string(),
                topic: "lamp/set".to_string(),
                payload: "on".to_string(),
                qos: Qos::AtLeastOnce,
                loop_enabled: true,
                loop_interval_ms: 250,
                connection_id: Some(ConnectionId(2)),
                ..CommandConfig::default()
            })
            .unwrap();

        assert_eq!(repo.list_for(ConnectionId(1)).unwrap(), vec![everywhere.clone()]);
        assert_eq!(repo.list_for(ConnectionId(2)).unwrap(), vec![everywhere, scoped.clone()]);
        assert_eq!(repo.get(scoped.id).unwrap(), scoped);
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let repo = CommandRepo::new(Database::in_memory().unwrap());
        let command = repo
            .insert(&CommandConfig {
                topic: "t".to_string(),
                ..CommandConfig::default()
            })
            .unwrap();
        repo.delete(command.id).unwrap();
        assert!(matches!(repo.get(command.id), Err(StoreError::NotFound(_))));
    }
}
