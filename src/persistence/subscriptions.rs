use rusqlite::params;
use tracing::instrument;

use super::database::Database;
use super::error::StoreError;
use crate::mqtt::config::{ConnectionId, Qos, Subscription};

pub struct SubscriptionRepo {
    db: Database,
}

impl SubscriptionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stores a subscription; subscribing to the same filter again only updates its QoS.
    #[instrument(skip(self), fields(connection = %connection_id))]
    pub fn upsert(&self, connection_id: ConnectionId, topic: &str, qos: Qos) -> Result<Subscription, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subscriptions (connection_id, topic, qos) VALUES (?1, ?2, ?3)
                 ON CONFLICT (connection_id, topic) DO UPDATE SET qos = excluded.qos",
                params![connection_id.0, topic, qos.level()],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM subscriptions WHERE connection_id = ?1 AND topic = ?2",
                params![connection_id.0, topic],
                |row| row.get(0),
            )?;
            Ok(Subscription {
                id,
                connection_id,
                topic: topic.to_string(),
                qos,
            })
        })
    }

    pub fn list_for(&self, connection_id: ConnectionId) -> Result<Vec<Subscription>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, topic, qos FROM subscriptions WHERE connection_id = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map([connection_id.0], |row| {
                    Ok(Subscription {
                        id: row.get(0)?,
                        connection_id,
                        topic: row.get(1)?,
                        qos: Qos::from_level(row.get(2)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns whether a row was removed.
    pub fn remove(&self, connection_id: ConnectionId, topic: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM subscriptions WHERE connection_id = ?1 AND topic = ?2",
                params![connection_id.0, topic],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn delete_for(&self, connection_id: ConnectionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM subscriptions WHERE connection_id = ?1", [connection_id.0])?)
        })
    }
}
