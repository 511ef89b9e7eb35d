use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, instrument, warn};

use super::database::Database;
use super::error::StoreError;
use crate::mqtt::config::ConnectionId;
use crate::mqtt::message_manager::{ContentKind, Direction, Message};

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

/// Most recent `limit` messages of a connection, oldest first.
///
/// Takes a bare connection so background readers can use their own handle.
pub fn load_recent(conn: &Connection, connection_id: ConnectionId, limit: usize) -> Result<Vec<Message>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, topic, payload, outgoing, retained, timestamp FROM messages
         WHERE connection_id = ?1 ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![connection_id.0, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut messages = Vec::with_capacity(rows.len());
    for (id, topic, payload, outgoing, retained, timestamp) in rows.into_iter().rev() {
        let timestamp = match parse_timestamp(&timestamp) {
            Ok(timestamp) => timestamp,
            Err(e) => {
                warn!(message_id = id, raw = %timestamp, "Skipping message with bad timestamp: {}", e);
                continue;
            }
        };
        let payload = payload.unwrap_or_default();
        messages.push(Message {
            id: Some(id),
            connection_id,
            kind: ContentKind::classify(&payload),
            topic,
            payload,
            direction: if outgoing { Direction::Outbound } else { Direction::Inbound },
            retained,
            timestamp,
        });
    }
    Ok(messages)
}

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists a message and returns its row id.
    #[instrument(skip(self, message), fields(connection = %message.connection_id, topic = %message.topic))]
    pub fn save(&self, message: &Message) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (connection_id, topic, payload, outgoing, retained, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.connection_id.0,
                    message.topic,
                    message.payload,
                    message.is_outgoing(),
                    message.retained,
                    format_timestamp(&message.timestamp),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn load_recent(&self, connection_id: ConnectionId, limit: usize) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| load_recent(conn, connection_id, limit))
    }

    /// Deletes every message of a connection and returns how many were removed.
    #[instrument(skip(self), fields(connection = %connection_id))]
    pub fn delete_for(&self, connection_id: ConnectionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM messages WHERE connection_id = ?1", [connection_id.0])?;
            debug!(removed, "messages deleted");
            Ok(removed)
        })
    }

    pub fn count(&self, connection_id: ConnectionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE connection_id = ?1",
                [connection_id.0],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}
