use rusqlite::{params, Row};
use std::path::PathBuf;
use tracing::{info, instrument};

use super::database::Database;
use super::error::StoreError;
use crate::mqtt::config::{ConnectionId, ConnectionProfile, TlsSettings};

const COLUMNS: &str = "id, name, host, port, username, password, client_id, use_tls, \
                       ca_cert_path, client_cert_path, client_key_path, clean_session, keep_alive";

fn path_column(raw: Option<String>) -> Option<PathBuf> {
    raw.filter(|s| !s.is_empty()).map(PathBuf::from)
}

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<ConnectionProfile> {
    let use_tls: bool = row.get(7)?;
    let tls = if use_tls {
        Some(TlsSettings {
            ca_cert_path: path_column(row.get(8)?),
            client_cert_path: path_column(row.get(9)?),
            client_key_path: path_column(row.get(10)?),
        })
    } else {
        None
    };
    let port: i64 = row.get(3)?;
    let keep_alive: i64 = row.get(12)?;
    Ok(ConnectionProfile {
        id: ConnectionId(row.get(0)?),
        name: row.get(1)?,
        host: row.get(2)?,
        port: u16::try_from(port).unwrap_or(1883),
        username: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        password: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        client_id: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        tls,
        clean_session: row.get(11)?,
        keep_alive_secs: u16::try_from(keep_alive).unwrap_or(60),
    })
}

pub struct ProfileRepo {
    db: Database,
}

impl ProfileRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new profile and returns it with its assigned id.
    #[instrument(skip(self, profile), fields(name = %profile.name))]
    pub fn insert(&self, profile: &ConnectionProfile) -> Result<ConnectionProfile, StoreError> {
        let tls = profile.tls.clone().unwrap_or_default();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connections (name, host, port, username, password, client_id, use_tls,
                 ca_cert_path, client_cert_path, client_key_path, clean_session, keep_alive)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    profile.name,
                    profile.host,
                    profile.port,
                    profile.username,
                    profile.password,
                    profile.client_id,
                    profile.uses_tls(),
                    path_text(&tls.ca_cert_path),
                    path_text(&tls.client_cert_path),
                    path_text(&tls.client_key_path),
                    profile.clean_session,
                    profile.keep_alive_secs,
                ],
            )?;
            let id = ConnectionId(conn.last_insert_rowid());
            info!(connection = %id, "profile created");
            Ok(ConnectionProfile {
                id,
                ..profile.clone()
            })
        })
    }

    #[instrument(skip(self, profile), fields(connection = %profile.id))]
    pub fn update(&self, profile: &ConnectionProfile) -> Result<(), StoreError> {
        let tls = profile.tls.clone().unwrap_or_default();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE connections SET name = ?1, host = ?2, port = ?3, username = ?4, password = ?5,
                 client_id = ?6, use_tls = ?7, ca_cert_path = ?8, client_cert_path = ?9,
                 client_key_path = ?10, clean_session = ?11, keep_alive = ?12 WHERE id = ?13",
                params![
                    profile.name,
                    profile.host,
                    profile.port,
                    profile.username,
                    profile.password,
                    profile.client_id,
                    profile.uses_tls(),
                    path_text(&tls.ca_cert_path),
                    path_text(&tls.client_cert_path),
                    path_text(&tls.client_key_path),
                    profile.clean_session,
                    profile.keep_alive_secs,
                    profile.id.0,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("connection {}", profile.id)));
            }
            Ok(())
        })
    }

    pub fn get(&self, id: ConnectionId) -> Result<ConnectionProfile, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM connections WHERE id = ?1"),
                [id.0],
                row_to_profile,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(format!("connection {id}")),
                other => other.into(),
            })
        })
    }

    pub fn list(&self) -> Result<Vec<ConnectionProfile>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM connections ORDER BY id"))?;
            let rows = stmt.query_map([], row_to_profile)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    #[instrument(skip(self), fields(connection = %id))]
    pub fn delete(&self, id: ConnectionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM connections WHERE id = ?1", [id.0])?;
            Ok(())
        })
    }
}
