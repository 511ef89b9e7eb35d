/// SQL DDL for the assistant database.
/// Connection id `-1` in `commands` and `scripts` means "all connections".
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    host TEXT NOT NULL DEFAULT 'localhost',
    port INTEGER NOT NULL DEFAULT 1883,
    username TEXT,
    password TEXT,
    client_id TEXT,
    use_tls INTEGER NOT NULL DEFAULT 0,
    ca_cert_path TEXT,
    client_cert_path TEXT,
    client_key_path TEXT,
    clean_session INTEGER NOT NULL DEFAULT 1,
    keep_alive INTEGER NOT NULL DEFAULT 60
);

CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    topic TEXT NOT NULL,
    payload TEXT,
    qos INTEGER NOT NULL DEFAULT 0,
    retain INTEGER NOT NULL DEFAULT 0,
    loop_enabled INTEGER NOT NULL DEFAULT 0,
    loop_interval_ms INTEGER NOT NULL DEFAULT 1000,
    connection_id INTEGER NOT NULL DEFAULT -1
);

CREATE TABLE IF NOT EXISTS scripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    trigger_topic TEXT,
    trigger_condition TEXT NOT NULL DEFAULT 'any',
    trigger_value TEXT,
    response_topic TEXT,
    response_payload TEXT,
    response_qos INTEGER NOT NULL DEFAULT 0,
    response_retain INTEGER NOT NULL DEFAULT 0,
    delay_ms INTEGER NOT NULL DEFAULT 0,
    connection_id INTEGER NOT NULL DEFAULT -1
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL,
    topic TEXT NOT NULL,
    qos INTEGER NOT NULL DEFAULT 0,
    UNIQUE (connection_id, topic)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    connection_id INTEGER NOT NULL,
    topic TEXT NOT NULL,
    payload TEXT,
    outgoing INTEGER NOT NULL DEFAULT 0,
    retained INTEGER NOT NULL DEFAULT 0,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_connection ON messages(connection_id, id);
CREATE INDEX IF NOT EXISTS idx_subscriptions_connection ON subscriptions(connection_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// Background readers never write and never touch the schema.
pub const READER_PRAGMAS: &str = r#"
PRAGMA busy_timeout = 5000;
PRAGMA query_only = ON;
"#;
