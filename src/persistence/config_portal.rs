//! # Configuration Portal
//!
//! Holds the scalar settings of the assistant (database location, topic
//! history, session cap, history size, log level, profiles to connect on
//! start) and writes them back to a TOML file.
//!
//! ## Access Pattern
//!
//! Settings live behind an `Arc<RwLock<Settings>>`. Callers go through
//! [`ConfigPortal::execute_portal_action`], which acquires the lock with the
//! bounded retry of [`try_lock!`](crate::try_lock) and answers with a typed
//! [`ConfigResult`]:
//!
//! ```text
//! PortalAction ──► try_lock! (5 × 10ms) ──► Settings ──► ConfigResult
//! ```
//!
//! Lock contention never blocks indefinitely; after the last attempt the
//! action fails with [`ConfigError::LockTimeout`].

use crate::try_lock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/mqttassistant";
const CONFIG_FILE: &str = "settings.toml";
const DATA_DIR: &str = ".local/share/mqttassistant";
const DATABASE_FILE: &str = "mqtt_assistant.db";

/// Entries kept in the publish topic history.
pub const TOPIC_HISTORY_CAP: usize = 20;

/// Scalar settings persisted between runs.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// `None` uses the default location under the home directory
    pub database_path: Option<PathBuf>,
    /// Most recently published topics, newest first
    pub topic_history: Vec<String>,
    pub max_sessions: usize,
    /// Records fetched per history load
    pub history_limit: usize,
    pub log_level: String,
    /// Profile ids connected on start; the first becomes active
    pub autoconnect: Vec<i64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: None,
            topic_history: Vec::new(),
            max_sessions: 5,
            history_limit: 100,
            log_level: "info".to_string(),
            autoconnect: Vec::new(),
        }
    }
}

impl Settings {
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(default_database_path)
    }

    /// Moves `topic` to the front of the history, dropping duplicates and
    /// anything beyond [`TOPIC_HISTORY_CAP`].
    pub fn push_topic(&mut self, topic: &str) {
        let topic = topic.trim();
        if topic.is_empty() {
            return;
        }
        self.topic_history.retain(|t| t != topic);
        self.topic_history.insert(0, topic.to_string());
        self.topic_history.truncate(TOPIC_HISTORY_CAP);
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

pub fn default_config_path() -> PathBuf {
    get_home_dir().join(CONFIG_DIR).join(CONFIG_FILE)
}

pub fn default_database_path() -> PathBuf {
    get_home_dir().join(DATA_DIR).join(DATABASE_FILE)
}

#[derive(Debug)]
pub struct ConfigPortal {
    pub settings: Arc<RwLock<Settings>>,
    path: PathBuf,
}

impl ConfigPortal {
    pub fn new(settings: Settings, path: PathBuf) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a default settings file when none exists yet.
    pub async fn ensure_default_config(path: &Path) -> Result<(), ConfigError> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| ConfigError::Io(format!("Failed to check settings file: {}", e)))?
        {
            return Ok(());
        }
        info!(path = %path.display(), "Creating default settings");
        write_settings(path, &Settings::default()).await
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(format!("Failed to read settings file: {}", e)))?;
        let settings: Settings =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(format!("Failed to parse settings: {}", e)))?;
        debug!(path = %path.display(), "Settings loaded");
        Ok(Self::new(settings, path.to_path_buf()))
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        let snapshot = self.settings.read().await.clone();
        write_settings(&self.path, &snapshot).await?;
        debug!(path = %self.path.display(), "Settings saved");
        Ok(())
    }

    pub fn execute_portal_action(&self, action: PortalAction) -> ConfigResult {
        let result = match action {
            PortalAction::GetSettings => {
                try_lock!(@read_lock_retry, self.settings.clone(), |guard: &Settings| {
                    ConfigResult::Settings(guard.clone())
                })
            }
            PortalAction::GetDatabasePath => {
                try_lock!(@read_lock_retry, self.settings.clone(), |guard: &Settings| {
                    ConfigResult::PathBuf(guard.resolved_database_path())
                })
            }
            PortalAction::GetTopicHistory => {
                try_lock!(@read_lock_retry, self.settings.clone(), |guard: &Settings| {
                    ConfigResult::Topics(guard.topic_history.clone())
                })
            }
            PortalAction::PushTopic(topic) => {
                try_lock!(@write_lock_retry, self.settings.clone(), |guard: &mut Settings| {
                    guard.push_topic(&topic);
                })
            }
            PortalAction::ClearTopicHistory => {
                try_lock!(@write_lock_retry, self.settings.clone(), |guard: &mut Settings| {
                    guard.topic_history.clear();
                })
            }
        };

        match result {
            Ok(res) => res,
            Err(e) => ConfigResult::Failed(e),
        }
    }
}

async fn write_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ConfigError::Io(format!("Failed to create config directory: {}", e)))?;
    }
    let content = toml::to_string_pretty(settings)
        .map_err(|e| ConfigError::Parse(format!("Failed to serialize settings: {}", e)))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ConfigError::Io(format!("Failed to write settings file: {}", e)))
}

/// Operations on the settings, dispatched through [`ConfigPortal::execute_portal_action`].
#[derive(Debug)]
pub enum PortalAction {
    GetSettings,
    GetDatabasePath,
    GetTopicHistory,
    PushTopic(String),
    ClearTopicHistory,
}

#[derive(Debug)]
pub enum ConfigResult {
    Success,
    Settings(Settings),
    PathBuf(PathBuf),
    Topics(Vec<String>),
    Failed(ConfigError),
}

/// Lock retry with a bounded number of attempts.
///
/// Gives up after 5 attempts spaced 10ms apart and yields
/// [`ConfigError::LockTimeout`].
#[macro_export]
macro_rules! try_lock {
    (@write_lock_retry, $accessor:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $accessor.try_write() {
                Ok(mut guard) => {
                    $operation(&mut *guard);
                    break Ok($crate::persistence::config_portal::ConfigResult::Success);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!("Write lock blocked: {} (attempt {}/{})", e, attempts, MAX_ATTEMPTS);

                    if attempts >= MAX_ATTEMPTS {
                        break Err($crate::persistence::config_portal::ConfigError::LockTimeout);
                    }

                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};

    (@read_lock_retry, $accessor:expr, $operation:expr) => {{
        let mut attempts = 0;
        const MAX_ATTEMPTS: usize = 5;

        loop {
            match $accessor.try_read() {
                Ok(guard) => {
                    let result = $operation(&*guard);
                    break Ok(result);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!("Read lock blocked: {} (attempt {}/{})", e, attempts, MAX_ATTEMPTS);

                    if attempts >= MAX_ATTEMPTS {
                        break Err($crate::persistence::config_portal::ConfigError::LockTimeout);
                    }

                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            }
        }
    }};
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Lock contention exceeded the retry limit
    #[error("Could not acquire lock after maximum retry attempts")]
    LockTimeout,

    #[error("Settings IO error: {0}")]
    Io(String),

    #[error("Settings format error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_history_is_deduplicated_and_capped() {
        let mut settings = Settings::default();
        for i in 0..25 {
            settings.push_topic(&format!("t/{i}"));
        }
        settings.push_topic("t/10");
        settings.push_topic("  ");

        assert_eq!(settings.topic_history.len(), TOPIC_HISTORY_CAP);
        assert_eq!(settings.topic_history[0], "t/10");
        assert_eq!(settings.topic_history[1], "t/24");
        assert_eq!(settings.topic_history.iter().filter(|t| *t == "t/10").count(), 1);
    }

    #[tokio::test]
    async fn default_file_is_created_once_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join(CONFIG_FILE);

        ConfigPortal::ensure_default_config(&path).await.unwrap();
        let portal = ConfigPortal::load(&path).await.unwrap();
        assert!(matches!(
            portal.execute_portal_action(PortalAction::GetSettings),
            ConfigResult::Settings(settings) if settings.max_sessions == 5
        ));

        portal.execute_portal_action(PortalAction::PushTopic("stale/topic".to_string()));
        portal.execute_portal_action(PortalAction::ClearTopicHistory);
        portal.execute_portal_action(PortalAction::PushTopic("lights/on".to_string()));
        portal.save().await.unwrap();
        ConfigPortal::ensure_default_config(&path).await.unwrap();

        let reloaded = ConfigPortal::load(&path).await.unwrap();
        match reloaded.execute_portal_action(PortalAction::GetTopicHistory) {
            ConfigResult::Topics(topics) => assert_eq!(topics, vec!["lights/on".to_string()]),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "history_limit = 20\nautoconnect = [2, 3]\n").await.unwrap();

        let portal = ConfigPortal::load(&path).await.unwrap();
        match portal.execute_portal_action(PortalAction::GetSettings) {
            ConfigResult::Settings(settings) => {
                assert_eq!(settings.history_limit, 20);
                assert_eq!(settings.max_sessions, 5);
                assert_eq!(settings.autoconnect, vec![2, 3]);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn contended_lock_times_out() {
        let portal = ConfigPortal::new(Settings::default(), PathBuf::from("unused.toml"));
        let _guard = portal.settings.write().await;
        assert!(matches!(
            portal.execute_portal_action(PortalAction::GetTopicHistory),
            ConfigResult::Failed(ConfigError::LockTimeout)
        ));
    }

    #[tokio::test]
    async fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "max_sessions = \"many\"").await.unwrap();
        assert!(matches!(ConfigPortal::load(&path).await, Err(ConfigError::Parse(_))));
    }
}
