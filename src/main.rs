pub mod automation;
pub mod commands;
pub mod console;
pub mod history;
pub mod mqtt;
pub mod persistence;
pub mod records;
pub mod session;

use crate::console::Console;
use crate::history::HistoryPipeline;
use crate::mqtt::rumqtt_link::RumqttConnector;
use crate::persistence::config_portal::{default_config_path, ConfigPortal, ConfigResult, PortalAction, Settings};
use crate::persistence::database::Database;
use crate::persistence::Store;
use crate::session::manager::SessionManager;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let portal = Arc::new(setup_config().await?);
    let settings = match portal.execute_portal_action(PortalAction::GetSettings) {
        ConfigResult::Settings(settings) => {
            setup_logging(&settings.log_level);
            settings
        }
        other => {
            setup_logging("info");
            warn!("Could not read settings, using defaults: {:?}", other);
            Settings::default()
        }
    };

    let database_path = match portal.execute_portal_action(PortalAction::GetDatabasePath) {
        ConfigResult::PathBuf(path) => path,
        _ => settings.resolved_database_path(),
    };
    info!(path = %database_path.display(), "Opening database");
    let store = Store::new(Database::open(&database_path).map_err(|e| eyre!("Failed to open database: {}", e))?);

    let manager = SessionManager::new(Arc::new(RumqttConnector), store.clone(), settings.max_sessions);
    let history = HistoryPipeline::new(store, settings.history_limit);
    let mut console = Console::new(manager, history, portal);

    let mut first = None;
    for id in settings.autoconnect.iter().copied().map(mqtt::config::ConnectionId) {
        match console.manager_mut().request_connect(id) {
            Ok(()) => {
                first.get_or_insert(id);
            }
            Err(e) => warn!(connection = %id, "Autoconnect failed: {}", e),
        }
    }
    if let Some(id) = first {
        console.activate(id);
    }

    console.run().await
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

/// Installs the only subscriber of the process. `RUST_LOG` wins over the
/// configured level.
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn setup_config() -> Result<ConfigPortal> {
    let path = default_config_path();
    ConfigPortal::ensure_default_config(&path)
        .await
        .map_err(|e| eyre!("Failed to create default settings: {}", e))?;
    ConfigPortal::load(&path)
        .await
        .map_err(|e| eyre!("Failed to load settings: {}", e))
}
