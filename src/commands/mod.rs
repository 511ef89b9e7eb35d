//! Saved publish commands, sent once or repeatedly on an interval.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::automation::topic::is_publishable;
use crate::mqtt::config::{ConnectionId, Qos};
use crate::session::error::SessionError;
use crate::session::manager::SessionManager;
use crate::session::session::SessionLink;

/// Shortest loop interval accepted.
pub const MIN_LOOP_INTERVAL_MS: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub id: i64,
    pub name: String,
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
    pub retain: bool,
    pub loop_enabled: bool,
    pub loop_interval_ms: u64,
    /// `None` shows the command for every connection
    pub connection_id: Option<ConnectionId>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            id: -1,
            name: String::new(),
            topic: String::new(),
            payload: String::new(),
            qos: Qos::AtMostOnce,
            retain: false,
            loop_enabled: false,
            loop_interval_ms: 1000,
            connection_id: None,
        }
    }
}

impl CommandConfig {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms.max(MIN_LOOP_INTERVAL_MS))
    }

    pub fn applies_to(&self, connection_id: ConnectionId) -> bool {
        self.connection_id.map_or(true, |id| id == connection_id)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if is_publishable(&self.topic) {
            Ok(())
        } else {
            Err(SessionError::InvalidTopic(self.topic.clone()))
        }
    }
}

struct RunningLoop {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Sends saved commands and owns their publish loops.
///
/// Every loop runs in its own task under a child token of the runner, so
/// [`CommandRunner::stop_all`] cancels them in one go.
#[derive(Default)]
pub struct CommandRunner {
    root: CancellationToken,
    loops: HashMap<i64, RunningLoop>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `command` once on `target`.
    pub fn send(
        &self,
        manager: &mut SessionManager,
        target: ConnectionId,
        command: &CommandConfig,
    ) -> Result<(), SessionError> {
        command.validate()?;
        info!(command = %command.name, connection = %target, "Sending command");
        manager.publish(
            target,
            command.topic.clone(),
            command.payload.clone().into_bytes(),
            command.qos,
            command.retain,
        )
    }

    /// Starts publishing `command` through `link` every loop interval.
    /// Returns `false` when a loop for this command is already running.
    pub fn start_loop(&mut self, command: CommandConfig, link: SessionLink) -> Result<bool, SessionError> {
        command.validate()?;
        self.loops.retain(|_, running| !running.task.is_finished());
        if self.loops.contains_key(&command.id) {
            debug!(command = %command.name, "Loop already running");
            return Ok(false);
        }

        let token = self.root.child_token();
        let id = command.id;
        let task = tokio::spawn(run_loop(command, link, token.clone()));
        self.loops.insert(id, RunningLoop { token, task });
        Ok(true)
    }

    pub fn stop_loop(&mut self, id: i64) -> bool {
        match self.loops.remove(&id) {
            Some(running) => {
                running.token.cancel();
                info!(command_id = id, "Loop stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        self.root.cancel();
        let stopped = self.loops.drain().count();
        if stopped > 0 {
            info!(stopped, "All command loops stopped");
        }
        self.root = CancellationToken::new();
    }
}

async fn run_loop(command: CommandConfig, link: SessionLink, token: CancellationToken) {
    let mut ticker = tokio::time::interval(command.loop_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(
        command = %command.name,
        connection = %link.connection_id(),
        interval_ms = command.loop_interval().as_millis() as u64,
        "Loop started"
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if !link.is_connected() {
                    debug!(command = %command.name, "Loop tick skipped, session not connected");
                    continue;
                }
                match link.publish(
                    command.topic.clone(),
                    command.payload.clone().into_bytes(),
                    command.qos,
                    command.retain,
                ) {
                    Ok(()) => {}
                    Err(SessionError::Busy(_)) => warn!(command = %command.name, "Loop tick dropped, session busy"),
                    Err(e) => {
                        warn!(command = %command.name, "Loop ended: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
