//! One execution context per connection profile.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::SessionError;
use crate::mqtt::config::{ConnectionId, Qos};
use crate::mqtt::link::Connector;
use crate::mqtt::mqtt_handler::{ConnectionState, SessionCommand, SessionEvent, TransportWorker};

const COMMAND_CAPACITY: usize = 64;

/// Cheap, cloneable way to talk to a running session.
///
/// Holders can dispatch commands and read the connection state but cannot
/// stop the session.
#[derive(Clone, Debug)]
pub struct SessionLink {
    connection_id: ConnectionId,
    commands: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<ConnectionState>,
}

impl SessionLink {
    pub fn new(
        connection_id: ConnectionId,
        commands: mpsc::Sender<SessionCommand>,
        status: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            connection_id,
            commands,
            status,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queues a command without waiting.
    pub fn dispatch(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::Busy(self.connection_id),
            mpsc::error::TrySendError::Closed(_) => SessionError::ChannelClosed(self.connection_id),
        })
    }

    pub fn publish(&self, topic: String, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<(), SessionError> {
        self.dispatch(SessionCommand::Publish {
            topic,
            payload,
            qos,
            retain,
        })
    }
}

/// Owns the task running a session's transport worker.
#[derive(Debug)]
pub struct SessionHandle {
    link: SessionLink,
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    /// Starts the transport worker for `connection_id` in its own task.
    /// The session starts out disconnected.
    pub fn spawn(
        connection_id: ConnectionId,
        connector: Arc<dyn Connector>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = TransportWorker::create(connection_id, connector, command_rx, events, status_tx);
        let task_handle = tokio::spawn(async move {
            let draining = worker.start().run_until_shutdown(shutdown_rx).await;
            draining.drain().await;
            debug!(connection = %connection_id, "Session task finished");
        });

        info!(connection = %connection_id, "Session spawned");
        Self {
            link: SessionLink::new(connection_id, command_tx, status_rx),
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.link.connection_id
    }

    pub fn link(&self) -> SessionLink {
        self.link.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn dispatch(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.link.dispatch(command)
    }

    /// Asks the session to stop and hands back its task for a later join.
    /// Never waits.
    pub fn retire(mut self) -> Option<JoinHandle<()>> {
        self.signal_shutdown();
        self.task_handle.take()
    }

    /// Stops the session and waits until its link is closed.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.signal_shutdown();
        match self.task_handle.take() {
            Some(handle) => join(self.connection_id(), handle).await,
            None => {
                debug!(connection = %self.connection_id(), "Session already shut down");
                Ok(())
            }
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!(connection = %self.connection_id(), "Session task already terminated");
            }
        }
    }
}

pub(crate) async fn join(connection_id: ConnectionId, handle: JoinHandle<()>) -> Result<(), SessionError> {
    handle.await.map_err(|e| {
        error!(connection = %connection_id, "Session task panicked: {}", e);
        SessionError::Task(e.to_string())
    })
}
