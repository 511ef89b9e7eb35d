//! Per-connection transport worker with a statum lifecycle.
//!
//! One worker owns one [`Link`] and runs inside the tokio task of its session.
//! Everything the owner wants is sent as a [`SessionCommand`]; everything the
//! worker observes comes back, in order, as a [`SessionEvent`].
//!
//! # State Machine
//!
//! ```text
//! Idle ──► Running ──► Draining ──► Stopped
//! ```
//!
//! Connection status (`Disconnected → Connecting → Connected`) is orthogonal to
//! the worker lifecycle and is published on a watch channel.

use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::config::{ConnectionId, ConnectionProfile, Qos};
use super::error::TransportError;
use super::link::{Connector, Link, LinkFrame};
use super::message_manager::decode_payload;

/// Upper bound for a graceful close before the link is dropped.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Requests dispatched into a session's execution context.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionCommand {
    Connect(ConnectionProfile),
    Disconnect,
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: Qos,
    },
    Unsubscribe {
        filter: String,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    MessageReceived {
        topic: String,
        payload: String,
        retained: bool,
    },
    /// A publish was handed to the protocol client
    Published {
        topic: String,
        payload: String,
        qos: Qos,
        retain: bool,
    },
    /// Does not change the connection state by itself
    Error(TransportError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionEvent {
    pub connection_id: ConnectionId,
    pub event: TransportEvent,
}

#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[machine]
pub struct TransportWorker<S: WorkerState> {
    connection_id: ConnectionId,
    connector: Arc<dyn Connector>,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Sender<SessionEvent>,
    status: watch::Sender<ConnectionState>,
    link: Option<Box<dyn Link>>,
}

enum Step {
    Shutdown,
    Command(Option<SessionCommand>),
    Frame(LinkFrame),
}

impl<S: WorkerState> TransportWorker<S> {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn connection_state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    fn set_connection_state(&self, next: ConnectionState) {
        self.status.send_replace(next);
    }

    async fn emit(&mut self, event: TransportEvent) {
        let event = SessionEvent {
            connection_id: self.connection_id,
            event,
        };
        if let Err(e) = self.events.send(event).await {
            warn!(connection = %self.connection_id, "Session event dropped, owner gone: {:?}", e.0.event);
        }
    }

    /// Closes the current link, waiting at most [`DISCONNECT_GRACE`] for the
    /// protocol client to flush the DISCONNECT.
    async fn close_link(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };

        if self.connection_state() == ConnectionState::Connected {
            match link.disconnect() {
                Ok(()) => {
                    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
                        loop {
                            match link.next_frame().await {
                                LinkFrame::Closed(_) => break,
                                frame => debug!("Discarding frame during close: {:?}", frame),
                            }
                        }
                    })
                    .await;
                    if drained.is_err() {
                        warn!(connection = %self.connection_id, "Graceful disconnect timed out, dropping link");
                    }
                }
                Err(e) => warn!(connection = %self.connection_id, "Disconnect request failed: {}", e),
            }
        }
        drop(link);
        self.mark_disconnected().await;
    }

    async fn mark_disconnected(&mut self) {
        if self.connection_state() != ConnectionState::Disconnected {
            self.set_connection_state(ConnectionState::Disconnected);
            self.emit(TransportEvent::Disconnected).await;
        }
    }
}

impl TransportWorker<Idle> {
    pub fn create(
        connection_id: ConnectionId,
        connector: Arc<dyn Connector>,
        commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Sender<SessionEvent>,
        status: watch::Sender<ConnectionState>,
    ) -> Self {
        debug!(connection = %connection_id, "Creating transport worker");
        Self::new(connection_id, connector, commands, events, status, None)
    }

    pub fn start(self) -> TransportWorker<Running> {
        info!(connection = %self.connection_id, "Transport worker running");
        self.transition()
    }
}

impl TransportWorker<Running> {
    /// Serves commands and link frames until the shutdown signal fires or the
    /// command channel closes.
    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> TransportWorker<Draining> {
        loop {
            let step = tokio::select! {
                _ = &mut shutdown_rx => Step::Shutdown,
                command = self.commands.recv() => Step::Command(command),
                frame = next_frame(&mut self.link) => Step::Frame(frame),
            };

            match step {
                Step::Shutdown => {
                    info!(connection = %self.connection_id, "Shutdown signal received");
                    break;
                }
                Step::Command(None) => {
                    debug!(connection = %self.connection_id, "Command channel closed");
                    break;
                }
                Step::Command(Some(command)) => self.handle_command(command).await,
                Step::Frame(frame) => self.handle_frame(frame).await,
            }
        }

        self.transition()
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Connect(profile) => self.connect(profile).await,
            SessionCommand::Disconnect => {
                if self.link.is_none() {
                    debug!(connection = %self.connection_id, "Disconnect ignored, not connected");
                } else {
                    info!(connection = %self.connection_id, "Disconnecting");
                    self.close_link().await;
                }
            }
            SessionCommand::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                let Some(link) = self.connected_link() else {
                    warn!(connection = %self.connection_id, topic = %topic, "Publish while not connected");
                    self.emit(TransportEvent::Error(TransportError::NotConnected { operation: "publish" }))
                        .await;
                    return;
                };
                let text = decode_payload(&payload);
                match link.publish(&topic, payload, qos, retain) {
                    Ok(()) => {
                        debug!(connection = %self.connection_id, topic = %topic, "Published");
                        self.emit(TransportEvent::Published {
                            topic,
                            payload: text,
                            qos,
                            retain,
                        })
                        .await;
                    }
                    Err(e) => {
                        error!(connection = %self.connection_id, topic = %topic, "Publish failed: {}", e);
                        self.emit(TransportEvent::Error(e)).await;
                    }
                }
            }
            SessionCommand::Subscribe { filter, qos } => {
                let result = match self.connected_link() {
                    Some(link) => link.subscribe(&filter, qos),
                    None => Err(TransportError::NotConnected { operation: "subscribe" }),
                };
                match result {
                    Ok(()) => info!(connection = %self.connection_id, filter = %filter, qos = qos.level(), "Subscribed"),
                    Err(e) => {
                        warn!(connection = %self.connection_id, filter = %filter, "Subscribe failed: {}", e);
                        self.emit(TransportEvent::Error(e)).await;
                    }
                }
            }
            SessionCommand::Unsubscribe { filter } => {
                let result = match self.connected_link() {
                    Some(link) => link.unsubscribe(&filter),
                    None => Err(TransportError::NotConnected { operation: "unsubscribe" }),
                };
                match result {
                    Ok(()) => info!(connection = %self.connection_id, filter = %filter, "Unsubscribed"),
                    Err(e) => {
                        warn!(connection = %self.connection_id, filter = %filter, "Unsubscribe failed: {}", e);
                        self.emit(TransportEvent::Error(e)).await;
                    }
                }
            }
        }
    }

    async fn connect(&mut self, profile: ConnectionProfile) {
        if self.link.is_some() {
            info!(connection = %self.connection_id, "Connect while link is up, closing it first");
            self.close_link().await;
        }

        info!(connection = %self.connection_id, profile = %profile, "Connecting");
        self.set_connection_state(ConnectionState::Connecting);
        match self.connector.open(&profile).await {
            Ok(link) => self.link = Some(link),
            Err(e) => {
                error!(connection = %self.connection_id, "Connect failed: {}", e);
                self.set_connection_state(ConnectionState::Disconnected);
                self.emit(TransportEvent::Error(e)).await;
            }
        }
    }

    async fn handle_frame(&mut self, frame: LinkFrame) {
        match frame {
            LinkFrame::ConnAck => {
                info!(connection = %self.connection_id, "Connected");
                self.set_connection_state(ConnectionState::Connected);
                self.emit(TransportEvent::Connected).await;
            }
            LinkFrame::Publish {
                topic,
                payload,
                retain,
            } => {
                debug!(connection = %self.connection_id, topic = %topic, retain, bytes = payload.len(), "Message received");
                self.emit(TransportEvent::MessageReceived {
                    topic,
                    payload: decode_payload(&payload),
                    retained: retain,
                })
                .await;
            }
            LinkFrame::Closed(reason) => {
                self.link = None;
                if let Some(e) = reason {
                    warn!(connection = %self.connection_id, "Link closed: {}", e);
                    self.emit(TransportEvent::Error(e)).await;
                } else {
                    info!(connection = %self.connection_id, "Link closed");
                }
                self.mark_disconnected().await;
            }
        }
    }

    fn connected_link(&mut self) -> Option<&mut Box<dyn Link>> {
        if self.connection_state() == ConnectionState::Connected {
            self.link.as_mut()
        } else {
            None
        }
    }
}

impl TransportWorker<Draining> {
    pub async fn drain(mut self) -> TransportWorker<Stopped> {
        self.close_link().await;
        info!(connection = %self.connection_id, "Transport worker stopped");
        self.transition()
    }
}

impl TransportWorker<Stopped> {}

async fn next_frame(link: &mut Option<Box<dyn Link>>) -> LinkFrame {
    match link {
        Some(link) => link.next_frame().await,
        None => std::future::pending().await,
    }
}
