use crate::mqtt::config::ConnectionId;
use crate::mqtt::error::TransportError;
use crate::mqtt::message_manager::Message;

/// What the UI side is told about the sessions.
///
/// Message events are only sent for the active connection; inactive
/// connections report [`UiEvent::UnreadCountChanged`] instead.
#[derive(Clone, Debug, PartialEq)]
pub enum UiEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    MessageReceived(Message),
    MessagePublished(Message),
    ErrorOccurred {
        connection_id: ConnectionId,
        error: TransportError,
    },
    UnreadCountChanged {
        connection_id: ConnectionId,
        count: u64,
    },
}

impl UiEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            UiEvent::Connected(id) | UiEvent::Disconnected(id) => *id,
            UiEvent::MessageReceived(message) | UiEvent::MessagePublished(message) => message.connection_id,
            UiEvent::ErrorOccurred { connection_id, .. } | UiEvent::UnreadCountChanged { connection_id, .. } => {
                *connection_id
            }
        }
    }
}
