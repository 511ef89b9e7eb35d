use crate::mqtt::config::ConnectionId;
use crate::persistence::error::StoreError;

/// Failures reported synchronously by the session layer.
///
/// Everything that happens after a command was accepted is reported as an
/// event instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Connect rejected before any execution context was created
    #[error("Capacity exceeded: {max} sessions are already live")]
    CapacityExceeded { max: usize },

    #[error("Unknown connection profile {0}")]
    UnknownProfile(ConnectionId),

    /// The session's command queue is full
    #[error("Session {0} is busy, command dropped")]
    Busy(ConnectionId),

    #[error("Session {0} has stopped")]
    ChannelClosed(ConnectionId),

    /// Wildcards in a publish topic
    #[error("Invalid topic for publishing: {0}")]
    InvalidTopic(String),

    #[error("Session task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
