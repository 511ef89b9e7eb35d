use std::path::PathBuf;

/// Faults of a single broker connection.
///
/// None of these cross the session boundary as a hard failure; the transport
/// reports them as [`TransportEvent::Error`](super::mqtt_handler::TransportEvent).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Publish or subscribe attempted while the link is not up
    #[error("Not connected: {operation} dropped")]
    NotConnected { operation: &'static str },

    /// Handshake, protocol or network failure
    #[error("Transport error: {0}")]
    Protocol(String),

    /// Certificate or key material could not be loaded
    #[error("TLS material error ({path}): {reason}")]
    TlsMaterial { path: PathBuf, reason: String },
}
