//! Seam between the transport worker and the protocol client library.
//!
//! The worker only ever talks to a [`Link`]; production code plugs in the
//! rumqttc-backed [`RumqttConnector`](super::rumqtt_link::RumqttConnector),
//! tests plug in an in-memory fake.

use async_trait::async_trait;

use super::config::{ConnectionProfile, Qos};
use super::error::TransportError;

/// What the protocol client observed on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFrame {
    /// Broker accepted the connection
    ConnAck,
    Publish {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// The link is gone; `None` for a requested close
    Closed(Option<TransportError>),
}

/// One physical broker connection.
///
/// Request methods only enqueue and never wait on the network, so they are safe
/// to call from the same task that drives [`Link::next_frame`].
#[async_trait]
pub trait Link: Send {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<(), TransportError>;

    fn subscribe(&mut self, filter: &str, qos: Qos) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Drives the connection until the next relevant frame.
    /// Must not be polled again after it returned [`LinkFrame::Closed`].
    async fn next_frame(&mut self) -> LinkFrame;
}

/// Factory for links. Building a link performs no network I/O; the handshake
/// happens while the first frames are polled.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, profile: &ConnectionProfile) -> Result<Box<dyn Link>, TransportError>;
}
