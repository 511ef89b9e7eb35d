//! In-memory protocol capability for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::config::{ConnectionId, ConnectionProfile, Qos};
use super::error::TransportError;
use super::link::{Connector, Link, LinkFrame};

/// A request a [`MockLink`] received from its worker.
#[derive(Clone, Debug, PartialEq)]
pub enum Sent {
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
    Disconnect,
}

#[derive(Default)]
struct Shared {
    sent: HashMap<ConnectionId, Vec<Sent>>,
    injectors: HashMap<ConnectionId, mpsc::UnboundedSender<LinkFrame>>,
    opened: HashMap<ConnectionId, usize>,
    fail_open: Option<TransportError>,
    hold_connack: bool,
}

/// Links are keyed by the profile id they were opened for; a newer link
/// replaces the older one for injection.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links opened from now on stay in the connecting state.
    pub fn hold_connack(&self) {
        self.shared.lock().hold_connack = true;
    }

    pub fn fail_open_with(&self, error: TransportError) {
        self.shared.lock().fail_open = Some(error);
    }

    /// Feeds a frame to the newest link of `id`.
    pub fn inject(&self, id: ConnectionId, frame: LinkFrame) -> bool {
        match self.shared.lock().injectors.get(&id) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn sent(&self, id: ConnectionId) -> Vec<Sent> {
        self.shared.lock().sent.get(&id).cloned().unwrap_or_default()
    }

    pub fn published(&self, id: ConnectionId) -> Vec<(String, String)> {
        self.sent(id)
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Publish { topic, payload, .. } => {
                    Some((topic, String::from_utf8_lossy(&payload).into_owned()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn subscribed(&self, id: ConnectionId) -> Vec<String> {
        self.sent(id)
            .into_iter()
            .filter_map(|sent| match sent {
                Sent::Subscribe { filter, .. } => Some(filter),
                _ => None,
            })
            .collect()
    }

    pub fn open_count(&self, id: ConnectionId) -> usize {
        self.shared.lock().opened.get(&id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, profile: &ConnectionProfile) -> Result<Box<dyn Link>, TransportError> {
        let mut shared = self.shared.lock();
        if let Some(error) = shared.fail_open.clone() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        shared.injectors.insert(profile.id, tx);
        *shared.opened.entry(profile.id).or_insert(0) += 1;
        Ok(Box::new(MockLink {
            id: profile.id,
            shared: self.shared.clone(),
            frames: rx,
            pending_ack: !shared.hold_connack,
            closing: false,
        }))
    }
}

pub struct MockLink {
    id: ConnectionId,
    shared: Arc<Mutex<Shared>>,
    frames: mpsc::UnboundedReceiver<LinkFrame>,
    pending_ack: bool,
    closing: bool,
}

impl MockLink {
    fn record(&self, sent: Sent) {
        self.shared.lock().sent.entry(self.id).or_default().push(sent);
    }
}

#[async_trait]
impl Link for MockLink {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<(), TransportError> {
        self.record(Sent::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(&mut self, filter: &str, qos: Qos) -> Result<(), TransportError> {
        self.record(Sent::Subscribe {
            filter: filter.to_string(),
            qos,
        });
        Ok(())
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.record(Sent::Unsubscribe {
            filter: filter.to_string(),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(Sent::Disconnect);
        self.closing = true;
        Ok(())
    }

    async fn next_frame(&mut self) -> LinkFrame {
        if self.pending_ack {
            self.pending_ack = false;
            return LinkFrame::ConnAck;
        }
        if self.closing {
            return LinkFrame::Closed(None);
        }
        match self.frames.recv().await {
            Some(frame) => frame,
            None => std::future::pending().await,
        }
    }
}
