//! # History Pipeline
//!
//! Loads the persisted message history of a connection off the foreground and
//! decides, when a result comes back, whether it may still be shown.
//!
//! ```text
//! load_history(C) ──► spawn_blocking ──► own read-only connection ──► HistoryResult
//!        │                                                               │
//!   generation[C] += 1                                 reconcile(result, active)
//!                                                                        │
//!                                     stale? discard ◄───────────────────┤
//!                                                                        ▼
//!                                                   drop records older than watermark[C]
//! ```
//!
//! Reads are never cancelled. A result is stale when the active connection
//! changed or a newer load (or a clear) for the same connection was issued.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::mqtt::config::ConnectionId;
use crate::mqtt::message_manager::Message;
use crate::persistence::database::Database;
use crate::persistence::error::StoreError;
use crate::persistence::{messages, Store};

const RESULT_CAPACITY: usize = 16;

/// Tag of one history read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryRequest {
    pub connection_id: ConnectionId,
    pub generation: u64,
}

/// Raw outcome of a read, before reconciliation.
#[derive(Debug)]
pub struct HistoryResult {
    pub request: HistoryRequest,
    pub messages: Vec<Message>,
}

/// History that may be shown, oldest first.
#[derive(Debug)]
pub struct HistoryBatch {
    pub connection_id: ConnectionId,
    messages: Vec<Message>,
}

impl HistoryBatch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Splits the batch into ordered chunks of at most `size` messages.
    /// Consumes the batch so it can be delivered only once.
    pub fn into_chunks(self, size: usize) -> impl Iterator<Item = Vec<Message>> {
        let size = size.max(1);
        let mut messages = self.messages.into_iter().peekable();
        std::iter::from_fn(move || {
            messages.peek()?;
            Some(messages.by_ref().take(size).collect())
        })
    }
}

pub struct HistoryPipeline {
    store: Store,
    db_path: PathBuf,
    limit: usize,
    generations: HashMap<ConnectionId, u64>,
    watermarks: HashMap<ConnectionId, DateTime<Utc>>,
    results_tx: mpsc::Sender<HistoryResult>,
    results_rx: mpsc::Receiver<HistoryResult>,
}

impl HistoryPipeline {
    pub fn new(store: Store, limit: usize) -> Self {
        let (results_tx, results_rx) = mpsc::channel(RESULT_CAPACITY);
        let db_path = store.database().path().to_path_buf();
        Self {
            store,
            db_path,
            limit,
            generations: HashMap::new(),
            watermarks: HashMap::new(),
            results_tx,
            results_rx,
        }
    }

    fn bump_generation(&mut self, connection_id: ConnectionId) -> u64 {
        let generation = self.generations.entry(connection_id).or_insert(0);
        *generation += 1;
        *generation
    }

    pub fn generation(&self, connection_id: ConnectionId) -> u64 {
        self.generations.get(&connection_id).copied().unwrap_or(0)
    }

    /// Starts reading the most recent messages of `connection_id` on a blocking
    /// worker. The result arrives through [`HistoryPipeline::next_result`].
    pub fn load_history(&mut self, connection_id: ConnectionId) -> HistoryRequest {
        let request = HistoryRequest {
            connection_id,
            generation: self.bump_generation(connection_id),
        };
        let path = self.db_path.clone();
        let limit = self.limit;
        let results = self.results_tx.clone();

        debug!(connection = %connection_id, generation = request.generation, "History load issued");
        tokio::task::spawn_blocking(move || {
            let reader = uuid::Uuid::new_v4().simple().to_string();
            let messages = match read(&path, connection_id, limit) {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(connection = %connection_id, reader = %reader, "History read failed: {}", e);
                    Vec::new()
                }
            };
            debug!(connection = %connection_id, reader = %reader, count = messages.len(), "History read done");
            if results.blocking_send(HistoryResult { request, messages }).is_err() {
                debug!(connection = %connection_id, "History pipeline gone, result dropped");
            }
        });
        request
    }

    pub async fn next_result(&mut self) -> Option<HistoryResult> {
        self.results_rx.recv().await
    }

    /// Decides whether `result` may be delivered while `active` is displayed.
    pub fn reconcile(&self, result: HistoryResult, active: Option<ConnectionId>) -> Option<HistoryBatch> {
        let HistoryRequest {
            connection_id,
            generation,
        } = result.request;

        if active != Some(connection_id) {
            debug!(connection = %connection_id, "History result discarded, connection no longer active");
            return None;
        }
        if generation < self.generation(connection_id) {
            debug!(connection = %connection_id, generation, "History result discarded, superseded");
            return None;
        }

        let mut messages = result.messages;
        if let Some(watermark) = self.watermarks.get(&connection_id) {
            let cutoff = watermark.timestamp_millis();
            messages.retain(|m| m.timestamp.timestamp_millis() >= cutoff);
        }
        Some(HistoryBatch {
            connection_id,
            messages,
        })
    }

    /// Deletes every stored message of `connection_id` and forgets its
    /// watermark. Loads still in flight become stale.
    pub fn clear_history(&mut self, connection_id: ConnectionId) -> Result<usize, StoreError> {
        let removed = self.store.messages().delete_for(connection_id)?;
        self.watermarks.remove(&connection_id);
        self.bump_generation(connection_id);
        info!(connection = %connection_id, removed, "History cleared");
        Ok(removed)
    }

    /// Hides everything older than `at` from future loads without deleting it.
    pub fn mark_display_cleared(&mut self, connection_id: ConnectionId, at: DateTime<Utc>) {
        debug!(connection = %connection_id, at = %at, "Display cleared");
        self.watermarks.insert(connection_id, at);
    }

    pub fn watermark(&self, connection_id: ConnectionId) -> Option<DateTime<Utc>> {
        self.watermarks.get(&connection_id).copied()
    }

    /// Drops all per-connection state, e.g. after the profile was deleted.
    pub fn forget(&mut self, connection_id: ConnectionId) {
        self.watermarks.remove(&connection_id);
        self.bump_generation(connection_id);
    }
}

fn read(path: &std::path::Path, connection_id: ConnectionId, limit: usize) -> Result<Vec<Message>, StoreError> {
    let conn = Database::open_reader(path)?;
    messages::load_recent(&conn, connection_id, limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::ConnectionProfile;
    use crate::mqtt::link::LinkFrame;
    use crate::mqtt::mock::MockConnector;
    use crate::mqtt::mqtt_handler::TransportEvent;
    use crate::session::manager::SessionManager;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        pipeline: HistoryPipeline,
    }

    fn fixture(limit: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("history.db")).unwrap();
        let store = Store::new(db);
        let pipeline = HistoryPipeline::new(store.clone(), limit);
        Fixture {
            _dir: dir,
            store,
            pipeline,
        }
    }

    fn save(store: &Store, id: i64, payload: &str, age_secs: i64) {
        let mut message = Message::inbound(ConnectionId(id), "t".to_string(), payload.to_string(), false);
        message.timestamp = Utc::now() - ChronoDuration::seconds(age_secs);
        store.messages().save(&message).unwrap();
    }

    async fn next(pipeline: &mut HistoryPipeline) -> HistoryResult {
        tokio::time::timeout(Duration::from_secs(5), pipeline.next_result())
            .await
            .expect("history timeout")
            .expect("pipeline closed")
    }

    fn payloads(batch: &HistoryBatch) -> Vec<&str> {
        batch.messages().iter().map(|m| m.payload.as_str()).collect()
    }

    #[tokio::test]
    async fn loads_limited_history_oldest_first() {
        let mut fx = fixture(2);
        save(&fx.store, 1, "a", 30);
        save(&fx.store, 1, "b", 20);
        save(&fx.store, 1, "c", 10);

        fx.pipeline.load_history(ConnectionId(1));
        let result = next(&mut fx.pipeline).await;
        let batch = fx.pipeline.reconcile(result, Some(ConnectionId(1))).unwrap();
        assert_eq!(payloads(&batch), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn result_for_previous_connection_is_discarded() {
        let mut fx = fixture(100);
        save(&fx.store, 1, "from A", 5);
        save(&fx.store, 2, "from B", 5);

        let request_a = fx.pipeline.load_history(ConnectionId(1));
        let active = Some(ConnectionId(2));
        fx.pipeline.load_history(ConnectionId(2));

        let mut delivered = Vec::new();
        for _ in 0..2 {
            let result = next(&mut fx.pipeline).await;
            let from_a = result.request == request_a;
            match fx.pipeline.reconcile(result, active) {
                Some(batch) => delivered.push(batch),
                None => assert!(from_a),
            }
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(payloads(&delivered[0]), vec!["from B"]);
    }

    #[tokio::test]
    async fn older_generation_is_discarded() {
        let mut fx = fixture(100);
        save(&fx.store, 1, "x", 5);
        let first = fx.pipeline.load_history(ConnectionId(1));
        let second = fx.pipeline.load_history(ConnectionId(1));
        assert!(second.generation > first.generation);

        let mut kept = 0;
        for _ in 0..2 {
            let result = next(&mut fx.pipeline).await;
            let generation = result.request.generation;
            if fx.pipeline.reconcile(result, Some(ConnectionId(1))).is_some() {
                assert_eq!(generation, second.generation);
                kept += 1;
            }
        }
        assert_eq!(kept, 1);
    }

    #[tokio::test]
    async fn watermark_hides_older_records() {
        let mut fx = fixture(100);
        save(&fx.store, 1, "old", 60);
        let t0 = Utc::now() - ChronoDuration::seconds(30);
        save(&fx.store, 1, "new", 10);

        fx.pipeline.mark_display_cleared(ConnectionId(1), t0);
        fx.pipeline.load_history(ConnectionId(1));
        let result = next(&mut fx.pipeline).await;
        let batch = fx.pipeline.reconcile(result, Some(ConnectionId(1))).unwrap();
        assert_eq!(payloads(&batch), vec!["new"]);
        assert_eq!(fx.store.messages().count(ConnectionId(1)).unwrap(), 2);
    }

    #[tokio::test]
    async fn clear_history_empties_and_later_messages_persist() {
        let mut fx = fixture(100);
        save(&fx.store, 1, "gone", 5);
        fx.pipeline.mark_display_cleared(ConnectionId(1), Utc::now());

        assert_eq!(fx.pipeline.clear_history(ConnectionId(1)).unwrap(), 1);
        assert_eq!(fx.pipeline.watermark(ConnectionId(1)), None);

        fx.pipeline.load_history(ConnectionId(1));
        let result = next(&mut fx.pipeline).await;
        assert!(fx.pipeline.reconcile(result, Some(ConnectionId(1))).unwrap().is_empty());

        save(&fx.store, 1, "fresh", 0);
        fx.pipeline.load_history(ConnectionId(1));
        let result = next(&mut fx.pipeline).await;
        let batch = fx.pipeline.reconcile(result, Some(ConnectionId(1))).unwrap();
        assert_eq!(payloads(&batch), vec!["fresh"]);
    }

    fn add_profile(store: &Store, name: &str) -> ConnectionId {
        store
            .profiles()
            .insert(&ConnectionProfile {
                name: name.to_string(),
                ..ConnectionProfile::default()
            })
            .unwrap()
            .id
    }

    /// Handles session events until `count` of them matched `wanted`.
    async fn handle_until(manager: &mut SessionManager, count: usize, wanted: impl Fn(&TransportEvent) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            let mut seen = 0;
            while seen < count {
                let event = manager.next_event().await.expect("event channel open");
                if wanted(&event.event) {
                    seen += 1;
                }
                manager.handle_event(event);
            }
        })
        .await
        .expect("timed out waiting for session events");
    }

    fn inbound(topic: &str, payload: &str) -> LinkFrame {
        LinkFrame::Publish {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain: false,
        }
    }

    #[tokio::test]
    async fn history_follows_live_sessions() {
        let mut fx = fixture(100);
        let a = add_profile(&fx.store, "a");
        let b = add_profile(&fx.store, "b");
        let connector = MockConnector::new();
        let mut manager = SessionManager::new(Arc::new(connector.clone()), fx.store.clone(), 5);

        manager.set_active(Some(a));
        manager.request_connect(a).unwrap();
        manager.request_connect(b).unwrap();
        handle_until(&mut manager, 2, |e| *e == TransportEvent::Connected).await;

        connector.inject(a, inbound("sensors/a", "before clear"));
        connector.inject(b, inbound("sensors/b", "from B"));
        handle_until(&mut manager, 2, |e| matches!(e, TransportEvent::MessageReceived { .. })).await;

        assert_eq!(fx.pipeline.clear_history(a).unwrap(), 1);
        connector.inject(a, inbound("sensors/a", "after clear"));
        handle_until(&mut manager, 1, |e| matches!(e, TransportEvent::MessageReceived { .. })).await;

        fx.pipeline.load_history(a);
        let result = next(&mut fx.pipeline).await;
        let batch = fx.pipeline.reconcile(result, manager.active()).unwrap();
        assert_eq!(payloads(&batch), vec!["after clear"]);

        let request_a = fx.pipeline.load_history(a);
        manager.set_active(Some(b));
        fx.pipeline.load_history(b);

        let mut delivered = Vec::new();
        for _ in 0..2 {
            let result = next(&mut fx.pipeline).await;
            let from_a = result.request == request_a;
            match fx.pipeline.reconcile(result, manager.active()) {
                Some(batch) => delivered.push(batch),
                None => assert!(from_a),
            }
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].connection_id, b);
        assert_eq!(payloads(&delivered[0]), vec!["from B"]);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unreadable_store_yields_empty_result() {
        let store = Store::new(Database::in_memory().unwrap());
        let mut pipeline = HistoryPipeline::new(store, 100);
        pipeline.load_history(ConnectionId(1));
        let result = next(&mut pipeline).await;
        assert!(result.messages.is_empty());
    }

    #[test]
    fn chunks_are_ordered_and_complete() {
        let messages: Vec<Message> = (0..7)
            .map(|i| Message::inbound(ConnectionId(1), "t".to_string(), i.to_string(), false))
            .collect();
        let batch = HistoryBatch {
            connection_id: ConnectionId(1),
            messages,
        };
        let chunks: Vec<Vec<Message>> = batch.into_chunks(3).collect();
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        let flat: Vec<String> = chunks.into_iter().flatten().map(|m| m.payload).collect();
        assert_eq!(flat, vec!["0", "1", "2", "3", "4", "5", "6"]);
    }
}
