//! Owner of all live sessions.
//!
//! The manager lives on the foreground. It spawns one session per profile,
//! enforces the session cap, persists traffic, keeps unread counters for the
//! connections that are not displayed and keeps the automation engine bound
//! to the active one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::SessionError;
use super::events::UiEvent;
use super::session::{join, SessionHandle, SessionLink};
use crate::automation::topic::is_publishable;
use crate::automation::AutomationEngine;
use crate::mqtt::config::{ConnectionId, Qos, Subscription};
use crate::mqtt::error::TransportError;
use crate::mqtt::link::Connector;
use crate::mqtt::message_manager::Message;
use crate::mqtt::mqtt_handler::{ConnectionState, SessionCommand, SessionEvent, TransportEvent};
use crate::persistence::error::StoreError;
use crate::persistence::Store;

const EVENT_CAPACITY: usize = 256;
const UI_CAPACITY: usize = 256;

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    store: Store,
    sessions: HashMap<ConnectionId, SessionHandle>,
    /// Connect requests not yet confirmed or refused by their session
    pending: HashSet<ConnectionId>,
    /// Profiles deleted while their session was still running
    removed: HashSet<ConnectionId>,
    retired: Vec<(ConnectionId, JoinHandle<()>)>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    ui: broadcast::Sender<UiEvent>,
    active: Option<ConnectionId>,
    unread: HashMap<ConnectionId, u64>,
    automation: AutomationEngine,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, store: Store, max_sessions: usize) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (ui, _) = broadcast::channel(UI_CAPACITY);
        info!(max_sessions, "Creating SessionManager");
        Self {
            connector,
            store,
            sessions: HashMap::new(),
            pending: HashSet::new(),
            removed: HashSet::new(),
            retired: Vec::new(),
            events_tx,
            events_rx,
            ui,
            active: None,
            unread: HashMap::new(),
            automation: AutomationEngine::new(),
            max_sessions,
        }
    }

    /// New receiver of the UI event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn active(&self) -> Option<ConnectionId> {
        self.active
    }

    pub fn unread_count(&self, connection_id: ConnectionId) -> u64 {
        self.unread.get(&connection_id).copied().unwrap_or(0)
    }

    /// `None` when no session was ever created for the profile.
    pub fn state(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        self.sessions.get(&connection_id).map(SessionHandle::state)
    }

    pub fn session_link(&self, connection_id: ConnectionId) -> Option<SessionLink> {
        self.sessions.get(&connection_id).map(SessionHandle::link)
    }

    pub fn automation(&self) -> &AutomationEngine {
        &self.automation
    }

    fn is_live(&self, connection_id: ConnectionId) -> bool {
        self.pending.contains(&connection_id)
            || self
                .sessions
                .get(&connection_id)
                .is_some_and(|session| session.state() != ConnectionState::Disconnected)
    }

    /// Sessions that are connecting or connected.
    pub fn live_count(&self) -> usize {
        self.sessions.keys().filter(|id| self.is_live(**id)).count()
    }

    fn notify(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            debug!("No UI listener for session event");
        }
    }

    /// Connects the profile `connection_id`, creating its session on first use.
    ///
    /// Rejected before anything is spawned when the cap is reached and this
    /// profile is not one of the live sessions.
    pub fn request_connect(&mut self, connection_id: ConnectionId) -> Result<(), SessionError> {
        let profile = match self.store.profiles().get(connection_id) {
            Ok(profile) => profile,
            Err(StoreError::NotFound(_)) => return Err(SessionError::UnknownProfile(connection_id)),
            Err(e) => return Err(e.into()),
        };

        self.removed.remove(&connection_id);

        if !self.is_live(connection_id) && self.live_count() >= self.max_sessions {
            warn!(connection = %connection_id, max = self.max_sessions, "Connect rejected, session cap reached");
            return Err(SessionError::CapacityExceeded {
                max: self.max_sessions,
            });
        }

        let connector = self.connector.clone();
        let events = self.events_tx.clone();
        let session = self
            .sessions
            .entry(connection_id)
            .or_insert_with(|| SessionHandle::spawn(connection_id, connector, events));
        session.dispatch(SessionCommand::Connect(profile))?;
        self.pending.insert(connection_id);
        info!(connection = %connection_id, "Connect requested");

        if self.active == Some(connection_id) {
            self.bind_automation(connection_id);
        }
        Ok(())
    }

    /// Asks the session to disconnect. No-op when there is no session.
    pub fn request_disconnect(&mut self, connection_id: ConnectionId) -> Result<(), SessionError> {
        self.pending.remove(&connection_id);
        match self.sessions.get(&connection_id) {
            Some(session) => session.dispatch(SessionCommand::Disconnect),
            None => {
                debug!(connection = %connection_id, "Disconnect ignored, no session");
                Ok(())
            }
        }
    }

    /// Queues a publish. Outcome and outbound history follow as events.
    pub fn publish(
        &self,
        connection_id: ConnectionId,
        topic: String,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), SessionError> {
        if !is_publishable(&topic) {
            return Err(SessionError::InvalidTopic(topic));
        }
        match self.sessions.get(&connection_id) {
            Some(session) => session.dispatch(SessionCommand::Publish {
                topic,
                payload,
                qos,
                retain,
            }),
            None => {
                warn!(connection = %connection_id, topic = %topic, "Publish without a session");
                self.notify(UiEvent::ErrorOccurred {
                    connection_id,
                    error: TransportError::NotConnected { operation: "publish" },
                });
                Ok(())
            }
        }
    }

    /// Stores the subscription and subscribes right away when connected.
    /// Otherwise it is issued on the next connect.
    pub fn subscribe_topic(
        &self,
        connection_id: ConnectionId,
        filter: &str,
        qos: Qos,
    ) -> Result<Subscription, SessionError> {
        let subscription = self.store.subscriptions().upsert(connection_id, filter, qos)?;
        match self.sessions.get(&connection_id) {
            Some(session) if session.state() == ConnectionState::Connected => {
                session.dispatch(SessionCommand::Subscribe {
                    filter: filter.to_string(),
                    qos,
                })?;
            }
            _ => debug!(connection = %connection_id, filter = %filter, "Subscription stored for next connect"),
        }
        Ok(subscription)
    }

    pub fn unsubscribe_topic(&self, connection_id: ConnectionId, filter: &str) -> Result<bool, SessionError> {
        let removed = self.store.subscriptions().remove(connection_id, filter)?;
        if let Some(session) = self.sessions.get(&connection_id) {
            if session.state() == ConnectionState::Connected {
                session.dispatch(SessionCommand::Unsubscribe {
                    filter: filter.to_string(),
                })?;
            }
        }
        Ok(removed)
    }

    /// Switches the displayed connection, resetting its unread counter and
    /// rebinding automation to it.
    pub fn set_active(&mut self, connection_id: Option<ConnectionId>) {
        self.active = connection_id;
        let Some(id) = connection_id else {
            info!("No active connection");
            self.automation.unbind();
            return;
        };

        info!(connection = %id, "Active connection changed");
        if self.unread.remove(&id).is_some_and(|count| count > 0) {
            self.notify(UiEvent::UnreadCountChanged {
                connection_id: id,
                count: 0,
            });
        }
        self.bind_automation(id);
    }

    /// Re-reads the rules from the store for the active connection.
    pub fn reload_rules(&mut self) {
        if let Some(id) = self.active {
            self.bind_automation(id);
        }
    }

    fn bind_automation(&mut self, connection_id: ConnectionId) {
        let Some(link) = self.session_link(connection_id) else {
            self.automation.unbind();
            return;
        };
        let rules = self.store.rules().list_for(connection_id).unwrap_or_else(|e| {
            error!(connection = %connection_id, "Failed to load rules: {}", e);
            Vec::new()
        });
        self.automation.bind(link, rules);
    }

    /// Deletes a profile together with its history and subscriptions. Its
    /// session is told to stop but not waited for.
    pub fn remove_profile(&mut self, connection_id: ConnectionId) -> Result<(), SessionError> {
        self.prune_retired();
        if let Some(session) = self.sessions.remove(&connection_id) {
            self.removed.insert(connection_id);
            if let Some(task) = session.retire() {
                self.retired.push((connection_id, task));
            }
        }
        self.pending.remove(&connection_id);
        self.unread.remove(&connection_id);
        if self.active == Some(connection_id) {
            self.active = None;
            self.automation.unbind();
        }

        let messages = self.store.messages().delete_for(connection_id)?;
        let subscriptions = self.store.subscriptions().delete_for(connection_id)?;
        self.store.profiles().delete(connection_id)?;
        info!(connection = %connection_id, messages, subscriptions, "Profile removed");
        Ok(())
    }

    /// Forgets retired sessions that have stopped. Their ids stay filtered
    /// until no event of theirs can still be queued.
    fn prune_retired(&mut self) {
        if !self.events_rx.is_empty() {
            return;
        }
        let removed = &mut self.removed;
        self.retired.retain(|(id, task)| {
            if task.is_finished() {
                removed.remove(id);
                false
            } else {
                true
            }
        });
    }

    /// Next event from any session. Events of one session keep their order.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    pub fn handle_event(&mut self, SessionEvent { connection_id, event }: SessionEvent) {
        if self.removed.contains(&connection_id) {
            debug!(connection = %connection_id, "Event of removed profile dropped");
            self.prune_retired();
            return;
        }

        match event {
            TransportEvent::Connected => {
                self.pending.remove(&connection_id);
                self.resubscribe(connection_id);
                self.notify(UiEvent::Connected(connection_id));
            }
            TransportEvent::Disconnected => {
                self.pending.remove(&connection_id);
                self.notify(UiEvent::Disconnected(connection_id));
            }
            TransportEvent::MessageReceived {
                topic,
                payload,
                retained,
            } => self.on_message(Message::inbound(connection_id, topic, payload, retained)),
            TransportEvent::Published {
                topic, payload, retain, ..
            } => {
                let mut message = Message::outbound(connection_id, topic, payload, retain);
                self.persist(&mut message);
                if self.active == Some(connection_id) {
                    self.notify(UiEvent::MessagePublished(message));
                }
            }
            TransportEvent::Error(error) => {
                if !matches!(error, TransportError::NotConnected { .. })
                    && self.state(connection_id) == Some(ConnectionState::Disconnected)
                {
                    self.pending.remove(&connection_id);
                }
                self.notify(UiEvent::ErrorOccurred { connection_id, error });
            }
        }
    }

    fn on_message(&mut self, mut message: Message) {
        let connection_id = message.connection_id;
        if !message.retained {
            self.persist(&mut message);
        }

        if self.active == Some(connection_id) {
            if self.automation.bound_to() == Some(connection_id) {
                self.automation
                    .on_message(&message.topic, &message.payload, message.retained);
            }
            self.notify(UiEvent::MessageReceived(message));
        } else {
            let count = self.unread.entry(connection_id).or_insert(0);
            *count += 1;
            let count = *count;
            self.notify(UiEvent::UnreadCountChanged { connection_id, count });
        }
    }

    fn persist(&self, message: &mut Message) {
        match self.store.messages().save(message) {
            Ok(id) => message.id = Some(id),
            Err(e) => error!(connection = %message.connection_id, topic = %message.topic, "Failed to persist message: {}", e),
        }
    }

    fn resubscribe(&self, connection_id: ConnectionId) {
        let Some(session) = self.sessions.get(&connection_id) else {
            return;
        };
        let subscriptions = match self.store.subscriptions().list_for(connection_id) {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(connection = %connection_id, "Failed to load subscriptions: {}", e);
                return;
            }
        };
        debug!(connection = %connection_id, count = subscriptions.len(), "Restoring subscriptions");
        for Subscription { topic, qos, .. } in subscriptions {
            if let Err(e) = session.dispatch(SessionCommand::Subscribe { filter: topic.clone(), qos }) {
                warn!(connection = %connection_id, filter = %topic, "Resubscribe dropped: {}", e);
            }
        }
    }

    /// Stops every session and waits for all of them, including retired ones.
    /// Events still buffered afterwards are handled so no traffic is lost.
    pub async fn shutdown(&mut self) {
        info!(sessions = self.sessions.len(), retired = self.retired.len(), "Shutting down sessions");
        self.automation.unbind();
        self.events_rx.close();

        let mut tasks: Vec<(ConnectionId, JoinHandle<()>)> = self.retired.drain(..).collect();
        for (id, session) in self.sessions.drain() {
            if let Some(task) = session.retire() {
                tasks.push((id, task));
            }
        }
        for (id, task) in tasks {
            if let Err(e) = join(id, task).await {
                error!(connection = %id, "Session did not stop cleanly: {}", e);
            }
        }

        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
        self.pending.clear();
        info!("All sessions stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::rule::{Rule, TriggerCondition};
    use crate::mqtt::config::ConnectionProfile;
    use crate::mqtt::link::LinkFrame;
    use crate::mqtt::mock::{MockConnector, Sent};
    use crate::persistence::database::Database;
    use std::time::Duration;

    struct Fixture {
        manager: SessionManager,
        connector: MockConnector,
        ids: Vec<ConnectionId>,
        ui: broadcast::Receiver<UiEvent>,
    }

    fn fixture(profiles: usize) -> Fixture {
        let store = Store::new(Database::in_memory().unwrap());
        let ids = (0..profiles)
            .map(|i| {
                store
                    .profiles()
                    .insert(&ConnectionProfile {
                        name: format!("broker-{i}"),
                        ..ConnectionProfile::default()
                    })
                    .unwrap()
                    .id
            })
            .collect();
        let connector = MockConnector::new();
        let manager = SessionManager::new(Arc::new(connector.clone()), store, 5);
        let ui = manager.subscribe();
        Fixture {
            manager,
            connector,
            ids,
            ui,
        }
    }

    /// Handles session events until `until` accepted one of them.
    async fn pump(manager: &mut SessionManager, mut until: impl FnMut(&SessionEvent) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = manager.next_event().await.expect("event channel open");
                let done = until(&event);
                manager.handle_event(event);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for session event");
    }

    async fn connect_all(fx: &mut Fixture, ids: &[ConnectionId]) {
        for id in ids {
            fx.manager.request_connect(*id).unwrap();
        }
        let mut connected = 0;
        let expected = ids.len();
        pump(&mut fx.manager, |e| {
            if e.event == TransportEvent::Connected {
                connected += 1;
            }
            connected == expected
        })
        .await;
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn drain(ui: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
        let mut events = Vec::new();
        while let Ok(event) = ui.try_recv() {
            events.push(event);
        }
        events
    }

    fn frame(topic: &str, payload: &str, retain: bool) -> LinkFrame {
        LinkFrame::Publish {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain,
        }
    }

    fn is_inbound(e: &SessionEvent) -> bool {
        matches!(e.event, TransportEvent::MessageReceived { .. })
    }

    #[tokio::test]
    async fn sixth_session_is_rejected_while_five_are_live() {
        let mut fx = fixture(6);
        let ids = fx.ids.clone();
        connect_all(&mut fx, &ids[..5]).await;

        let err = fx.manager.request_connect(ids[5]).unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded { max: 5 }));
        assert_eq!(fx.manager.state(ids[5]), None);
        assert_eq!(fx.connector.open_count(ids[5]), 0);
        for id in &ids[..5] {
            assert_eq!(fx.manager.state(*id), Some(ConnectionState::Connected));
        }

        fx.manager.request_connect(ids[0]).unwrap();
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn connect_burst_cannot_overshoot_the_cap() {
        let mut fx = fixture(6);
        for id in &fx.ids[..5] {
            fx.manager.request_connect(*id).unwrap();
        }
        assert!(matches!(
            fx.manager.request_connect(fx.ids[5]),
            Err(SessionError::CapacityExceeded { .. })
        ));
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_session_frees_its_slot() {
        let mut fx = fixture(6);
        let ids = fx.ids.clone();
        connect_all(&mut fx, &ids[..5]).await;

        fx.manager.request_disconnect(ids[0]).unwrap();
        pump(&mut fx.manager, |e| e.event == TransportEvent::Disconnected).await;
        fx.manager.request_connect(ids[5]).unwrap();
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_profile_is_rejected() {
        let mut fx = fixture(0);
        assert!(matches!(
            fx.manager.request_connect(ConnectionId(42)),
            Err(SessionError::UnknownProfile(ConnectionId(42)))
        ));
        fx.manager.request_disconnect(ConnectionId(42)).unwrap();
    }

    #[tokio::test]
    async fn inactive_connection_counts_unread() {
        let mut fx = fixture(2);
        let (a, b) = (fx.ids[0], fx.ids[1]);
        fx.manager.set_active(Some(a));
        connect_all(&mut fx, &[a, b]).await;
        drain(&mut fx.ui);

        assert!(fx.connector.inject(b, frame("sensors/1", "21.5", false)));
        pump(&mut fx.manager, is_inbound).await;

        assert_eq!(fx.manager.unread_count(b), 1);
        assert_eq!(
            drain(&mut fx.ui),
            vec![UiEvent::UnreadCountChanged {
                connection_id: b,
                count: 1
            }]
        );
        assert_eq!(fx.manager.store().messages().count(b).unwrap(), 1);

        fx.manager.set_active(Some(b));
        assert_eq!(fx.manager.unread_count(b), 0);
        assert_eq!(
            drain(&mut fx.ui),
            vec![UiEvent::UnreadCountChanged {
                connection_id: b,
                count: 0
            }]
        );
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn stored_subscriptions_are_replayed_on_connect() {
        let mut fx = fixture(1);
        let a = fx.ids[0];
        fx.manager.subscribe_topic(a, "sensors/#", Qos::AtLeastOnce).unwrap();
        fx.manager.subscribe_topic(a, "alerts/+", Qos::AtMostOnce).unwrap();
        assert!(fx.connector.subscribed(a).is_empty());

        connect_all(&mut fx, &[a]).await;
        let connector = fx.connector.clone();
        eventually(|| connector.subscribed(a).len() == 2).await;
        assert_eq!(fx.connector.subscribed(a), vec!["sensors/#", "alerts/+"]);

        fx.manager.unsubscribe_topic(a, "alerts/+").unwrap();
        eventually(|| connector.sent(a).contains(&Sent::Unsubscribe { filter: "alerts/+".to_string() })).await;
        assert_eq!(fx.manager.store().subscriptions().list_for(a).unwrap().len(), 1);
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn retained_messages_are_shown_but_not_stored() {
        let mut fx = fixture(1);
        let a = fx.ids[0];
        fx.manager.set_active(Some(a));
        connect_all(&mut fx, &[a]).await;
        drain(&mut fx.ui);

        fx.connector.inject(a, frame("status/lamp", "on", true));
        pump(&mut fx.manager, is_inbound).await;

        let events = drain(&mut fx.ui);
        assert!(matches!(&events[..], [UiEvent::MessageReceived(m)] if m.retained && m.id.is_none()));
        assert_eq!(fx.manager.store().messages().count(a).unwrap(), 0);
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn publish_while_not_connected_is_reported_and_not_stored() {
        let mut fx = fixture(1);
        let a = fx.ids[0];
        fx.manager.set_active(Some(a));

        fx.manager
            .publish(a, "lamp/set".to_string(), b"on".to_vec(), Qos::AtMostOnce, false)
            .unwrap();
        assert!(matches!(
            &drain(&mut fx.ui)[..],
            [UiEvent::ErrorOccurred {
                error: TransportError::NotConnected { .. },
                ..
            }]
        ));

        fx.connector.hold_connack();
        fx.manager.request_connect(a).unwrap();
        fx.manager
            .publish(a, "lamp/set".to_string(), b"on".to_vec(), Qos::AtMostOnce, false)
            .unwrap();
        pump(&mut fx.manager, |e| matches!(e.event, TransportEvent::Error(_))).await;

        assert!(drain(&mut fx.ui).iter().any(|e| matches!(
            e,
            UiEvent::ErrorOccurred {
                error: TransportError::NotConnected { .. },
                ..
            }
        )));
        assert!(fx.connector.published(a).is_empty());
        assert_eq!(fx.manager.store().messages().count(a).unwrap(), 0);
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn wildcard_publish_is_rejected() {
        let fx = fixture(1);
        assert!(matches!(
            fx.manager
                .publish(fx.ids[0], "a/#".to_string(), vec![], Qos::AtMostOnce, false),
            Err(SessionError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn automation_responds_on_the_active_session() {
        let mut fx = fixture(1);
        let a = fx.ids[0];
        fx.manager
            .store()
            .rules()
            .insert(&Rule {
                name: "overheat".to_string(),
                trigger_topic: "sensors/#".to_string(),
                condition: TriggerCondition::Contains,
                condition_value: "ERR".to_string(),
                response_topic: "alerts/{{topic}}".to_string(),
                response_payload: "echo: {{payload}}".to_string(),
                ..Rule::default()
            })
            .unwrap();
        fx.manager.set_active(Some(a));
        connect_all(&mut fx, &[a]).await;
        assert_eq!(fx.manager.automation().rule_count(), 1);

        fx.connector.inject(a, frame("sensors/1", "no issue", false));
        fx.connector.inject(a, frame("sensors/1", "ERR: overheat", false));
        pump(&mut fx.manager, |e| matches!(e.event, TransportEvent::Published { .. })).await;

        assert_eq!(
            fx.connector.published(a),
            vec![("alerts/sensors/1".to_string(), "echo: ERR: overheat".to_string())]
        );
        assert_eq!(fx.manager.store().messages().count(a).unwrap(), 3);
        assert!(drain(&mut fx.ui)
            .iter()
            .any(|e| matches!(e, UiEvent::MessagePublished(m) if m.topic == "alerts/sensors/1")));
        fx.manager.shutdown().await;
    }

    #[tokio::test]
    async fn removing_a_profile_clears_its_state() {
        let mut fx = fixture(1);
        let a = fx.ids[0];
        fx.manager.set_active(Some(a));
        connect_all(&mut fx, &[a]).await;
        fx.connector.inject(a, frame("t", "x", false));
        pump(&mut fx.manager, is_inbound).await;

        fx.manager.remove_profile(a).unwrap();
        assert_eq!(fx.manager.active(), None);
        assert_eq!(fx.manager.automation().bound_to(), None);
        assert_eq!(fx.manager.state(a), None);
        assert_eq!(fx.manager.store().messages().count(a).unwrap(), 0);
        assert!(matches!(
            fx.manager.request_connect(a),
            Err(SessionError::UnknownProfile(_))
        ));

        fx.manager.shutdown().await;
        assert!(fx.connector.sent(a).contains(&Sent::Disconnect));
    }

    #[tokio::test]
    async fn shutdown_waits_for_every_session() {
        let mut fx = fixture(3);
        let ids = fx.ids.clone();
        connect_all(&mut fx, &ids).await;

        fx.manager.shutdown().await;
        for id in ids {
            assert!(fx.connector.sent(id).contains(&Sent::Disconnect));
        }
        assert_eq!(fx.manager.live_count(), 0);
    }

    #[tokio::test]
    async fn removed_ids_are_forgotten_once_their_session_stopped() {
        let mut fx = fixture(2);
        let (a, b) = (fx.ids[0], fx.ids[1]);
        connect_all(&mut fx, &[a, b]).await;

        fx.manager.remove_profile(a).unwrap();
        assert!(fx.manager.removed.contains(&a));
        pump(&mut fx.manager, |e| e.connection_id == a && e.event == TransportEvent::Disconnected).await;

        let manager = &fx.manager;
        eventually(|| manager.retired.iter().all(|(_, task)| task.is_finished())).await;
        while let Ok(event) = fx.manager.events_rx.try_recv() {
            fx.manager.handle_event(event);
        }
        fx.manager.prune_retired();
        assert!(fx.manager.removed.is_empty());
        assert!(fx.manager.retired.is_empty());

        fx.manager.shutdown().await;
    }
}
