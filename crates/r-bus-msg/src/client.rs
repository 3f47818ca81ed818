//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Connection owner for one bus instance.
//!
//! The client keeps the transport session, reference-counted subscriptions
//! and an offline publish queue. Connecting runs resident-state clearing
//! before the instance announces itself online, so retained entries left
//! behind by a previous incarnation under the same name never leak into the
//! new session.
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use r_bus_common::{BusConfig, ClientConfig};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::logging::{log_message, Counters, MessageDirection, MessagingMetrics};
use crate::transport::{BusMessage, ConnectOptions, LastWill, Session, Transport, TransportEvent};
use crate::{topic, BusError, MessagingMetricsExporter, Result};

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connect sequence completed; the instance is online.
    Connected,
    /// Session closed, cleanly or not.
    Disconnected,
    /// Non-fatal transport failure.
    Error(String),
}

/// Handle to a bus connection. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    instance: String,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<ClientState>,
    lifecycle: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ClientEvent>,
    counters: Counters,
    exporter: OnceCell<Arc<MessagingMetricsExporter>>,
}

#[derive(Default)]
struct ClientState {
    session: Option<Arc<dyn Session>>,
    online: bool,
    generation: u64,
    patterns: HashMap<String, PatternEntry>,
    sinks: Vec<Sink>,
    next_sink: u64,
    pending_acks: HashMap<String, Vec<oneshot::Sender<()>>>,
    offline_queue: VecDeque<QueuedPublish>,
    dispatcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct PatternEntry {
    refs: usize,
    active: bool,
}

struct Sink {
    id: u64,
    pattern: String,
    awaiting_snapshot: bool,
    sender: mpsc::UnboundedSender<BusMessage>,
}

struct QueuedPublish {
    topic: String,
    payload: Bytes,
    retain: bool,
}

/// Live subscription to a topic pattern. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    pattern: String,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    client: Weak<ClientInner>,
}

impl Subscription {
    /// Subscribed pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next routed message; `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Next already queued message, if any.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.release(self.id, &self.pattern);
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("instance", &self.inner.instance)
            .field("transport", &self.inner.transport.name())
            .field("online", &self.is_online())
            .finish()
    }
}

impl Client {
    /// Build a disconnected client for `config.instance_name`.
    pub fn new(config: &BusConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(config.client.event_capacity.max(1));
        Self {
            inner: Arc::new(ClientInner {
                instance: config.instance_name.clone(),
                config: config.client.clone(),
                transport,
                state: Mutex::new(ClientState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
                events,
                counters: Counters::default(),
                exporter: OnceCell::new(),
            }),
        }
    }

    /// Name of the owning instance.
    pub fn instance_name(&self) -> &str {
        &self.inner.instance
    }

    /// Connection settings.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether the connect sequence has completed on the current session.
    pub fn is_online(&self) -> bool {
        self.inner.state.lock().online
    }

    /// Subscribe to lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the messaging counters.
    pub fn metrics(&self) -> MessagingMetrics {
        self.inner.counters.snapshot()
    }

    /// Patterns with at least one live [`Subscription`], sorted.
    pub fn active_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.inner.state.lock().patterns.keys().cloned().collect();
        patterns.sort();
        patterns
    }

    /// Mirror counters into Prometheus. Only the first exporter is kept.
    pub fn attach_exporter(&self, exporter: Arc<MessagingMetricsExporter>) -> bool {
        self.inner.exporter.set(exporter).is_ok()
    }

    pub(crate) fn observe_latency(&self, duration: Duration) {
        if let Some(exporter) = self.inner.exporter.get() {
            exporter.observe_latency(duration);
        }
    }

    /// `<instance>/<domain>/<args..>` for the own instance.
    pub fn topic(&self, domain: &str, args: &[&str]) -> String {
        topic::build(&self.inner.instance, domain, args)
    }

    /// Open the transport session and run the connect sequence: resident-state
    /// clearing, liveness announcement, resubscription and offline queue flush.
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.has_live_session() {
            return Ok(());
        }
        if self.inner.state.lock().session.is_some() {
            // Closed transport whose dispatcher has not caught up yet.
            self.inner.shutdown_session();
            warn!(instance = %self.inner.instance, "bus connection lost; reconnecting");
            self.inner.emit(ClientEvent::Disconnected);
        }

        let liveness = topic::liveness(&self.inner.instance);
        let options = ConnectOptions {
            client_id: self.inner.instance.clone(),
            will: Some(LastWill {
                topic: liveness.clone(),
                payload: Bytes::new(),
                retain: true,
            }),
        };
        let link = match self.inner.transport.open(options).await {
            Ok(link) => link,
            Err(err) => {
                self.inner.emit(ClientEvent::Error(err.to_string()));
                return Err(err);
            }
        };

        let session = link.session;
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.session = Some(session.clone());
            let generation = state.generation;
            state.dispatcher = Some(tokio::spawn(dispatch(
                Arc::downgrade(&self.inner),
                link.events,
                generation,
            )));
            generation
        };

        match self.establish(&session, &liveness, generation).await {
            Ok((cleared, flushed)) => {
                info!(
                    instance = %self.inner.instance,
                    transport = self.inner.transport.name(),
                    cleared,
                    flushed,
                    "bus client online"
                );
                self.inner.emit(ClientEvent::Connected);
                Ok(())
            }
            Err(err) => {
                warn!(instance = %self.inner.instance, error = %err, "connect sequence failed");
                self.inner.shutdown_session();
                self.inner.emit(ClientEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        session: &Arc<dyn Session>,
        liveness: &str,
        generation: u64,
    ) -> Result<(usize, usize)> {
        let cleared = self.clear_resident_state(session).await?;
        self.inner
            .send(session, liveness, Bytes::from_static(&[0x01]), true)?;

        for waiter in self.inner.activate_pending() {
            let _ = waiter.await;
        }

        let mut state = self.inner.state.lock();
        if state.generation != generation || state.session.is_none() {
            return Err(BusError::Connection(
                "connection lost while connecting".into(),
            ));
        }
        let queue = std::mem::take(&mut state.offline_queue);
        let flushed = queue.len();
        for queued in queue {
            if let Err(err) = self
                .inner
                .send(session, &queued.topic, queued.payload, queued.retain)
            {
                warn!(topic = %queued.topic, error = %err, "dropping queued publish");
            }
        }
        state.online = true;
        Ok((cleared, flushed))
    }

    /// Announce offline, clear the own retained namespace and close the session.
    pub async fn terminate(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let session = {
            let mut state = self.inner.state.lock();
            let Some(session) = state.session.clone() else {
                return Ok(());
            };
            state.online = false;
            session
        };

        let liveness = topic::liveness(&self.inner.instance);
        let outcome = match self.inner.send(&session, &liveness, Bytes::new(), true) {
            Ok(()) => self.clear_resident_state(&session).await.map(|_| ()),
            Err(err) => Err(err),
        };

        self.inner.shutdown_session();
        info!(instance = %self.inner.instance, "bus client terminated");
        self.inner.emit(ClientEvent::Disconnected);
        outcome
    }

    /// Publish a payload, or queue it while offline.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) -> Result<()> {
        let payload = payload.into();
        let mut state = self.inner.state.lock();
        if state.online {
            if let Some(session) = state.session.clone() {
                return self.inner.send(&session, topic, payload, retain);
            }
        }

        let limit = self.inner.config.offline_queue_limit;
        if limit == 0 {
            self.inner.dropped();
            return Err(BusError::Offline);
        }
        if state.offline_queue.len() >= limit {
            if let Some(evicted) = state.offline_queue.pop_front() {
                self.inner.dropped();
                warn!(topic = %evicted.topic, limit, "offline queue full; dropping oldest publish");
            }
        }
        log_message(
            MessageDirection::Queued,
            &BusMessage {
                topic: topic.to_owned(),
                payload: payload.clone(),
                retained: retain,
            },
        );
        state.offline_queue.push_back(QueuedPublish {
            topic: topic.to_owned(),
            payload,
            retain,
        });
        self.inner.counters.queued();
        if let Some(exporter) = self.inner.exporter.get() {
            exporter.observe_queued();
        }
        Ok(())
    }

    /// Subscribe to a pattern. While connected this resolves after the
    /// transport acknowledged, with retained matches already queued.
    pub async fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (id, waiter) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.next_sink += 1;
            let id = state.next_sink;
            state.sinks.push(Sink {
                id,
                pattern: pattern.to_owned(),
                awaiting_snapshot: true,
                sender,
            });
            state.patterns.entry(pattern.to_owned()).or_default().refs += 1;
            let waiter = match state.session.clone() {
                Some(session) => match self.inner.request_subscription(state, &session, pattern) {
                    Ok(waiter) => Some(waiter),
                    Err(err) => {
                        warn!(pattern, error = %err, "subscribe request failed");
                        self.inner.emit(ClientEvent::Error(err.to_string()));
                        None
                    }
                },
                None => None,
            };
            (id, waiter)
        };

        let subscription = Subscription {
            id,
            pattern: pattern.to_owned(),
            receiver,
            client: Arc::downgrade(&self.inner),
        };
        if let Some(waiter) = waiter {
            let _ = waiter.await;
        }
        Ok(subscription)
    }

    async fn clear_resident_state(&self, session: &Arc<dyn Session>) -> Result<usize> {
        let mut subscription = self
            .subscribe(&topic::namespace_pattern(&self.inner.instance))
            .await?;
        tokio::time::sleep(self.inner.config.resident_state_grace).await;

        let mut stale = BTreeSet::new();
        while let Some(message) = subscription.try_recv() {
            if message.retained && !message.is_tombstone() {
                stale.insert(message.topic);
            }
        }
        drop(subscription);

        for topic in &stale {
            self.inner.send(session, topic, Bytes::new(), true)?;
        }
        if !stale.is_empty() {
            debug!(instance = %self.inner.instance, count = stale.len(), "cleared resident state");
        }
        Ok(stale.len())
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn has_live_session(&self) -> bool {
        let state = self.state.lock();
        let dispatching = state
            .dispatcher
            .as_ref()
            .is_some_and(|dispatcher| !dispatcher.is_finished());
        state
            .session
            .as_ref()
            .is_some_and(|session| dispatching && session.is_open())
    }

    fn dropped(&self) {
        self.counters.dropped();
        if let Some(exporter) = self.exporter.get() {
            exporter.observe_dropped();
        }
    }

    fn send(
        &self,
        session: &Arc<dyn Session>,
        topic: &str,
        payload: Bytes,
        retain: bool,
    ) -> Result<()> {
        let message = BusMessage {
            topic: topic.to_owned(),
            payload,
            retained: retain,
        };
        match session.publish(&message.topic, message.payload.clone(), retain) {
            Ok(()) => {
                self.counters.sent();
                if let Some(exporter) = self.exporter.get() {
                    exporter.observe_sent();
                }
                log_message(MessageDirection::Outbound, &message);
                Ok(())
            }
            Err(err) => {
                self.dropped();
                Err(err)
            }
        }
    }

    fn observe_received(&self, message: &BusMessage) {
        self.counters.received();
        if let Some(exporter) = self.exporter.get() {
            exporter.observe_received();
        }
        log_message(MessageDirection::Inbound, message);
    }

    fn request_subscription(
        &self,
        state: &mut ClientState,
        session: &Arc<dyn Session>,
        pattern: &str,
    ) -> Result<oneshot::Receiver<()>> {
        session.subscribe(pattern)?;
        let (ack, waiter) = oneshot::channel();
        state
            .pending_acks
            .entry(pattern.to_owned())
            .or_default()
            .push(ack);
        if let Some(entry) = state.patterns.get_mut(pattern) {
            entry.active = true;
        }
        Ok(waiter)
    }

    /// Send every pattern requested while offline; every sink on those
    /// patterns receives the fresh retained snapshot.
    fn activate_pending(&self) -> Vec<oneshot::Receiver<()>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(session) = state.session.clone() else {
            return Vec::new();
        };
        let pending: Vec<String> = state
            .patterns
            .iter()
            .filter(|(_, entry)| !entry.active)
            .map(|(pattern, _)| pattern.clone())
            .collect();

        let mut waiters = Vec::with_capacity(pending.len());
        for pattern in pending {
            for sink in state.sinks.iter_mut().filter(|sink| sink.pattern == pattern) {
                sink.awaiting_snapshot = true;
            }
            match self.request_subscription(state, &session, &pattern) {
                Ok(waiter) => waiters.push(waiter),
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "resubscribe failed");
                    self.emit(ClientEvent::Error(err.to_string()));
                }
            }
        }
        waiters
    }

    fn release(&self, id: u64, pattern: &str) {
        let mut state = self.state.lock();
        state.sinks.retain(|sink| sink.id != id);
        let Some(entry) = state.patterns.get_mut(pattern) else {
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let active = entry.active;
        state.patterns.remove(pattern);
        state.pending_acks.remove(pattern);
        if active {
            if let Some(session) = &state.session {
                if let Err(err) = session.unsubscribe(pattern) {
                    debug!(pattern, error = %err, "unsubscribe failed");
                }
            }
        }
    }

    fn route(&self, message: BusMessage) {
        self.observe_received(&message);
        let state = self.state.lock();
        for sink in &state.sinks {
            let active = state
                .patterns
                .get(&sink.pattern)
                .is_some_and(|entry| entry.active);
            if active && topic::matches(&sink.pattern, &message.topic) {
                let _ = sink.sender.send(message.clone());
            }
        }
    }

    fn complete_subscription(&self, pattern: &str, snapshot: Vec<BusMessage>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for sink in state
            .sinks
            .iter_mut()
            .filter(|sink| sink.awaiting_snapshot && sink.pattern == pattern)
        {
            for message in snapshot.iter().filter(|m| topic::matches(pattern, &m.topic)) {
                let _ = sink.sender.send(message.clone());
            }
            sink.awaiting_snapshot = false;
        }
        if let Some(acks) = state.pending_acks.remove(pattern) {
            for ack in acks {
                let _ = ack.send(());
            }
        }
        drop(guard);
        for message in &snapshot {
            self.observe_received(message);
        }
    }

    fn connection_lost(&self, generation: u64) {
        let was_online = {
            let mut state = self.state.lock();
            if state.generation != generation || state.session.is_none() {
                return;
            }
            state.session = None;
            state.dispatcher = None;
            state.pending_acks.clear();
            for entry in state.patterns.values_mut() {
                entry.active = false;
            }
            std::mem::replace(&mut state.online, false)
        };
        warn!(instance = %self.instance, was_online, "bus connection lost");
        self.emit(ClientEvent::Disconnected);
    }

    fn shutdown_session(&self) {
        let (session, dispatcher) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.online = false;
            state.pending_acks.clear();
            for entry in state.patterns.values_mut() {
                entry.active = false;
            }
            (state.session.take(), state.dispatcher.take())
        };
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        if let Some(session) = session {
            if let Err(err) = session.close() {
                debug!(error = %err, "session close failed");
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.state.get_mut().dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Single consumer of transport events. Retained replays are buffered until
/// the acknowledgement naming their subscription arrives.
async fn dispatch(
    client: Weak<ClientInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    generation: u64,
) {
    let mut snapshot = Vec::new();
    while let Some(event) = events.recv().await {
        let Some(inner) = client.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(message) if message.retained => snapshot.push(message),
            TransportEvent::Message(message) => inner.route(message),
            TransportEvent::SubAck(pattern) => {
                inner.complete_subscription(&pattern, std::mem::take(&mut snapshot))
            }
            TransportEvent::Closed => break,
        }
    }
    if let Some(inner) = client.upgrade() {
        inner.connection_lost(generation);
    }
}
