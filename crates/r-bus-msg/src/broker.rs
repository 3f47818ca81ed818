//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::topic;
use crate::transport::{
    BusMessage, ConnectOptions, LastWill, Session, Transport, TransportEvent, TransportLink,
};
use crate::{BusError, Result};

/// In-process broker with retained-message semantics, for tests and
/// single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    next_session: u64,
    sessions: HashMap<u64, SessionEntry>,
    clients: HashMap<String, u64>,
    retained: BTreeMap<String, Bytes>,
}

struct SessionEntry {
    client_id: String,
    sender: mpsc::UnboundedSender<TransportEvent>,
    patterns: BTreeSet<String>,
    will: Option<LastWill>,
}

impl BrokerState {
    fn publish(&mut self, topic: &str, payload: Bytes, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_owned(), payload.clone());
            }
        }
        for entry in self.sessions.values() {
            if entry.patterns.iter().any(|pattern| topic::matches(pattern, topic)) {
                let _ = entry.sender.send(TransportEvent::Message(BusMessage {
                    topic: topic.to_owned(),
                    payload: payload.clone(),
                    retained: false,
                }));
            }
        }
    }

    fn session(&mut self, id: u64) -> Result<&mut SessionEntry> {
        self.sessions
            .get_mut(&id)
            .ok_or_else(|| BusError::Connection("session is closed".into()))
    }

    fn remove(&mut self, id: u64) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&id)?;
        if self.clients.get(&entry.client_id) == Some(&id) {
            self.clients.remove(&entry.client_id);
        }
        Some(entry)
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a client's connection as if the network failed: the session
    /// receives [`TransportEvent::Closed`] and its last will is published.
    pub fn sever(&self, client_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(id) = state.clients.get(client_id).copied() else {
            return false;
        };
        let Some(entry) = state.remove(id) else {
            return false;
        };
        debug!(client_id, "severing broker session");
        let _ = entry.sender.send(TransportEvent::Closed);
        if let Some(will) = entry.will {
            state.publish(&will.topic, will.payload, will.retain);
        }
        true
    }

    /// Retained payload stored for an exact topic.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Retained topics starting with `prefix`, sorted.
    pub fn retained_topics(&self, prefix: &str) -> Vec<String> {
        self.state
            .lock()
            .retained
            .keys()
            .filter(|topic| topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Whether a client currently holds a session.
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state.lock().clients.contains_key(client_id)
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn open(&self, options: ConnectOptions) -> Result<TransportLink> {
        let (sender, events) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if let Some(previous) = state.clients.get(&options.client_id).copied() {
            if let Some(entry) = state.remove(previous) {
                debug!(client_id = %options.client_id, "session taken over");
                let _ = entry.sender.send(TransportEvent::Closed);
            }
        }
        state.next_session += 1;
        let id = state.next_session;
        state.clients.insert(options.client_id.clone(), id);
        state.sessions.insert(
            id,
            SessionEntry {
                client_id: options.client_id,
                sender,
                patterns: BTreeSet::new(),
                will: options.will,
            },
        );
        Ok(TransportLink {
            session: Arc::new(BrokerSession {
                state: self.state.clone(),
                id,
            }),
            events,
        })
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

struct BrokerSession {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl Session for BrokerSession {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.session(self.id)?;
        state.publish(topic, payload, retain);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state
            .sessions
            .get_mut(&self.id)
            .ok_or_else(|| BusError::Connection("session is closed".into()))?;
        entry.patterns.insert(pattern.to_owned());
        for (topic, payload) in &state.retained {
            if topic::matches(pattern, topic) {
                let _ = entry.sender.send(TransportEvent::Message(BusMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retained: true,
                }));
            }
        }
        let _ = entry.sender.send(TransportEvent::SubAck(pattern.to_owned()));
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.session(self.id)?.patterns.remove(pattern);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.state.lock().remove(self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().sessions.contains_key(&self.id)
    }
}
