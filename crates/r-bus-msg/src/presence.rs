//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use r_bus_types::{DeviceValue, Primitive};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientEvent, Subscription};
use crate::transport::BusMessage;
use crate::{topic, Result};

/// Liveness change of a remote instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// Remote instance name.
    pub instance: String,
    /// New liveness.
    pub online: bool,
}

/// Tracks which remote instances are online.
pub struct Presence {
    inner: Arc<PresenceInner>,
    task: JoinHandle<()>,
}

struct PresenceInner {
    instance: String,
    online: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<PresenceEvent>,
}

impl Presence {
    /// Subscribe to liveness topics and start tracking.
    pub async fn start(client: &Client) -> Result<Self> {
        let mut client_events = client.events();
        let mut liveness = client.subscribe(topic::LIVENESS_PATTERN).await?;
        let (events, _) = broadcast::channel(client.config().event_capacity.max(1));
        let inner = Arc::new(PresenceInner {
            instance: client.instance_name().to_owned(),
            online: Mutex::new(BTreeSet::new()),
            events,
        });

        let tracker = inner.clone();
        let client = client.clone();
        let task = tokio::spawn(async move {
            loop {
                // Lifecycle first: a reconnect snapshot must never be applied
                // ahead of the disconnect that preceded it.
                tokio::select! {
                    biased;
                    event = client_events.recv() => match event {
                        Ok(ClientEvent::Disconnected) => tracker.mark_all_offline(),
                        Ok(ClientEvent::Connected) => {
                            if let Some(fresh) = tracker.resync(&client).await {
                                liveness = fresh;
                            }
                        }
                        Ok(ClientEvent::Error(_)) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "presence lagged behind client events");
                            if !client.is_online() {
                                tracker.mark_all_offline();
                            } else if let Some(fresh) = tracker.resync(&client).await {
                                liveness = fresh;
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                    message = liveness.recv() => match message {
                        Some(message) => tracker.apply(&message),
                        None => break,
                    },
                }
            }
            debug!(instance = %tracker.instance, "presence tracking stopped");
        });

        Ok(Self { inner, task })
    }

    /// Subscribe to liveness changes.
    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.inner.events.subscribe()
    }

    /// Instances currently online, sorted.
    pub fn online_instances(&self) -> Vec<String> {
        self.inner.online.lock().iter().cloned().collect()
    }

    /// Whether `instance` is online.
    pub fn is_online(&self, instance: &str) -> bool {
        self.inner.online.lock().contains(instance)
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl PresenceInner {
    /// Remote instance and liveness carried by a message, if it is one.
    fn liveness<'m>(&self, message: &'m BusMessage) -> Option<(&'m str, bool)> {
        let instance = topic::liveness_owner(&message.topic)?;
        if instance == self.instance {
            return None;
        }
        if message.is_tombstone() {
            return Some((instance, false));
        }
        match Primitive::Boolean.decode(&message.payload) {
            Ok(DeviceValue::Boolean(flag)) => Some((instance, flag)),
            Ok(_) => Some((instance, false)),
            Err(err) => {
                warn!(instance, error = %err, "ignoring malformed liveness payload");
                None
            }
        }
    }

    fn apply(&self, message: &BusMessage) {
        let Some((instance, online)) = self.liveness(message) else {
            return;
        };
        let changed = {
            let mut set = self.online.lock();
            if online {
                set.insert(instance.to_owned())
            } else {
                set.remove(instance)
            }
        };
        if changed {
            info!(instance, online, "instance liveness changed");
            self.notify(instance.to_owned(), online);
        }
    }

    /// Replace the tracked set with the retained liveness of a fresh
    /// subscription. Messages queued on the previous subscription belong to
    /// the old session and are discarded with it.
    async fn resync(&self, client: &Client) -> Option<Subscription> {
        let mut fresh = match client.subscribe(topic::LIVENESS_PATTERN).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(error = %err, "liveness resubscribe failed");
                return None;
            }
        };
        let mut current = BTreeSet::new();
        while let Some(message) = fresh.try_recv() {
            match self.liveness(&message) {
                Some((instance, true)) => {
                    current.insert(instance.to_owned());
                }
                Some((instance, false)) => {
                    current.remove(instance);
                }
                None => {}
            }
        }

        let previous = std::mem::replace(&mut *self.online.lock(), current.clone());
        for instance in previous.difference(&current) {
            self.notify(instance.clone(), false);
        }
        for instance in current.difference(&previous) {
            info!(instance = %instance, online = true, "instance liveness changed");
            self.notify(instance.clone(), true);
        }
        debug!(instance = %self.instance, online = current.len(), "presence resynchronised");
        Some(fresh)
    }

    fn mark_all_offline(&self) {
        let gone = std::mem::take(&mut *self.online.lock());
        for instance in gone {
            debug!(instance = %instance, "marking offline after local disconnect");
            self.notify(instance, false);
        }
    }

    fn notify(&self, instance: String, online: bool) {
        let _ = self.events.send(PresenceEvent { instance, online });
    }
}
