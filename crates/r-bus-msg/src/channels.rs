//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::Client;
use crate::{topic, BusError, Result};

/// Member channels of one component: `<instance>/localComponents/<id>/<member>`.
struct MemberChannels {
    client: Client,
    instance: String,
    component: String,
    // `None` marks a member whose subscription is still being established.
    listeners: Mutex<HashMap<String, Option<JoinHandle<()>>>>,
}

impl MemberChannels {
    fn new(client: Client, instance: &str, component: &str) -> Self {
        Self {
            client,
            instance: instance.to_owned(),
            component: component.to_owned(),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn topic(&self, member: &str) -> String {
        topic::component_member(&self.instance, &self.component, member)
    }

    async fn listen<F>(&self, member: &str, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        {
            let mut listeners = self.listeners.lock();
            if listeners.contains_key(member) {
                return Err(BusError::DuplicateMember {
                    member: member.to_owned(),
                    component: self.component.clone(),
                });
            }
            listeners.insert(member.to_owned(), None);
        }

        let mut subscription = match self.client.subscribe(&self.topic(member)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.listeners.lock().remove(member);
                return Err(err);
            }
        };
        let handle = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                if !message.is_tombstone() {
                    handler(message.payload);
                }
            }
        });

        let mut listeners = self.listeners.lock();
        match listeners.get_mut(member) {
            Some(slot) => *slot = Some(handle),
            None => handle.abort(),
        }
        Ok(())
    }

    fn send(&self, member: &str, payload: Bytes) -> Result<()> {
        self.client.publish(&self.topic(member), payload, false)
    }

    fn close(&self) {
        let listeners: Vec<_> = self.listeners.lock().drain().collect();
        for (member, handle) in listeners {
            if let Some(handle) = handle {
                handle.abort();
            }
            debug!(component = %self.component, member = %member, "member channel closed");
        }
    }
}

/// Producer side of a component hosted by the own instance: receives
/// actions, publishes state.
pub struct LocalComponentChannel {
    channels: MemberChannels,
}

impl LocalComponentChannel {
    /// Channels for `component` under the own instance.
    pub fn new(client: Client, component: &str) -> Self {
        let instance = client.instance_name().to_owned();
        Self {
            channels: MemberChannels::new(client, &instance, component),
        }
    }

    /// Component id.
    pub fn component_id(&self) -> &str {
        &self.channels.component
    }

    /// Invoke `handler` with every payload sent to action `member`.
    pub async fn register_action<F>(&self, member: &str, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.channels.listen(member, handler).await
    }

    /// Publish a new value of state `member`.
    pub fn set_state(&self, member: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.channels.send(member, payload.into())
    }

    /// Drop every action subscription.
    pub fn close(&self) {
        self.channels.close();
    }
}

impl Drop for LocalComponentChannel {
    fn drop(&mut self) {
        self.channels.close();
    }
}

/// Consumer side of a component hosted by another instance: sends actions,
/// observes state.
pub struct RemoteComponentChannel {
    channels: MemberChannels,
}

impl RemoteComponentChannel {
    /// Channels for `component` hosted by `instance`.
    pub fn new(client: Client, instance: &str, component: &str) -> Self {
        Self {
            channels: MemberChannels::new(client, instance, component),
        }
    }

    /// Hosting instance.
    pub fn instance(&self) -> &str {
        &self.channels.instance
    }

    /// Component id.
    pub fn component_id(&self) -> &str {
        &self.channels.component
    }

    /// Send a payload to action `member`.
    pub fn emit_action(&self, member: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.channels.send(member, payload.into())
    }

    /// Invoke `handler` with every published value of state `member`.
    pub async fn register_state_change<F>(&self, member: &str, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.channels.listen(member, handler).await
    }

    /// Drop every state subscription.
    pub fn close(&self) {
        self.channels.close();
    }
}

impl Drop for RemoteComponentChannel {
    fn drop(&mut self) {
        self.channels.close();
    }
}
