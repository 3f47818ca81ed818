//! ---
//! bus_section: "03-registry"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Plugin and component registry with remote proxies."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Component objects: proxies of remote devices and devices hosted here.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use r_bus_msg::{topic, Client, LocalComponentChannel, RemoteComponentChannel};
use r_bus_types::{ComponentDescriptor, DeviceValue, Member};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::registry::{Plugin, Registry};
use crate::{RegistryError, Result};

const STATE_CHANGE_CAPACITY: usize = 64;

/// A device instance registered in the [`Registry`].
pub trait Component: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Instance hosting the device.
    fn instance(&self) -> &str;

    fn plugin(&self) -> &Arc<Plugin>;

    /// Last known value of state `member`.
    fn state(&self, member: &str) -> Option<DeviceValue>;

    /// Validate, encode and send `value` to action `member`.
    fn execute_action(&self, member: &str, value: DeviceValue) -> Result<()>;

    /// Release every subscription held by the component.
    fn close(&self);

    fn descriptor(&self) -> ComponentDescriptor {
        ComponentDescriptor::new(self.id(), self.plugin().id())
    }
}

/// Decoded value published on a state member.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub component: String,
    pub member: String,
    pub value: DeviceValue,
}

fn lookup<'a>(plugin: &'a Plugin, component: &str, member: &str) -> Result<&'a Member> {
    plugin
        .descriptor()
        .member(member)
        .ok_or_else(|| RegistryError::UnknownMember {
            component: component.to_owned(),
            member: member.to_owned(),
        })
}

/// Payload for action `member` of `component`, checked against the plugin.
pub fn encode_action(
    plugin: &Plugin,
    component: &str,
    member: &str,
    value: &DeviceValue,
) -> Result<Bytes> {
    let declared = lookup(plugin, component, member)?;
    if !declared.is_action() {
        return Err(RegistryError::NotAnAction {
            component: component.to_owned(),
            member: member.to_owned(),
        });
    }
    Ok(declared.value_type.encode(value)?)
}

type StateCache = Arc<Mutex<HashMap<String, DeviceValue>>>;

/// Proxy of a component hosted by another instance.
pub struct RemoteComponent {
    id: String,
    plugin: Arc<Plugin>,
    channel: RemoteComponentChannel,
    states: StateCache,
    changes: broadcast::Sender<StateChange>,
}

impl fmt::Debug for RemoteComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteComponent")
            .field("id", &self.id)
            .field("instance", &self.plugin.instance())
            .field("plugin", &self.plugin.id())
            .finish()
    }
}

impl RemoteComponent {
    /// Build the proxy for `descriptor` published by `instance`. The plugin
    /// must already be registered for that instance.
    pub async fn attach(
        client: &Client,
        registry: &Registry,
        instance: &str,
        descriptor: &ComponentDescriptor,
    ) -> Result<Arc<Self>> {
        let plugin = registry.get_plugin(instance, &descriptor.plugin)?;
        let (changes, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        let component = Arc::new(Self {
            id: descriptor.id.clone(),
            channel: RemoteComponentChannel::new(client.clone(), instance, &descriptor.id),
            plugin,
            states: StateCache::default(),
            changes,
        });

        let members: Vec<(String, Member)> = component
            .plugin
            .descriptor()
            .state_members()
            .map(|(name, member)| (name.to_owned(), member.clone()))
            .collect();
        for (name, member) in members {
            let states = component.states.clone();
            let changes = component.changes.clone();
            let id = component.id.clone();
            let member_name = name.clone();
            let registered = component
                .channel
                .register_state_change(&name, move |payload| {
                    match member.value_type.decode(&payload) {
                        Ok(value) => {
                            states.lock().insert(member_name.clone(), value.clone());
                            let _ = changes.send(StateChange {
                                component: id.clone(),
                                member: member_name.clone(),
                                value,
                            });
                        }
                        Err(err) => {
                            warn!(component = %id, member = %member_name, error = %err, "undecodable state payload");
                        }
                    }
                })
                .await;
            if let Err(err) = registered {
                component.close();
                return Err(err.into());
            }
        }
        debug!(component = %component.id, instance, "remote component attached");
        Ok(component)
    }

    /// Every decoded state update from now on.
    pub fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

impl Component for RemoteComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn instance(&self) -> &str {
        self.plugin.instance()
    }

    fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    fn state(&self, member: &str) -> Option<DeviceValue> {
        self.states.lock().get(member).cloned()
    }

    fn execute_action(&self, member: &str, value: DeviceValue) -> Result<()> {
        let payload = encode_action(&self.plugin, &self.id, member, &value)?;
        self.channel.emit_action(member, payload)?;
        Ok(())
    }

    fn close(&self) {
        self.channel.close();
    }
}

/// Component hosted by the own instance.
pub struct HostedComponent {
    id: String,
    plugin: Arc<Plugin>,
    client: Client,
    channel: LocalComponentChannel,
    states: Mutex<HashMap<String, DeviceValue>>,
}

impl fmt::Debug for HostedComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostedComponent")
            .field("id", &self.id)
            .field("plugin", &self.plugin.id())
            .finish()
    }
}

impl HostedComponent {
    pub fn new(client: &Client, plugin: Arc<Plugin>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            channel: LocalComponentChannel::new(client.clone(), &id),
            client: client.clone(),
            id,
            plugin,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Invoke `handler` with each valid value sent to action `member`.
    /// Payloads that fail to decode or validate are dropped.
    pub async fn on_action<F>(&self, member: &str, handler: F) -> Result<()>
    where
        F: Fn(DeviceValue) + Send + Sync + 'static,
    {
        let declared = lookup(&self.plugin, &self.id, member)?;
        if !declared.is_action() {
            return Err(RegistryError::NotAnAction {
                component: self.id.clone(),
                member: member.to_owned(),
            });
        }
        let value_type = declared.value_type.clone();
        let id = self.id.clone();
        let member_name = member.to_owned();
        self.channel
            .register_action(member, move |payload| {
                let decoded = value_type
                    .decode(&payload)
                    .map_err(RegistryError::from)
                    .and_then(|value| {
                        value_type.validate(&value)?;
                        Ok(value)
                    });
                match decoded {
                    Ok(value) => handler(value),
                    Err(err) => {
                        warn!(component = %id, member = %member_name, error = %err, "rejected action payload");
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Validate, cache and publish a new value of state `member`.
    pub fn set_state(&self, member: &str, value: DeviceValue) -> Result<()> {
        let declared = lookup(&self.plugin, &self.id, member)?;
        if declared.is_action() {
            return Err(RegistryError::NotAState {
                component: self.id.clone(),
                member: member.to_owned(),
            });
        }
        let payload = declared.value_type.encode(&value)?;
        self.states.lock().insert(member.to_owned(), value);
        self.channel.set_state(member, payload)?;
        Ok(())
    }
}

impl Component for HostedComponent {
    fn id(&self) -> &str {
        &self.id
    }

    fn instance(&self) -> &str {
        self.plugin.instance()
    }

    fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }

    fn state(&self, member: &str) -> Option<DeviceValue> {
        self.states.lock().get(member).cloned()
    }

    fn execute_action(&self, member: &str, value: DeviceValue) -> Result<()> {
        let payload = encode_action(&self.plugin, &self.id, member, &value)?;
        let topic = topic::component_member(self.client.instance_name(), &self.id, member);
        self.client.publish(&topic, payload, false)?;
        Ok(())
    }

    fn close(&self) {
        self.channel.close();
    }
}
