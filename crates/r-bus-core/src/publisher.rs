//! ---
//! bus_section: "01-core-functionality"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Registry reconstruction from remote metadata and local publication."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use r_bus_msg::{
    Client, ClientEvent, MetadataStore, Presence, PresenceEvent, RemoteView, ViewChange,
};
use r_bus_registry::{Component, Plugin, Registry, RegistryError, RegistryEvent, RemoteComponent};
use r_bus_types::{component_path, plugin_path, ComponentDescriptor, MetadataPath, PluginDescriptor};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Mirrors = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Keeps the registry in sync with every online remote instance and
/// publishes the objects of the own instance.
#[derive(Debug, Clone)]
pub struct BusPublisher {
    client: Client,
    registry: Arc<Registry>,
}

impl BusPublisher {
    pub fn new(client: Client, registry: Arc<Registry>) -> Self {
        Self { client, registry }
    }

    /// Start mirroring. Instances already online are picked up immediately.
    pub fn start(self, presence: Arc<Presence>) -> PublisherHandle {
        let mirrors: Mirrors = Arc::default();
        let presence_events = presence.events();
        for instance in presence.online_instances() {
            start_mirror(&self, &mirrors, &instance);
        }

        let publisher = self.clone();
        let tracked = mirrors.clone();
        let presence_task = tokio::spawn(async move {
            track_presence(publisher, presence, presence_events, tracked).await;
        });

        let registry_events = self.registry.events();
        let client_events = self.client.events();
        let publisher = self.clone();
        let local_task = tokio::spawn(async move {
            publish_local(publisher, registry_events, client_events).await;
        });

        info!(instance = %self.client.instance_name(), "bus publisher started");
        PublisherHandle {
            publisher: self,
            presence_task,
            local_task,
            mirrors,
        }
    }
}

/// Running publisher.
#[derive(Debug)]
pub struct PublisherHandle {
    publisher: BusPublisher,
    presence_task: JoinHandle<()>,
    local_task: JoinHandle<()>,
    mirrors: Mirrors,
}

impl PublisherHandle {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.publisher.registry
    }

    /// Remote instances with a running mirror, sorted.
    pub fn mirrored_instances(&self) -> Vec<String> {
        let mut instances: Vec<String> = self.mirrors.lock().keys().cloned().collect();
        instances.sort();
        instances
    }

    /// Stop every task and remove all remote objects from the registry.
    pub async fn shutdown(mut self) {
        self.presence_task.abort();
        self.local_task.abort();
        let _ = (&mut self.presence_task).await;
        let _ = (&mut self.local_task).await;

        let mirrors: Vec<(String, JoinHandle<()>)> = self.mirrors.lock().drain().collect();
        for (_, handle) in &mirrors {
            handle.abort();
        }
        let instances: Vec<String> = mirrors.iter().map(|(name, _)| name.clone()).collect();
        futures::future::join_all(mirrors.into_iter().map(|(_, handle)| handle)).await;
        for instance in instances {
            teardown(&self.publisher.registry, &instance);
        }
        info!(instance = %self.publisher.client.instance_name(), "bus publisher stopped");
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        self.presence_task.abort();
        self.local_task.abort();
        for (_, handle) in self.mirrors.lock().drain() {
            handle.abort();
        }
    }
}

async fn track_presence(
    publisher: BusPublisher,
    presence: Arc<Presence>,
    mut events: broadcast::Receiver<PresenceEvent>,
    mirrors: Mirrors,
) {
    loop {
        match events.recv().await {
            Ok(PresenceEvent {
                instance,
                online: true,
            }) => start_mirror(&publisher, &mirrors, &instance),
            Ok(PresenceEvent {
                instance,
                online: false,
            }) => stop_mirror(&publisher, &mirrors, &instance).await,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "publisher lagged behind presence, reconciling");
                let online = presence.online_instances();
                let stale: Vec<String> = mirrors
                    .lock()
                    .keys()
                    .filter(|name| !online.contains(name))
                    .cloned()
                    .collect();
                for instance in stale {
                    stop_mirror(&publisher, &mirrors, &instance).await;
                }
                for instance in online {
                    start_mirror(&publisher, &mirrors, &instance);
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn start_mirror(publisher: &BusPublisher, mirrors: &Mirrors, instance: &str) {
    let mut running = mirrors.lock();
    if let Some(handle) = running.get(instance) {
        if !handle.is_finished() {
            return;
        }
        // A finished mirror lost its view; rebuild from a clean slate.
        running.remove(instance);
        teardown(&publisher.registry, instance);
    }
    let mirror = InstanceMirror::new(publisher.clone(), instance);
    running.insert(instance.to_owned(), tokio::spawn(mirror.run()));
    debug!(instance, "instance mirror started");
}

async fn stop_mirror(publisher: &BusPublisher, mirrors: &Mirrors, instance: &str) {
    let handle = mirrors.lock().remove(instance);
    if let Some(handle) = handle {
        handle.abort();
        let _ = handle.await;
    }
    teardown(&publisher.registry, instance);
}

fn teardown(registry: &Registry, instance: &str) {
    let removed = registry.remove_instance(instance);
    for component in &removed.components {
        component.close();
    }
    if !removed.components.is_empty() || !removed.plugins.is_empty() {
        info!(
            instance,
            components = removed.components.len(),
            plugins = removed.plugins.len(),
            "remote instance removed"
        );
    }
}

/// Rebuilds the objects of one remote instance from its metadata.
struct InstanceMirror {
    publisher: BusPublisher,
    instance: String,
    // Components whose plugin is not registered yet, by component id.
    parked: BTreeMap<String, ComponentDescriptor>,
}

impl InstanceMirror {
    fn new(publisher: BusPublisher, instance: &str) -> Self {
        Self {
            publisher,
            instance: instance.to_owned(),
            parked: BTreeMap::new(),
        }
    }

    async fn run(mut self) {
        let mut view = match RemoteView::open(&self.publisher.client, &self.instance).await {
            Ok(view) => view,
            Err(err) => {
                warn!(instance = %self.instance, error = %err, "cannot open remote view");
                return;
            }
        };

        let mut snapshot: Vec<(String, Value)> = view
            .paths()
            .filter_map(|path| {
                view.find_value(path)
                    .map(|value| (path.to_owned(), value.clone()))
            })
            .collect();
        snapshot.sort_by_key(|(path, _)| !MetadataPath::classify(path).is_plugin());
        for (path, value) in snapshot {
            self.on_set(&path, value).await;
        }

        while let Some(change) = view.next_change().await {
            match change {
                ViewChange::Set { path, value } => self.on_set(&path, value).await,
                ViewChange::Clear { path } => self.on_clear(&path),
            }
        }
        debug!(instance = %self.instance, "remote view closed");
    }

    async fn on_set(&mut self, path: &str, value: Value) {
        match MetadataPath::classify(path) {
            MetadataPath::Plugin(id) => self.set_plugin(id, value).await,
            MetadataPath::Component(id) => self.set_component(id, value).await,
            MetadataPath::Other => {}
        }
    }

    fn on_clear(&mut self, path: &str) {
        match MetadataPath::classify(path) {
            MetadataPath::Plugin(id) => self.clear_plugin(id),
            MetadataPath::Component(id) => self.clear_component(id),
            MetadataPath::Other => {}
        }
    }

    async fn set_plugin(&mut self, id: &str, value: Value) {
        let descriptor: PluginDescriptor = match serde_json::from_value(value) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(instance = %self.instance, plugin = id, error = %err, "skipping undecodable plugin");
                return;
            }
        };
        if descriptor.id() != id {
            warn!(instance = %self.instance, path = id, plugin = %descriptor.id(), "plugin id does not match its path");
            return;
        }
        let registry = &self.publisher.registry;
        if registry.find_plugin(&self.instance, id).is_none() {
            if let Err(err) = registry.add_plugin(Plugin::new(&self.instance, descriptor)) {
                warn!(instance = %self.instance, plugin = id, error = %err, "plugin not added");
                return;
            }
        }

        let waiting: Vec<ComponentDescriptor> = self
            .parked
            .values()
            .filter(|component| component.plugin == id)
            .cloned()
            .collect();
        for component in waiting {
            self.parked.remove(&component.id);
            self.attach(component).await;
        }
    }

    async fn set_component(&mut self, id: &str, value: Value) {
        let descriptor: ComponentDescriptor = match serde_json::from_value(value) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(instance = %self.instance, component = id, error = %err, "skipping undecodable component");
                return;
            }
        };
        if descriptor.id != id {
            warn!(instance = %self.instance, path = id, component = %descriptor.id, "component id does not match its path");
            return;
        }
        if let Some(existing) = self.publisher.registry.find_component(id) {
            if existing.instance() != self.instance {
                warn!(instance = %self.instance, component = id, owner = %existing.instance(), "component id already owned by another instance");
            }
            return;
        }
        self.attach(descriptor).await;
    }

    async fn attach(&mut self, descriptor: ComponentDescriptor) {
        let registry = &self.publisher.registry;
        if registry
            .find_plugin(&self.instance, &descriptor.plugin)
            .is_none()
        {
            debug!(instance = %self.instance, component = %descriptor.id, plugin = %descriptor.plugin, "component waits for its plugin");
            self.parked.insert(descriptor.id.clone(), descriptor);
            return;
        }
        let component = match RemoteComponent::attach(
            &self.publisher.client,
            registry,
            &self.instance,
            &descriptor,
        )
        .await
        {
            Ok(component) => component,
            Err(RegistryError::UnknownPlugin { .. }) => {
                self.parked.insert(descriptor.id.clone(), descriptor);
                return;
            }
            Err(err) => {
                warn!(instance = %self.instance, component = %descriptor.id, error = %err, "cannot attach remote component");
                return;
            }
        };
        if let Err(err) = registry.add_component(component.clone()) {
            component.close();
            warn!(instance = %self.instance, component = %descriptor.id, error = %err, "component not added");
        }
    }

    fn clear_plugin(&mut self, id: &str) {
        let registry = &self.publisher.registry;
        if registry.find_plugin(&self.instance, id).is_none() {
            return;
        }
        for component in registry.components(&self.instance) {
            if component.plugin().id() != id {
                continue;
            }
            if registry.remove_component(component.id()).is_ok() {
                component.close();
                self.parked
                    .insert(component.id().to_owned(), component.descriptor());
            }
        }
        if let Err(err) = registry.remove_plugin(&self.instance, id) {
            debug!(instance = %self.instance, plugin = id, error = %err, "plugin already removed");
        }
    }

    fn clear_component(&mut self, id: &str) {
        if self.parked.remove(id).is_some() {
            return;
        }
        let registry = &self.publisher.registry;
        let owned = registry
            .find_component(id)
            .is_some_and(|component| component.instance() == self.instance);
        if owned {
            if let Ok(component) = registry.remove_component(id) {
                component.close();
            }
        }
    }
}

async fn publish_local(
    publisher: BusPublisher,
    mut registry_events: broadcast::Receiver<RegistryEvent>,
    mut client_events: broadcast::Receiver<ClientEvent>,
) {
    let store = MetadataStore::new(publisher.client.clone());
    let own = publisher.client.instance_name().to_owned();
    resync_local(&publisher, &store);
    loop {
        tokio::select! {
            event = registry_events.recv() => match event {
                Ok(event) if event.instance() == own => publish_event(&store, &event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "local publication lagged behind registry, resyncing");
                    resync_local(&publisher, &store);
                }
                Err(RecvError::Closed) => break,
            },
            event = client_events.recv() => match event {
                Ok(ClientEvent::Connected) => resync_local(&publisher, &store),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => resync_local(&publisher, &store),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn publish_event(store: &MetadataStore, event: &RegistryEvent) {
    let result = match event {
        RegistryEvent::PluginAdded(plugin) => {
            store.set(&plugin_path(plugin.id()), plugin.descriptor())
        }
        RegistryEvent::PluginRemoved(plugin) => store.clear(&plugin_path(plugin.id())),
        RegistryEvent::ComponentAdded(component) => {
            store.set(&component_path(component.id()), &component.descriptor())
        }
        RegistryEvent::ComponentRemoved(component) => store.clear(&component_path(component.id())),
    };
    if let Err(err) = result {
        warn!(kind = event.kind(), error = %err, "local metadata not published");
    }
}

fn resync_local(publisher: &BusPublisher, store: &MetadataStore) {
    let own = publisher.client.instance_name();
    let plugins = publisher.registry.plugins(own);
    let components = publisher.registry.components(own);
    for plugin in &plugins {
        publish_event(store, &RegistryEvent::PluginAdded(plugin.clone()));
    }
    for component in &components {
        publish_event(store, &RegistryEvent::ComponentAdded(component.clone()));
    }
    debug!(
        instance = own,
        plugins = plugins.len(),
        components = components.len(),
        "local metadata resynced"
    );
}
