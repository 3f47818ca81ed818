//! ---
//! bus_section: "03-registry"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Plugin and component registry with remote proxies."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use r_bus_types::PluginDescriptor;
use tokio::sync::broadcast;
use tracing::debug;

use crate::component::Component;
use crate::{RegistryError, Result};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Plugin published by an instance.
#[derive(Debug)]
pub struct Plugin {
    instance: String,
    id: String,
    descriptor: PluginDescriptor,
}

impl Plugin {
    pub fn new(instance: impl Into<String>, descriptor: PluginDescriptor) -> Self {
        Self {
            instance: instance.into(),
            id: descriptor.id(),
            descriptor,
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// `module.name`.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Index key `instance:module.name`.
    pub fn key(&self) -> String {
        plugin_key(&self.instance, &self.id)
    }
}

fn plugin_key(instance: &str, plugin: &str) -> String {
    format!("{instance}:{plugin}")
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    PluginAdded(Arc<Plugin>),
    PluginRemoved(Arc<Plugin>),
    ComponentAdded(Arc<dyn Component>),
    ComponentRemoved(Arc<dyn Component>),
}

impl RegistryEvent {
    /// Instance owning the affected object.
    pub fn instance(&self) -> &str {
        match self {
            RegistryEvent::PluginAdded(plugin) | RegistryEvent::PluginRemoved(plugin) => {
                plugin.instance()
            }
            RegistryEvent::ComponentAdded(component)
            | RegistryEvent::ComponentRemoved(component) => component.instance(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::PluginAdded(_) => "plugin_added",
            RegistryEvent::PluginRemoved(_) => "plugin_removed",
            RegistryEvent::ComponentAdded(_) => "component_added",
            RegistryEvent::ComponentRemoved(_) => "component_removed",
        }
    }
}

/// Objects dropped by [`Registry::remove_instance`], in removal order.
#[derive(Debug, Default)]
pub struct RemovedObjects {
    pub components: Vec<Arc<dyn Component>>,
    pub plugins: Vec<Arc<Plugin>>,
}

#[derive(Default)]
struct RegistryIndex {
    plugins: HashMap<String, Arc<Plugin>>,
    components: HashMap<String, Arc<dyn Component>>,
    instances: BTreeMap<String, InstanceObjects>,
}

#[derive(Default)]
struct InstanceObjects {
    plugins: BTreeSet<String>,
    components: BTreeSet<String>,
}

impl RegistryIndex {
    fn prune(&mut self, instance: &str) {
        let empty = self
            .instances
            .get(instance)
            .is_some_and(|objects| objects.plugins.is_empty() && objects.components.is_empty());
        if empty {
            self.instances.remove(instance);
        }
    }

    fn take_component(&mut self, id: &str) -> Option<Arc<dyn Component>> {
        let component = self.components.remove(id)?;
        if let Some(objects) = self.instances.get_mut(component.instance()) {
            objects.components.remove(id);
        }
        self.prune(component.instance());
        Some(component)
    }

    fn take_plugin(&mut self, instance: &str, plugin: &str) -> Option<Arc<Plugin>> {
        let removed = self.plugins.remove(&plugin_key(instance, plugin))?;
        if let Some(objects) = self.instances.get_mut(instance) {
            objects.plugins.remove(plugin);
        }
        self.prune(instance);
        Some(removed)
    }
}

/// Index of every plugin and component known to this process. Events are
/// broadcast after the corresponding mutation is visible.
pub struct Registry {
    index: Mutex<RegistryIndex>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock();
        f.debug_struct("Registry")
            .field("plugins", &index.plugins.len())
            .field("components", &index.components.len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose event channel buffers `capacity` events per receiver.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            index: Mutex::new(RegistryIndex::default()),
            events,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        debug!(kind = event.kind(), instance = %event.instance(), "registry event");
        let _ = self.events.send(event);
    }

    pub fn add_plugin(&self, plugin: Plugin) -> Result<Arc<Plugin>> {
        let mut index = self.index.lock();
        let key = plugin.key();
        if index.plugins.contains_key(&key) {
            return Err(RegistryError::DuplicatePlugin {
                instance: plugin.instance,
                plugin: plugin.id,
            });
        }
        let plugin = Arc::new(plugin);
        index.plugins.insert(key, plugin.clone());
        index
            .instances
            .entry(plugin.instance.clone())
            .or_default()
            .plugins
            .insert(plugin.id.clone());
        self.emit(RegistryEvent::PluginAdded(plugin.clone()));
        Ok(plugin)
    }

    /// Remove a plugin. Components still referencing it are left in place.
    pub fn remove_plugin(&self, instance: &str, plugin: &str) -> Result<Arc<Plugin>> {
        let mut index = self.index.lock();
        let removed =
            index
                .take_plugin(instance, plugin)
                .ok_or_else(|| RegistryError::UnknownPlugin {
                    instance: instance.to_owned(),
                    plugin: plugin.to_owned(),
                })?;
        self.emit(RegistryEvent::PluginRemoved(removed.clone()));
        Ok(removed)
    }

    pub fn add_component(&self, component: Arc<dyn Component>) -> Result<()> {
        let mut index = self.index.lock();
        if index.components.contains_key(component.id()) {
            return Err(RegistryError::DuplicateComponent {
                component: component.id().to_owned(),
            });
        }
        index
            .components
            .insert(component.id().to_owned(), component.clone());
        index
            .instances
            .entry(component.instance().to_owned())
            .or_default()
            .components
            .insert(component.id().to_owned());
        self.emit(RegistryEvent::ComponentAdded(component));
        Ok(())
    }

    /// Remove a component from the index. Closing it is up to the caller.
    pub fn remove_component(&self, id: &str) -> Result<Arc<dyn Component>> {
        let mut index = self.index.lock();
        let removed = index
            .take_component(id)
            .ok_or_else(|| RegistryError::UnknownComponent {
                component: id.to_owned(),
            })?;
        self.emit(RegistryEvent::ComponentRemoved(removed.clone()));
        Ok(removed)
    }

    /// Remove every component, then every plugin, owned by `instance`.
    pub fn remove_instance(&self, instance: &str) -> RemovedObjects {
        let mut index = self.index.lock();
        let Some(objects) = index.instances.get(instance) else {
            return RemovedObjects::default();
        };
        let component_ids: Vec<String> = objects.components.iter().cloned().collect();
        let plugin_ids: Vec<String> = objects.plugins.iter().cloned().collect();

        let mut removed = RemovedObjects::default();
        for id in component_ids {
            if let Some(component) = index.take_component(&id) {
                self.emit(RegistryEvent::ComponentRemoved(component.clone()));
                removed.components.push(component);
            }
        }
        for id in plugin_ids {
            if let Some(plugin) = index.take_plugin(instance, &id) {
                self.emit(RegistryEvent::PluginRemoved(plugin.clone()));
                removed.plugins.push(plugin);
            }
        }
        removed
    }

    pub fn find_plugin(&self, instance: &str, plugin: &str) -> Option<Arc<Plugin>> {
        self.index
            .lock()
            .plugins
            .get(&plugin_key(instance, plugin))
            .cloned()
    }

    pub fn get_plugin(&self, instance: &str, plugin: &str) -> Result<Arc<Plugin>> {
        self.find_plugin(instance, plugin)
            .ok_or_else(|| RegistryError::UnknownPlugin {
                instance: instance.to_owned(),
                plugin: plugin.to_owned(),
            })
    }

    pub fn find_component(&self, id: &str) -> Option<Arc<dyn Component>> {
        self.index.lock().components.get(id).cloned()
    }

    pub fn get_component(&self, id: &str) -> Result<Arc<dyn Component>> {
        self.find_component(id)
            .ok_or_else(|| RegistryError::UnknownComponent {
                component: id.to_owned(),
            })
    }

    /// Plugins of `instance`, ordered by id.
    pub fn plugins(&self, instance: &str) -> Vec<Arc<Plugin>> {
        let index = self.index.lock();
        index
            .instances
            .get(instance)
            .map(|objects| {
                objects
                    .plugins
                    .iter()
                    .filter_map(|id| index.plugins.get(&plugin_key(instance, id)).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Components of `instance`, ordered by id.
    pub fn components(&self, instance: &str) -> Vec<Arc<dyn Component>> {
        let index = self.index.lock();
        index
            .instances
            .get(instance)
            .map(|objects| {
                objects
                    .components
                    .iter()
                    .filter_map(|id| index.components.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instances owning at least one plugin or component.
    pub fn get_instance_names(&self) -> Vec<String> {
        self.index.lock().instances.keys().cloned().collect()
    }
}
