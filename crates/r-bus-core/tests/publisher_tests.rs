//! ---
//! bus_section: "01-core-functionality"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Registry reconstruction from remote metadata and local publication."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_bus_common::BusConfig;
use r_bus_core::BusPublisher;
use r_bus_msg::{Client, InMemoryBroker, MetadataStore, Presence};
use r_bus_registry::{Component, Registry, RegistryEvent};
use r_bus_types::{component_path, plugin_path, ComponentDescriptor, PluginDescriptor, ValueType};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);

async fn connected(broker: &InMemoryBroker, name: &str) -> Client {
    let mut config = BusConfig::new(name);
    config.client.resident_state_grace = Duration::from_millis(20);
    let client = Client::new(&config, Arc::new(broker.clone()));
    client.connect().await.expect("connect");
    client
}

fn lamp() -> PluginDescriptor {
    PluginDescriptor::new("lights", "lamp", "1.0.0")
        .with_action("toggle", ValueType::Boolean)
        .with_state("on", ValueType::Boolean)
}

fn lamp_component(id: &str) -> ComponentDescriptor {
    ComponentDescriptor::new(id, "lights.lamp")
}

async fn eventually<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn label(event: &RegistryEvent) -> String {
    let id = match event {
        RegistryEvent::PluginAdded(plugin) | RegistryEvent::PluginRemoved(plugin) => {
            plugin.id().to_owned()
        }
        RegistryEvent::ComponentAdded(component) | RegistryEvent::ComponentRemoved(component) => {
            component.id().to_owned()
        }
    };
    format!("{}:{id}", event.kind())
}

async fn next_labels(events: &mut broadcast::Receiver<RegistryEvent>, count: usize) -> Vec<String> {
    let mut labels = Vec::with_capacity(count);
    for _ in 0..count {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("registry event in time")
            .expect("registry event");
        labels.push(label(&event));
    }
    labels
}

struct Observer {
    client: Client,
    presence: Arc<Presence>,
    registry: Arc<Registry>,
}

async fn observer(broker: &InMemoryBroker) -> Observer {
    let client = connected(broker, "ui").await;
    let presence = Arc::new(Presence::start(&client).await.expect("presence"));
    Observer {
        client,
        presence,
        registry: Arc::new(Registry::new()),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_builds_plugins_before_components() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let store = MetadataStore::new(ctl.clone());
    store
        .set(&component_path("lamp-1"), &lamp_component("lamp-1"))
        .expect("component metadata");
    store
        .set(&plugin_path("lights.lamp"), &lamp())
        .expect("plugin metadata");
    store.set("settings/theme", &"dark").expect("other metadata");

    let ui = observer(&broker).await;
    eventually(|| ui.presence.is_online("ctl")).await;
    let mut events = ui.registry.events();
    let handle = BusPublisher::new(ui.client.clone(), ui.registry.clone()).start(ui.presence.clone());

    assert_eq!(
        next_labels(&mut events, 2).await,
        vec!["plugin_added:lights.lamp", "component_added:lamp-1"]
    );
    assert_eq!(handle.mirrored_instances(), vec!["ctl"]);
    let component = ui.registry.get_component("lamp-1").expect("proxy registered");
    assert_eq!(component.instance(), "ctl");
    assert_eq!(component.plugin().descriptor().version, "1.0.0");

    handle.shutdown().await;
    assert!(ui.registry.get_instance_names().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn component_published_before_plugin_waits_for_it() {
    let broker = InMemoryBroker::new();
    let ui = observer(&broker).await;
    let mut events = ui.registry.events();
    let _handle =
        BusPublisher::new(ui.client.clone(), ui.registry.clone()).start(ui.presence.clone());

    let ctl = connected(&broker, "ctl").await;
    let store = MetadataStore::new(ctl.clone());
    eventually(|| ui.presence.is_online("ctl")).await;
    store
        .set(&component_path("lamp-2"), &lamp_component("lamp-2"))
        .expect("component metadata");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ui.registry.find_component("lamp-2").is_none());

    store
        .set(&plugin_path("lights.lamp"), &lamp())
        .expect("plugin metadata");
    assert_eq!(
        next_labels(&mut events, 2).await,
        vec!["plugin_added:lights.lamp", "component_added:lamp-2"]
    );

    store.clear(&component_path("lamp-2")).expect("clear component");
    assert_eq!(
        next_labels(&mut events, 1).await,
        vec!["component_removed:lamp-2"]
    );
    assert_eq!(ui.registry.plugins("ctl").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleared_plugin_detaches_and_restores_its_components() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let store = MetadataStore::new(ctl.clone());
    store
        .set(&plugin_path("lights.lamp"), &lamp())
        .expect("plugin metadata");
    store
        .set(&component_path("lamp-1"), &lamp_component("lamp-1"))
        .expect("component metadata");

    let ui = observer(&broker).await;
    let mut events = ui.registry.events();
    let _handle =
        BusPublisher::new(ui.client.clone(), ui.registry.clone()).start(ui.presence.clone());
    next_labels(&mut events, 2).await;

    store.clear(&plugin_path("lights.lamp")).expect("clear plugin");
    assert_eq!(
        next_labels(&mut events, 2).await,
        vec!["component_removed:lamp-1", "plugin_removed:lights.lamp"]
    );

    store
        .set(&plugin_path("lights.lamp"), &lamp())
        .expect("plugin metadata");
    assert_eq!(
        next_labels(&mut events, 2).await,
        vec!["plugin_added:lights.lamp", "component_added:lamp-1"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_tears_down_and_reconnect_rebuilds() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let store = MetadataStore::new(ctl.clone());
    store
        .set(&plugin_path("lights.lamp"), &lamp())
        .expect("plugin metadata");
    store
        .set(&component_path("lamp-1"), &lamp_component("lamp-1"))
        .expect("component metadata");

    let ui = observer(&broker).await;
    let mut events = ui.registry.events();
    let handle = BusPublisher::new(ui.client.clone(), ui.registry.clone()).start(ui.presence.clone());
    next_labels(&mut events, 2).await;

    assert!(broker.sever("ctl"));
    assert_eq!(
        next_labels(&mut events, 2).await,
        vec!["component_removed:lamp-1", "plugin_removed:lights.lamp"]
    );
    eventually(|| handle.mirrored_instances().is_empty()).await;
    assert!(ui.registry.get_instance_names().is_empty());

    let ctl = connected(&broker, "ctl").await;
    let store = MetadataStore::new(ctl.clone());
    store
        .set(&plugin_path("lights.lamp"), &lamp())
        .expect("plugin metadata");
    store
        .set(&component_path("lamp-7"), &lamp_component("lamp-7"))
        .expect("component metadata");
    assert_eq!(
        next_labels(&mut events, 2).await,
        vec!["plugin_added:lights.lamp", "component_added:lamp-7"]
    );
    assert!(ui.registry.find_component("lamp-1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_remote_metadata_is_skipped() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let store = MetadataStore::new(ctl.clone());
    store
        .set(&plugin_path("lights.lamp"), &serde_json::json!({"module": 5}))
        .expect("broken plugin");
    store
        .set(&plugin_path("lights.other"), &lamp())
        .expect("mismatched plugin id");

    let ui = observer(&broker).await;
    let mut events = ui.registry.events();
    let _handle =
        BusPublisher::new(ui.client.clone(), ui.registry.clone()).start(ui.presence.clone());
    eventually(|| ui.presence.is_online("ctl")).await;

    store
        .set(&plugin_path("lights.lamp"), &lamp())
        .expect("plugin metadata");
    assert_eq!(
        next_labels(&mut events, 1).await,
        vec!["plugin_added:lights.lamp"]
    );
    assert!(ui.registry.find_plugin("ctl", "lights.other").is_none());
}
