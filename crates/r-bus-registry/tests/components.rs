//! ---
//! bus_section: "15-testing-qa-runbook"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Remote proxies and hosted components exchanging actions and state."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use r_bus_common::BusConfig;
use r_bus_msg::{Client, InMemoryBroker};
use r_bus_registry::{
    Component, HostedComponent, Plugin, Registry, RegistryError, RemoteComponent,
};
use r_bus_types::{ComponentDescriptor, DeviceValue, PluginDescriptor, ValueType};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

async fn connected(broker: &InMemoryBroker, name: &str) -> Client {
    let mut config = BusConfig::new(name);
    config.client.resident_state_grace = Duration::from_millis(20);
    let client = Client::new(&config, Arc::new(broker.clone()));
    client.connect().await.expect("connect");
    client
}

fn thermostat() -> PluginDescriptor {
    PluginDescriptor::new("climate", "thermostat", "2.1.0")
        .with_action("setpoint", ValueType::range(5, 30).unwrap())
        .with_state("temperature", ValueType::Float)
        .with_state("mode", ValueType::enumeration(["heat", "off"]).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_requires_registered_plugin() {
    let broker = InMemoryBroker::new();
    let ui = connected(&broker, "ui").await;
    let registry = Registry::new();

    let result = RemoteComponent::attach(
        &ui,
        &registry,
        "ctl",
        &ComponentDescriptor::new("thermo-1", "climate.thermostat"),
    )
    .await;
    assert!(matches!(result, Err(RegistryError::UnknownPlugin { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_and_hosted_component_exchange_values() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let ui = connected(&broker, "ui").await;

    let hosted_plugin = Arc::new(Plugin::new("ctl", thermostat()));
    let hosted = HostedComponent::new(&ctl, hosted_plugin, "thermo-1");
    let (action_tx, mut actions) = mpsc::unbounded_channel();
    hosted
        .on_action("setpoint", move |value| {
            let _ = action_tx.send(value);
        })
        .await
        .expect("register setpoint");
    assert!(matches!(
        hosted.on_action("mode", |_| {}).await,
        Err(RegistryError::NotAnAction { .. })
    ));

    let registry = Registry::new();
    registry
        .add_plugin(Plugin::new("ctl", thermostat()))
        .expect("mirror plugin");
    let proxy = RemoteComponent::attach(&ui, &registry, "ctl", &hosted.descriptor())
        .await
        .expect("attach proxy");
    let mut changes = proxy.state_changes();

    proxy
        .execute_action("setpoint", DeviceValue::Integer(21))
        .expect("send setpoint");
    let received = tokio::time::timeout(WAIT, actions.recv())
        .await
        .expect("action in time")
        .expect("action");
    assert_eq!(received, DeviceValue::Integer(21));

    assert!(matches!(
        proxy.execute_action("setpoint", DeviceValue::Integer(40)),
        Err(RegistryError::TypeValidation(_))
    ));
    assert!(matches!(
        proxy.execute_action("temperature", DeviceValue::Float(1.0)),
        Err(RegistryError::NotAnAction { .. })
    ));

    hosted
        .set_state("mode", DeviceValue::Text("heat".into()))
        .expect("publish mode");
    let change = tokio::time::timeout(WAIT, changes.recv())
        .await
        .expect("change in time")
        .expect("change");
    assert_eq!(change.component, "thermo-1");
    assert_eq!(change.member, "mode");
    assert_eq!(change.value, DeviceValue::Text("heat".into()));
    assert_eq!(proxy.state("mode"), Some(DeviceValue::Text("heat".into())));
    assert_eq!(hosted.state("mode"), Some(DeviceValue::Text("heat".into())));

    assert!(matches!(
        hosted.set_state("setpoint", DeviceValue::Integer(20)),
        Err(RegistryError::NotAState { .. })
    ));
    assert!(matches!(
        hosted.set_state("mode", DeviceValue::Text("cool".into())),
        Err(RegistryError::TypeValidation(_))
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(actions.try_recv().is_err());
}
