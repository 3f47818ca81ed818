//! ---
//! bus_section: "15-testing-qa-runbook"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Client, presence, metadata, rpc and channel behaviour over the in-memory broker."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use r_bus_common::BusConfig;
use r_bus_msg::{
    BusError, Client, ClientEvent, InMemoryBroker, LocalComponentChannel, MetadataStore, Presence,
    PresenceEvent, RemoteComponentChannel, RemoteView, RpcClient, RpcServer, ViewChange,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn config(name: &str) -> BusConfig {
    let mut config = BusConfig::new(name);
    config.client.resident_state_grace = Duration::from_millis(20);
    config.rpc.call_timeout = Duration::from_millis(500);
    config
}

async fn connected(broker: &InMemoryBroker, name: &str) -> Client {
    let client = Client::new(&config(name), Arc::new(broker.clone()));
    client.connect().await.expect("connect");
    client
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

async fn next<T>(receiver: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, receiver.recv())
        .await
        .expect("value within timeout")
        .expect("channel open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_announces_liveness_and_terminate_clears_namespace() {
    let broker = InMemoryBroker::new();
    let client = connected(&broker, "ctl").await;
    assert!(client.is_online());
    assert_eq!(broker.retained("ctl/online"), Some(Bytes::from_static(&[1])));

    MetadataStore::new(client.clone())
        .set("settings/mode", &json!("auto"))
        .expect("set metadata");
    assert!(broker.retained("ctl/metadata/settings/mode").is_some());

    let mut events = client.events();
    client.terminate().await.expect("terminate");
    assert!(!client.is_online());
    assert_eq!(events.recv().await.expect("event"), ClientEvent::Disconnected);
    assert!(broker.retained_topics("ctl/").is_empty());
    assert!(!broker.is_connected("ctl"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_metadata_is_cleared_when_reconnecting_under_same_name() {
    let broker = InMemoryBroker::new();
    let first = connected(&broker, "ctl").await;
    let mut first_events = first.events();
    MetadataStore::new(first.clone())
        .set("plugins/lights.lamp", &json!({"module": "lights"}))
        .expect("set metadata");

    assert!(broker.sever("ctl"));
    assert_eq!(
        tokio::time::timeout(WAIT, first_events.recv())
            .await
            .expect("event in time")
            .expect("event"),
        ClientEvent::Disconnected
    );
    assert!(broker.retained("ctl/metadata/plugins/lights.lamp").is_some());
    assert!(broker.retained("ctl/online").is_none());

    let second = connected(&broker, "ctl").await;
    assert!(second.is_online());
    assert!(broker.retained("ctl/metadata/plugins/lights.lamp").is_none());
    assert_eq!(broker.retained("ctl/online"), Some(Bytes::from_static(&[1])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn presence_reports_each_transition_once() {
    let broker = InMemoryBroker::new();
    let ui = connected(&broker, "ui").await;
    let presence = Presence::start(&ui).await.expect("presence");
    let mut events = presence.events();

    let ctl = connected(&broker, "ctl").await;
    let online = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        online,
        PresenceEvent {
            instance: "ctl".into(),
            online: true
        }
    );
    assert!(presence.is_online("ctl"));
    assert!(!presence.is_online("ui"));

    ctl.publish("ctl/online", Bytes::from_static(&[1]), true)
        .expect("republish liveness");
    broker.sever("ctl");
    let offline = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        offline,
        PresenceEvent {
            instance: "ctl".into(),
            online: false
        }
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
    assert!(presence.online_instances().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_disconnect_marks_every_instance_offline() {
    let broker = InMemoryBroker::new();
    let _ctl = connected(&broker, "ctl").await;
    let _sensor = connected(&broker, "sensor").await;
    let ui = connected(&broker, "ui").await;
    let presence = Presence::start(&ui).await.expect("presence");
    eventually(|| presence.online_instances() == vec!["ctl".to_owned(), "sensor".to_owned()])
        .await;

    let mut events = presence.events();
    broker.sever("ui");
    let mut offline = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert!(!event.online);
        offline.push(event.instance);
    }
    offline.sort();
    assert_eq!(offline, vec!["ctl", "sensor"]);
    assert!(presence.online_instances().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_local_reconnect_keeps_remote_instances_online() {
    let broker = InMemoryBroker::new();
    let _ctl = connected(&broker, "ctl").await;
    let ui = connected(&broker, "ui").await;
    let presence = Presence::start(&ui).await.expect("presence");
    eventually(|| presence.is_online("ctl")).await;

    let mut events = presence.events();
    assert!(broker.sever("ui"));
    ui.connect().await.expect("reconnect");
    assert!(ui.is_online());

    let mut transitions = Vec::new();
    for _ in 0..2 {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("event in time")
            .expect("event");
        transitions.push((event.instance, event.online));
    }
    assert_eq!(
        transitions,
        vec![("ctl".to_owned(), false), ("ctl".to_owned(), true)]
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(presence.is_online("ctl"));
    assert!(events.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_view_tracks_snapshot_and_changes() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let ui = connected(&broker, "ui").await;
    let store = MetadataStore::new(ctl.clone());
    store
        .set("components/lamp-1", &json!({"id": "lamp-1", "plugin": "lights.lamp"}))
        .expect("set");

    let mut view = RemoteView::open(&ui, "ctl").await.expect("open view");
    assert_eq!(view.paths().collect::<Vec<_>>(), vec!["components/lamp-1"]);
    assert_eq!(view.get_value("components/lamp-1").unwrap()["plugin"], "lights.lamp");
    let typed: std::collections::BTreeMap<String, String> =
        view.get_as("components/lamp-1").expect("typed read");
    assert_eq!(typed["id"], "lamp-1");
    assert!(matches!(
        view.get_value("components/none"),
        Err(BusError::UnknownPath { .. })
    ));

    ctl.publish("ctl/metadata/broken", Bytes::from_static(b"{nope"), true)
        .expect("publish garbage");
    store.set("settings/mode", &json!("manual")).expect("set");
    let change = tokio::time::timeout(WAIT, view.next_change())
        .await
        .expect("change in time");
    assert_eq!(
        change,
        Some(ViewChange::Set {
            path: "settings/mode".into(),
            value: json!("manual")
        })
    );

    store.clear("components/lamp-1").expect("clear");
    let change = tokio::time::timeout(WAIT, view.next_change())
        .await
        .expect("change in time");
    assert_eq!(
        change,
        Some(ViewChange::Clear {
            path: "components/lamp-1".into()
        })
    );
    assert!(view.find_value("components/lamp-1").is_none());

    view.close();
    assert_eq!(view.next_change().await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rpc_round_trip_remote_error_and_timeout() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let ui = connected(&broker, "ui").await;

    let server = RpcServer::new(ctl.clone());
    server
        .register("sum", |input: Value| async move {
            let a = input["a"].as_i64().unwrap_or_default();
            let b = input["b"].as_i64().unwrap_or_default();
            Ok::<_, anyhow::Error>(json!(a + b))
        })
        .await
        .expect("register sum");
    server
        .register("fail", |_input: Value| async move {
            Err::<Value, _>(anyhow::anyhow!("disk unavailable").context("reading recipe"))
        })
        .await
        .expect("register fail");
    assert!(matches!(
        server
            .register("sum", |_: Value| async { Ok::<_, anyhow::Error>(Value::Null) })
            .await,
        Err(BusError::DuplicateService { .. })
    ));

    let caller = RpcClient::new(ui.clone(), &config("ui").rpc);
    let reply_patterns = |client: &Client| {
        client
            .active_patterns()
            .into_iter()
            .filter(|pattern| pattern.starts_with("ui/rpc/replies/"))
            .count()
    };
    let total: i64 = caller
        .call_typed("ctl", "sum", &json!({"a": 2, "b": 40}))
        .await
        .expect("sum");
    assert_eq!(total, 42);
    assert_eq!(reply_patterns(&ui), 0);

    match caller.call("ctl", "fail", Value::Null).await {
        Err(BusError::RpcRemote {
            message,
            stacktrace,
        }) => {
            assert_eq!(message, "reading recipe");
            assert!(stacktrace.contains("disk unavailable"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    assert_eq!(reply_patterns(&ui), 0);

    match caller
        .call_with_timeout("ctl", "missing", Value::Null, Duration::from_millis(50))
        .await
    {
        Err(BusError::RpcTimeout { address, topic, .. }) => {
            assert_eq!(address, "missing");
            assert_eq!(topic, "ctl/rpc/services/missing");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(reply_patterns(&ui), 0);

    server.unregister("fail").expect("unregister");
    assert!(matches!(
        server.unregister("fail"),
        Err(BusError::UnknownService { .. })
    ));
    assert_eq!(server.addresses(), vec!["sum"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn component_channels_carry_actions_and_state() {
    let broker = InMemoryBroker::new();
    let ctl = connected(&broker, "ctl").await;
    let ui = connected(&broker, "ui").await;

    let local = LocalComponentChannel::new(ctl.clone(), "lamp-1");
    let (action_tx, mut actions) = mpsc::unbounded_channel();
    local
        .register_action("toggle", move |payload| {
            let _ = action_tx.send(payload);
        })
        .await
        .expect("register action");
    match local.register_action("toggle", |_| {}).await {
        Err(BusError::DuplicateMember { member, component }) => {
            assert_eq!(member, "toggle");
            assert_eq!(component, "lamp-1");
        }
        other => panic!("expected duplicate member, got {other:?}"),
    }

    let remote = RemoteComponentChannel::new(ui.clone(), "ctl", "lamp-1");
    let (state_tx, mut states) = mpsc::unbounded_channel();
    remote
        .register_state_change("on", move |payload| {
            let _ = state_tx.send(payload);
        })
        .await
        .expect("register state");

    remote
        .emit_action("toggle", Bytes::from_static(&[1]))
        .expect("emit action");
    assert_eq!(next(&mut actions).await, Bytes::from_static(&[1]));

    local
        .set_state("on", Bytes::from_static(&[0]))
        .expect("set state");
    assert_eq!(next(&mut states).await, Bytes::from_static(&[0]));
    assert!(broker.retained("ctl/localComponents/lamp-1/on").is_none());

    local.close();
    local
        .register_action("toggle", |_| {})
        .await
        .expect("member free again after close");
}
