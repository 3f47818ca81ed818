//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Bus client and protocol layers over a retained pub/sub transport."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Topic grammar: `<instanceName>/<domain>/<...args>`.

/// Liveness domain.
pub const ONLINE: &str = "online";
/// Component member channel domain.
pub const LOCAL_COMPONENTS: &str = "localComponents";
/// Retained metadata domain.
pub const METADATA: &str = "metadata";
/// Pattern matching the liveness topic of every instance.
pub const LIVENESS_PATTERN: &str = "+/online";

/// Join an instance, a domain and arguments into a topic.
pub fn build(instance: &str, domain: &str, args: &[&str]) -> String {
    let mut topic = format!("{instance}/{domain}");
    for arg in args {
        topic.push('/');
        topic.push_str(arg);
    }
    topic
}

/// `<instance>/online`.
pub fn liveness(instance: &str) -> String {
    build(instance, ONLINE, &[])
}

/// Instance owning a liveness topic, if `topic` is one.
pub fn liveness_owner(topic: &str) -> Option<&str> {
    match topic.split_once('/') {
        Some((instance, ONLINE)) if !instance.is_empty() => Some(instance),
        _ => None,
    }
}

/// `<instance>/#`.
pub fn namespace_pattern(instance: &str) -> String {
    format!("{instance}/#")
}

/// `<instance>/metadata/<path>`.
pub fn metadata(instance: &str, path: &str) -> String {
    build(instance, METADATA, &[path])
}

/// `<instance>/metadata/#`.
pub fn metadata_pattern(instance: &str) -> String {
    build(instance, METADATA, &["#"])
}

/// Metadata path of a topic under `<instance>/metadata/`.
pub fn metadata_path<'a>(instance: &str, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(instance)?
        .strip_prefix('/')?
        .strip_prefix(METADATA)?
        .strip_prefix('/')
        .filter(|path| !path.is_empty())
}

/// `<instance>/localComponents/<component>/<member>`.
pub fn component_member(instance: &str, component: &str, member: &str) -> String {
    build(instance, LOCAL_COMPONENTS, &[component, member])
}

/// `<instance>/rpc/services/<address>`.
pub fn rpc_service(instance: &str, address: &str) -> String {
    build(instance, "rpc", &["services", address])
}

/// `<instance>/rpc/replies/<id>`.
pub fn rpc_reply(instance: &str, reply_id: &str) -> String {
    build(instance, "rpc", &["replies", reply_id])
}

/// MQTT-style match: `+` is one level, a trailing `#` is any remainder
/// including none.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for filter in pattern.split('/') {
        if filter == "#" {
            return true;
        }
        match levels.next() {
            Some(level) if filter == "+" || filter == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}
