//! ---
//! bus_section: "15-testing-qa-runbook"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Configuration loading and tracing bootstrap tests."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use std::time::Duration;

use r_bus_common::{init_tracing, log_file_name, BusConfig, LogFormat};

#[test]
fn load_with_source_picks_first_existing_candidate() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("missing.toml");
    let present = dir.path().join("bus.toml");
    std::fs::write(
        &present,
        "instance_name = \"hub\"\n[rpc]\ncall_timeout = 750\n",
    )
    .expect("write config");

    let loaded = BusConfig::load_with_source(&[missing, present.clone()]).expect("load config");
    assert_eq!(loaded.source, present);
    assert_eq!(loaded.config.instance_name, "hub");
    assert_eq!(loaded.config.rpc.call_timeout, Duration::from_millis(750));
}

#[test]
fn load_reports_inspected_candidates() {
    let dir = tempfile::tempdir().expect("temp dir");
    let missing = dir.path().join("nope.toml");
    let err = BusConfig::load(&[missing]).unwrap_err();
    assert!(err.to_string().contains("nope.toml"));
}

#[test]
fn invalid_file_is_rejected_with_context() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "instance_name = \"a#b\"\n").expect("write config");
    assert!(BusConfig::load(&[path]).is_err());
}

#[test]
fn log_file_is_named_after_the_instance() {
    let mut config = BusConfig::new("hub");
    assert_eq!(log_file_name(&config), "hub.log");
    config.logging.file_prefix = Some("r-bus".into());
    assert_eq!(log_file_name(&config), "r-bus-hub.log");
}

#[test]
fn init_tracing_writes_instance_log_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = BusConfig::new("hub");
    config.logging.directory = dir.path().join("logs");
    config.logging.format = LogFormat::Pretty;
    config.logging.file_prefix = Some("bus".into());

    let guard = init_tracing(&config).expect("init tracing");
    tracing::info!(target: "r_bus_common", "instance started");
    drop(guard);

    let names: Vec<String> = std::fs::read_dir(&config.logging.directory)
        .expect("log directory")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        names.iter().any(|name| name.starts_with("bus-hub.log")),
        "unexpected log files: {names:?}"
    );
}
