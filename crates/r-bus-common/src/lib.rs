//! ---
//! bus_section: "01-core-functionality"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Shared primitives and utilities for the bus runtime."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Shared primitives for the R-Bus workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the client, registry and publisher crates.

pub mod config;
pub mod logging;

pub use config::{BusConfig, ClientConfig, LoadedBusConfig, LoggingConfig, RpcConfig};
pub use logging::{
    filter_directives, init_tracing, log_file_name, LogFormat, DEFAULT_DIRECTIVES, LOG_ENV,
};
