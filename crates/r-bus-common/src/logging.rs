//! ---
//! bus_section: "01-core-functionality"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Tracing bootstrap for a bus instance."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::BusConfig;

/// Filter override, checked before `RUST_LOG`.
pub const LOG_ENV: &str = "R_BUS_LOG";

/// Bus crates log at `info`; everything else only surfaces warnings.
pub const DEFAULT_DIRECTIVES: &str =
    "warn,r_bus_common=info,r_bus_msg=info,r_bus_registry=info,r_bus_core=info";

/// Stdout log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Base name of the rolling log file: `<file_prefix>-<instance>.log`, or
/// `<instance>.log` without a prefix. The appender adds the date suffix.
pub fn log_file_name(config: &BusConfig) -> String {
    match &config.logging.file_prefix {
        Some(prefix) => format!("{prefix}-{}.log", config.instance_name),
        None => format!("{}.log", config.instance_name),
    }
}

/// Filter directives in effect: `R_BUS_LOG`, then `RUST_LOG`, then
/// [`DEFAULT_DIRECTIVES`].
pub fn filter_directives() -> String {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_else(|_| DEFAULT_DIRECTIVES.to_owned())
}

/// Install the global subscriber for `config.instance_name`.
///
/// Stdout gets the configured format; the file under `logging.directory`
/// always receives JSON and rolls daily. Keep the returned guard alive for
/// the lifetime of the instance, dropping it flushes pending file writes.
/// A subscriber installed earlier in the process stays in place.
pub fn init_tracing(config: &BusConfig) -> Result<WorkerGuard> {
    let logging = &config.logging;
    std::fs::create_dir_all(&logging.directory).with_context(|| {
        format!("creating log directory {}", logging.directory.display())
    })?;

    let directives = filter_directives();
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter `{directives}`"))?;

    let file_name = log_file_name(config);
    let appender = tracing_appender::rolling::daily(&logging.directory, &file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let stdout = match logging.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .with_current_span(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stdout)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .compact()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stdout)
            .boxed(),
    };
    let file = fmt::layer()
        .json()
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(file_writer)
        .boxed();

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .try_init()
        .is_ok();

    info!(
        instance = %config.instance_name,
        log_file = %logging.directory.join(&file_name).display(),
        format = ?logging.format,
        directives = %directives,
        installed,
        "tracing initialised"
    );
    Ok(guard)
}
