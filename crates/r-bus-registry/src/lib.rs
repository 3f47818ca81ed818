//! ---
//! bus_section: "03-registry"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Plugin and component registry with remote proxies."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Process-wide index of plugins and components, local and remote.

pub mod component;
pub mod registry;

use r_bus_msg::BusError;
use r_bus_types::{CodecError, TypeValidationError, ValueError};

pub use component::{encode_action, Component, HostedComponent, RemoteComponent, StateChange};
pub use registry::{Plugin, Registry, RegistryEvent, RemovedObjects};

/// Shared result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("plugin '{plugin}' already registered for instance '{instance}'")]
    DuplicatePlugin { instance: String, plugin: String },
    #[error("component '{component}' already registered")]
    DuplicateComponent { component: String },
    #[error("plugin '{plugin}' is not registered for instance '{instance}'")]
    UnknownPlugin { instance: String, plugin: String },
    #[error("component '{component}' is not registered")]
    UnknownComponent { component: String },
    #[error("component '{component}' has no member '{member}'")]
    UnknownMember { component: String, member: String },
    #[error("member '{member}' of component '{component}' is not an action")]
    NotAnAction { component: String, member: String },
    #[error("member '{member}' of component '{component}' is not a state")]
    NotAState { component: String, member: String },
    #[error(transparent)]
    TypeValidation(#[from] TypeValidationError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<ValueError> for RegistryError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::Validation(err) => RegistryError::TypeValidation(err),
            ValueError::Codec(err) => RegistryError::Codec(err),
        }
    }
}
