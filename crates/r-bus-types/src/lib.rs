//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Typed device values and binary payload codecs."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Value kinds, codecs and descriptor schemas shared by every bus layer.

pub mod codec;
pub mod descriptor;
pub mod value;

pub use codec::{decode_json, encode_json, CodecError, Primitive};
pub use descriptor::{
    component_path, plugin_path, ComponentDescriptor, ConfigField, Member, MemberType,
    MetadataPath, PluginDescriptor, PluginUsage,
};
pub use value::{DeviceValue, RangeType, TypeError, TypeValidationError, ValueType};

/// Failure while turning a device value into a wire payload.
#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    /// The value does not satisfy the declared type.
    #[error(transparent)]
    Validation(#[from] TypeValidationError),
    /// The primitive codec rejected the value.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
