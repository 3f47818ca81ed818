//! ---
//! bus_section: "02-messaging-ipc-data-model"
//! bus_subsection: "module"
//! bus_type: "source"
//! bus_scope: "code"
//! bus_description: "Typed device values and binary payload codecs."
//! bus_version: "v0.0.0-prealpha"
//! bus_owner: "tbd"
//! ---
//! Plugin and component descriptors as published under `metadata/`.
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::{DeviceValue, ValueType};

/// Direction of a plugin member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    /// Invoked by consumers, handled by the hosting component.
    Action,
    /// Published by the hosting component.
    State,
}

/// Typed action or state slot of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Action or state.
    pub member_type: MemberType,
    /// Declared value type.
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Member {
    /// Action member of the given type.
    pub fn action(value_type: ValueType) -> Self {
        Self {
            member_type: MemberType::Action,
            value_type,
            description: None,
        }
    }

    /// State member of the given type.
    pub fn state(value_type: ValueType) -> Self {
        Self {
            member_type: MemberType::State,
            value_type,
            description: None,
        }
    }

    /// Attach a description.
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether the member is an action.
    pub fn is_action(&self) -> bool {
        self.member_type == MemberType::Action
    }
}

/// Functional role of a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginUsage {
    /// Reads the physical world.
    Sensor,
    /// Drives the physical world.
    Actuator,
    /// Pure logic.
    #[default]
    Logic,
    /// User interface element.
    Ui,
}

/// Declarative configuration field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigField {
    /// Declared type.
    #[serde(rename = "type")]
    pub value_type: ValueType,
    /// Value used when none is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<DeviceValue>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ConfigField {
    /// Field without default or description.
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            default: None,
            description: None,
        }
    }

    /// Attach a default value.
    pub fn with_default(mut self, default: impl Into<DeviceValue>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Schema of a device type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Owning module.
    pub module: String,
    /// Plugin name within the module.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Functional role.
    #[serde(default)]
    pub usage: PluginUsage,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Members in declaration order.
    #[serde(default)]
    pub members: IndexMap<String, Member>,
    /// Configuration schema in declaration order.
    #[serde(default)]
    pub config: IndexMap<String, ConfigField>,
}

impl PluginDescriptor {
    /// Empty descriptor for `module.name`.
    pub fn new(
        module: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            version: version.into(),
            usage: PluginUsage::default(),
            description: None,
            members: IndexMap::new(),
            config: IndexMap::new(),
        }
    }

    /// Set the usage tag.
    pub fn with_usage(mut self, usage: PluginUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare an action member.
    pub fn with_action(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.members.insert(name.into(), Member::action(value_type));
        self
    }

    /// Declare a state member.
    pub fn with_state(mut self, name: impl Into<String>, value_type: ValueType) -> Self {
        self.members.insert(name.into(), Member::state(value_type));
        self
    }

    /// Declare a configuration field.
    pub fn with_config(mut self, name: impl Into<String>, field: ConfigField) -> Self {
        self.config.insert(name.into(), field);
        self
    }

    /// Bus-wide plugin id `module.name`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    /// Member by name.
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.get(name)
    }

    /// State members in declaration order.
    pub fn state_members(&self) -> impl Iterator<Item = (&str, &Member)> {
        self.members
            .iter()
            .filter(|(_, member)| member.member_type == MemberType::State)
            .map(|(name, member)| (name.as_str(), member))
    }

    /// Action members in declaration order.
    pub fn action_members(&self) -> impl Iterator<Item = (&str, &Member)> {
        self.members
            .iter()
            .filter(|(_, member)| member.member_type == MemberType::Action)
            .map(|(name, member)| (name.as_str(), member))
    }
}

/// Published description of a component instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Bus-wide component id.
    pub id: String,
    /// Plugin id `module.name`.
    pub plugin: String,
}

impl ComponentDescriptor {
    /// Descriptor for `id` built from `plugin`.
    pub fn new(id: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin: plugin.into(),
        }
    }
}

const PLUGINS: &str = "plugins/";
const COMPONENTS: &str = "components/";

/// Metadata path of a plugin descriptor.
pub fn plugin_path(plugin_id: &str) -> String {
    format!("{PLUGINS}{plugin_id}")
}

/// Metadata path of a component descriptor.
pub fn component_path(component_id: &str) -> String {
    format!("{COMPONENTS}{component_id}")
}

/// Classification of a metadata path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataPath<'a> {
    /// `plugins/<id>`.
    Plugin(&'a str),
    /// `components/<id>`.
    Component(&'a str),
    /// Anything else.
    Other,
}

impl<'a> MetadataPath<'a> {
    /// Classify a path relative to `<instance>/metadata/`.
    pub fn classify(path: &'a str) -> Self {
        if let Some(id) = path.strip_prefix(PLUGINS).filter(|id| valid_id(id)) {
            MetadataPath::Plugin(id)
        } else if let Some(id) = path.strip_prefix(COMPONENTS).filter(|id| valid_id(id)) {
            MetadataPath::Component(id)
        } else {
            MetadataPath::Other
        }
    }

    /// Whether the path names a plugin descriptor.
    pub fn is_plugin(&self) -> bool {
        matches!(self, MetadataPath::Plugin(_))
    }
}

fn valid_id(id: &str) -> bool {
    !id.is_empty() && !id.contains('/')
}
