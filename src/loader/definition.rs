//! Scenario file types
//!
//! Defines the data structures for deserializing YAML scenario files.

use serde::Deserialize;

use crate::action::{ActionKind, MetaOverride};

/// One scenario file: shared templates plus the scenarios that use them
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ScenarioFile {
    /// Named action definitions other actions can derive from
    #[serde(default)]
    pub templates: Vec<ActionEntry>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioEntry>,
}

/// A scenario as written in a file
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScenarioEntry {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
}

/// An action (or template) as written in a file
///
/// The header fields are common to every type; everything else is kept as
/// raw YAML and parsed once the type is known.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ActionEntry {
    pub name: String,
    /// Optional when a template supplies it
    #[serde(rename = "type")]
    pub kind: Option<ActionKind>,
    /// Name of the template this action derives from
    pub template: Option<String>,
    pub description: Option<String>,
    pub invoke_even_on_fail: Option<bool>,
    pub allow_failure: Option<bool>,
    #[serde(flatten)]
    pub fields: serde_yaml::Mapping,
}

impl ActionEntry {
    /// Split into the shared header and the protocol fields
    pub fn into_parts(self) -> (MetaOverride, serde_yaml::Value) {
        let meta = MetaOverride {
            name: self.name,
            description: self.description,
            invoke_even_on_fail: self.invoke_even_on_fail,
            allow_failure: self.allow_failure,
        };
        (meta, serde_yaml::Value::Mapping(self.fields))
    }
}
