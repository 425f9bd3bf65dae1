//! Actions: one tagged variant per protocol
//!
//! An [`Action`] is an immutable definition built once at load time, either
//! directly or by merging overrides into a template. Invoking it produces an
//! [`Invocation`] that owns all execution state.

mod filter;
mod invocation;
mod mqtt;
mod mqtt_publish;
mod mqtt_subscribe;
mod rest;
mod template;
mod websocket;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

pub use filter::MessageFilter;
pub use invocation::{ActionOutcome, CancelHandle, Invocation, InvocationContext, Services};
pub use mqtt::BrokerOptions;
pub use mqtt_publish::{MqttPublishAction, MqttPublishDefinition};
pub use mqtt_subscribe::{MessageCodec, MqttSubscribeAction, MqttSubscribeDefinition, ProtoEncoding};
pub use rest::{RestAction, RestDefinition};
pub use template::MetaOverride;
pub use websocket::{WebSocketAction, WebSocketDefinition};

/// Action type tag as written in scenario files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Rest,
    MqttSubscribe,
    MqttPublish,
    #[serde(rename = "WEBSOCKET")]
    WebSocket,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ActionKind::Rest => "REST",
            ActionKind::MqttSubscribe => "MQTT_SUBSCRIBE",
            ActionKind::MqttPublish => "MQTT_PUBLISH",
            ActionKind::WebSocket => "WEBSOCKET",
        };
        f.write_str(tag)
    }
}

/// Fields shared by every variant
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMeta {
    pub name: String,
    pub description: String,
    /// Parsed and carried; the runner always fails fast
    pub invoke_even_on_fail: bool,
    /// Parsed and carried; the runner always fails fast
    pub allow_failure: bool,
}

/// Protocol-specific part of a definition, before it becomes an [`Action`]
#[derive(Debug, Clone)]
pub enum ActionDefinition {
    Rest(RestDefinition),
    MqttSubscribe(MqttSubscribeDefinition),
    MqttPublish(MqttPublishDefinition),
    WebSocket(WebSocketDefinition),
}

impl ActionDefinition {
    /// Parse the protocol fields of `kind` from a YAML mapping
    pub fn parse(kind: ActionKind, fields: serde_yaml::Value) -> Result<Self> {
        Ok(match kind {
            ActionKind::Rest => Self::Rest(serde_yaml::from_value(fields)?),
            ActionKind::MqttSubscribe => Self::MqttSubscribe(serde_yaml::from_value(fields)?),
            ActionKind::MqttPublish => Self::MqttPublish(serde_yaml::from_value(fields)?),
            ActionKind::WebSocket => Self::WebSocket(serde_yaml::from_value(fields)?),
        })
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Rest(_) => ActionKind::Rest,
            Self::MqttSubscribe(_) => ActionKind::MqttSubscribe,
            Self::MqttPublish(_) => ActionKind::MqttPublish,
            Self::WebSocket(_) => ActionKind::WebSocket,
        }
    }
}

/// A single protocol operation
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Rest(RestAction),
    MqttSubscribe(MqttSubscribeAction),
    MqttPublish(MqttPublishAction),
    WebSocket(WebSocketAction),
}

impl Action {
    /// Build a standalone action
    pub fn from_definition(meta: MetaOverride, def: ActionDefinition) -> Result<Self> {
        Ok(match def {
            ActionDefinition::Rest(d) => Self::Rest(RestAction::from_definition(meta, d)?),
            ActionDefinition::MqttSubscribe(d) => {
                Self::MqttSubscribe(MqttSubscribeAction::from_definition(meta, d)?)
            }
            ActionDefinition::MqttPublish(d) => {
                Self::MqttPublish(MqttPublishAction::from_definition(meta, d)?)
            }
            ActionDefinition::WebSocket(d) => {
                Self::WebSocket(WebSocketAction::from_definition(meta, d)?)
            }
        })
    }

    /// Derive an action from `template`; the template is left untouched
    pub fn from_template(meta: MetaOverride, def: ActionDefinition, template: &Action) -> Result<Self> {
        Ok(match (def, template) {
            (ActionDefinition::Rest(d), Action::Rest(t)) => {
                Self::Rest(RestAction::from_template(meta, d, t))
            }
            (ActionDefinition::MqttSubscribe(d), Action::MqttSubscribe(t)) => {
                Self::MqttSubscribe(MqttSubscribeAction::from_template(meta, d, t))
            }
            (ActionDefinition::MqttPublish(d), Action::MqttPublish(t)) => {
                Self::MqttPublish(MqttPublishAction::from_template(meta, d, t))
            }
            (ActionDefinition::WebSocket(d), Action::WebSocket(t)) => {
                Self::WebSocket(WebSocketAction::from_template(meta, d, t))
            }
            (def, template) => {
                return Err(Error::Config(format!(
                    "Action '{}' is {} but template '{}' is {}",
                    meta.name,
                    def.kind(),
                    template.name(),
                    template.kind()
                )))
            }
        })
    }

    pub fn meta(&self) -> &ActionMeta {
        match self {
            Action::Rest(a) => &a.meta,
            Action::MqttSubscribe(a) => &a.meta,
            Action::MqttPublish(a) => &a.meta,
            Action::WebSocket(a) => &a.meta,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn description(&self) -> &str {
        &self.meta().description
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Rest(_) => ActionKind::Rest,
            Action::MqttSubscribe(_) => ActionKind::MqttSubscribe,
            Action::MqttPublish(_) => ActionKind::MqttPublish,
            Action::WebSocket(_) => ActionKind::WebSocket,
        }
    }

    /// One-line human readable summary of what the action does
    pub fn describe(&self) -> String {
        match self {
            Action::Rest(a) => a.describe(),
            Action::MqttSubscribe(a) => a.describe(),
            Action::MqttPublish(a) => a.describe(),
            Action::WebSocket(a) => a.describe(),
        }
    }

    /// Whether the runner cancels this action's invocation at scenario end
    pub fn is_background(&self) -> bool {
        matches!(self, Action::WebSocket(_))
    }

    /// Bare expressions (predicates, filters, variable sources) for
    /// syntax checking without running anything
    pub fn expressions(&self) -> Vec<&str> {
        match self {
            Action::Rest(a) => a.expressions().collect(),
            Action::MqttSubscribe(a) => a.filter.predicates().iter().map(String::as_str).collect(),
            Action::MqttPublish(_) => Vec::new(),
            Action::WebSocket(a) => a.filter.predicates().iter().map(String::as_str).collect(),
        }
    }

    /// Resolve parameters against the scenario cache and start the action
    pub fn invoke(&self, ctx: &InvocationContext<'_>) -> Invocation {
        match self {
            Action::Rest(a) => a.invoke(ctx),
            Action::MqttSubscribe(a) => a.invoke(ctx),
            Action::MqttPublish(a) => a.invoke(ctx),
            Action::WebSocket(a) => a.invoke(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> MetaOverride {
        MetaOverride {
            name: name.into(),
            ..Default::default()
        }
    }

    fn yaml(text: &str) -> serde_yaml::Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_kind_tags() {
        let kind: ActionKind = serde_yaml::from_str("MQTT_SUBSCRIBE").unwrap();
        assert_eq!(kind, ActionKind::MqttSubscribe);
        let kind: ActionKind = serde_yaml::from_str("WEBSOCKET").unwrap();
        assert_eq!(kind, ActionKind::WebSocket);
        assert_eq!(ActionKind::MqttPublish.to_string(), "MQTT_PUBLISH");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ActionDefinition::parse(ActionKind::Rest, yaml("url: http://x\nheadrs: {}"));
        assert!(err.is_err());
    }

    #[test]
    fn test_template_kind_mismatch() {
        let template = Action::from_definition(
            meta("base"),
            ActionDefinition::parse(ActionKind::Rest, yaml("url: http://x")).unwrap(),
        )
        .unwrap();
        let def = ActionDefinition::parse(
            ActionKind::WebSocket,
            yaml("url: ws://x\nexpectedNumberOfMessages: 1"),
        )
        .unwrap();
        let err = Action::from_template(meta("ws"), def, &template).unwrap_err();
        assert_eq!(err.kind(), "CONFIG");
    }

    #[test]
    fn test_expressions_listed() {
        let action = Action::from_definition(
            meta("get"),
            ActionDefinition::parse(
                ActionKind::Rest,
                yaml("url: http://x\nresponseValidation: ['res.ok']\nvariables: {id: res.id}"),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(action.expressions(), vec!["res.ok", "res.id"]);
        assert!(!action.is_background());
        assert_eq!(action.description(), "get");
    }
}
