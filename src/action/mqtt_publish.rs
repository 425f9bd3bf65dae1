//! MQTT publish action

use std::path::PathBuf;
use std::time::Duration;

use rumqttc::QoS;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::invocation::{ActionOutcome, Invocation, InvocationContext};
use super::mqtt::{BrokerDefinition, BrokerEvent, BrokerOptions, BrokerSession};
use super::template::{merge_data, optional, scalar, MetaOverride};
use super::ActionMeta;
use crate::common::{Error, Result};
use crate::diagram::Payload;
use crate::expr::{resolve_string, resolve_value};

/// MQTT publish definition as written in scenario files
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MqttPublishDefinition {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allow_insecure: Option<bool>,
    pub topic: Option<String>,
    pub data: Option<Value>,
    pub proto_file: Option<PathBuf>,
    pub proto_class: Option<String>,
}

impl MqttPublishDefinition {
    fn broker(&self) -> BrokerDefinition {
        BrokerDefinition {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            allow_insecure: self.allow_insecure,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttPublishAction {
    pub meta: ActionMeta,
    pub broker: BrokerOptions,
    pub topic: String,
    pub data: Option<Value>,
    pub proto_file: Option<PathBuf>,
    pub proto_class: Option<String>,
}

impl MqttPublishAction {
    pub fn from_definition(meta: MetaOverride, def: MqttPublishDefinition) -> Result<Self> {
        let broker = BrokerOptions::from_definition(&meta.name, def.broker())?;
        let topic = def.topic.ok_or_else(|| {
            Error::Config(format!("MQTT_PUBLISH action '{}' has no topic", meta.name))
        })?;
        if def.proto_file.is_some() != def.proto_class.is_some() {
            return Err(Error::Config(format!(
                "MQTT_PUBLISH action '{}' needs both protoFile and protoClass",
                meta.name
            )));
        }
        Ok(Self {
            meta: meta.into_meta(),
            broker,
            topic,
            data: def.data,
            proto_file: def.proto_file,
            proto_class: def.proto_class,
        })
    }

    pub fn from_template(meta: MetaOverride, def: MqttPublishDefinition, template: &Self) -> Self {
        Self {
            meta: meta.merge(&template.meta),
            broker: BrokerOptions::from_template(def.broker(), &template.broker),
            topic: scalar(def.topic, &template.topic),
            data: merge_data(&template.data, def.data),
            proto_file: optional(def.proto_file, &template.proto_file),
            proto_class: optional(def.proto_class, &template.proto_class),
        }
    }

    pub fn describe(&self) -> String {
        format!("PUBLISH {} on {}", self.topic, self.broker.url)
    }

    pub fn invoke(&self, ctx: &InvocationContext<'_>) -> Invocation {
        let prepared = self.broker.resolve(ctx.cache).and_then(|broker| {
            let topic = resolve_string(&self.topic, ctx.cache)?;
            let data = match &self.data {
                Some(data) => resolve_value(data, ctx.cache)?,
                None => Value::Null,
            };
            let bytes = match (&self.proto_file, &self.proto_class) {
                (Some(file), Some(class)) => ctx.services.proto.encode(file, class, &data)?,
                _ => serde_json::to_vec(&data)?,
            };
            let options = broker.mqtt_options(ctx.services.config.mqtt.keep_alive())?;
            Ok((broker, topic, data, bytes, options))
        });
        let (broker, topic, data, bytes, options) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Invocation::failed(e),
        };

        let diagram = ctx.services.diagram.clone();
        let timeout = ctx.services.config.mqtt.ack_timeout();
        let strict = ctx.services.config.mqtt.strict_publish;
        let scenario_id = ctx.scenario_id.to_string();

        Invocation::new(async move {
            let target = broker.target();
            let mut session = BrokerSession::connect(options);
            let published = match session
                .client
                .publish(topic.as_str(), QoS::AtLeastOnce, false, bytes)
                .await
            {
                Ok(()) => await_ack(&mut session.events, &target, timeout).await,
                Err(e) => Err(Error::Protocol(format!("Publish to '{}' failed: {}", topic, e))),
            };

            diagram.record_request(&scenario_id, &target, &format!("PUBLISH {}", topic), &Payload::Json(data));
            session.close().await;

            match published {
                Ok(()) => Ok(ActionOutcome::default()),
                Err(e) if strict => Err(e),
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "publish failed");
                    Ok(ActionOutcome::default())
                }
            }
        })
    }
}

/// Wait for the broker to acknowledge the QoS 1 publish
async fn await_ack(
    events: &mut mpsc::Receiver<BrokerEvent>,
    target: &str,
    timeout: Duration,
) -> Result<()> {
    let wait = async {
        loop {
            match events.recv().await {
                Some(BrokerEvent::Published) => return Ok(()),
                Some(BrokerEvent::Failed(message)) => return Err(Error::transport(target, message)),
                Some(_) => continue,
                None => return Err(Error::transport(target, "connection closed")),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or_else(|_| Err(Error::transport(target, "no publish acknowledgement")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(name: &str) -> MetaOverride {
        MetaOverride {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_proto_needs_file_and_class() {
        let err = MqttPublishAction::from_definition(
            meta("p"),
            MqttPublishDefinition {
                url: Some("mqtt://b".into()),
                topic: Some("t".into()),
                proto_file: Some("x.proto".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "CONFIG");
    }

    #[test]
    fn test_template_data_merge() {
        let template = MqttPublishAction::from_definition(
            meta("base"),
            MqttPublishDefinition {
                url: Some("mqtt://b".into()),
                topic: Some("devices/1".into()),
                data: Some(json!({"kind": "reading", "value": 1})),
                ..Default::default()
            },
        )
        .unwrap();
        let derived = MqttPublishAction::from_template(
            meta("hot"),
            MqttPublishDefinition {
                data: Some(json!({"value": 99})),
                ..Default::default()
            },
            &template,
        );
        assert_eq!(derived.topic, "devices/1");
        assert_eq!(derived.data, Some(json!({"kind": "reading", "value": 99})));
        assert_eq!(template.data, Some(json!({"kind": "reading", "value": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_wait() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(BrokerEvent::Connected).await.unwrap();
        tx.send(BrokerEvent::Published).await.unwrap();
        assert!(await_ack(&mut rx, "b", Duration::from_secs(1)).await.is_ok());

        let err = await_ack(&mut rx, "b", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transport());
        drop(tx);
    }
}
