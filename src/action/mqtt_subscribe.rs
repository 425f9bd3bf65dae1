//! MQTT subscribe action
//!
//! Listens on a topic for a fixed window and counts relevant messages. The
//! window closing is the only way the invocation succeeds, even when the
//! expected count was reached early.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::filter::MessageFilter;
use super::invocation::{ActionOutcome, Invocation, InvocationContext};
use super::mqtt::{BrokerDefinition, BrokerEvent, BrokerOptions, BrokerSession};
use super::template::{append_list, optional, scalar, MetaOverride};
use super::ActionMeta;
use crate::common::{Error, Result};
use crate::diagram::{DiagramRecorder, Payload};
use crate::expr::resolve_string;
use crate::proto::ProtoCodec;

/// How inbound payloads are decoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageCodec {
    #[default]
    Json,
    Proto,
}

/// Wire form of protobuf payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtoEncoding {
    #[default]
    Binary,
    Json,
}

/// MQTT subscribe definition as written in scenario files
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MqttSubscribeDefinition {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allow_insecure: Option<bool>,
    pub topic: Option<String>,
    /// Listen window in seconds
    pub duration: Option<u64>,
    pub expected_number_of_messages: Option<usize>,
    pub message_type: Option<MessageCodec>,
    pub proto_file: Option<PathBuf>,
    pub proto_class: Option<String>,
    pub encoding: Option<ProtoEncoding>,
    pub message_filter: Option<Vec<String>>,
}

impl MqttSubscribeDefinition {
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
pub struct MqttSubscribeAction {
    pub meta: ActionMeta,
    pub broker: BrokerOptions,
    pub topic: String,
    pub duration: Duration,
    pub expected_messages: usize,
    pub codec: MessageCodec,
    pub proto_file: Option<PathBuf>,
    pub proto_class: Option<String>,
    pub encoding: ProtoEncoding,
    pub filter: MessageFilter,
}

impl MqttSubscribeAction {
    pub fn from_definition(meta: MetaOverride, def: MqttSubscribeDefinition) -> Result<Self> {
        let broker = BrokerOptions::from_definition(&meta.name, def.broker())?;
        let missing = |field: &str| {
            Error::Config(format!(
                "MQTT_SUBSCRIBE action '{}' has no {}",
                meta.name, field
            ))
        };
        let topic = def.topic.ok_or_else(|| missing("topic"))?;
        let duration = def.duration.ok_or_else(|| missing("duration"))?;
        let expected_messages = def
            .expected_number_of_messages
            .ok_or_else(|| missing("expectedNumberOfMessages"))?;
        let codec = def.message_type.unwrap_or_default();
        if codec == MessageCodec::Proto && (def.proto_file.is_none() || def.proto_class.is_none()) {
            return Err(missing("protoFile/protoClass for proto messages"));
        }

        Ok(Self {
            meta: meta.into_meta(),
            broker,
            topic,
            duration: Duration::from_secs(duration),
            expected_messages,
            codec,
            proto_file: def.proto_file,
            proto_class: def.proto_class,
            encoding: def.encoding.unwrap_or_default(),
            filter: MessageFilter::new(def.message_filter.unwrap_or_default()),
        })
    }

    pub fn from_template(meta: MetaOverride, def: MqttSubscribeDefinition, template: &Self) -> Self {
        Self {
            meta: meta.merge(&template.meta),
            broker: BrokerOptions::from_template(def.broker(), &template.broker),
            topic: scalar(def.topic, &template.topic),
            duration: def
                .duration
                .map(Duration::from_secs)
                .unwrap_or(template.duration),
            expected_messages: scalar(def.expected_number_of_messages, &template.expected_messages),
            codec: scalar(def.message_type, &template.codec),
            proto_file: optional(def.proto_file, &template.proto_file),
            proto_class: optional(def.proto_class, &template.proto_class),
            encoding: scalar(def.encoding, &template.encoding),
            filter: MessageFilter::new(append_list(
                template.filter.predicates(),
                def.message_filter,
            )),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "SUBSCRIBE {} on {} ({} messages in {}s)",
            self.topic,
            self.broker.url,
            self.expected_messages,
            self.duration.as_secs()
        )
    }

    pub fn invoke(&self, ctx: &InvocationContext<'_>) -> Invocation {
        let prepared = self.broker.resolve(ctx.cache).and_then(|broker| {
            let topic = resolve_string(&self.topic, ctx.cache)?;
            let options = broker.mqtt_options(ctx.services.config.mqtt.keep_alive())?;
            Ok((broker, topic, options))
        });
        let (broker, topic, options) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return Invocation::failed(e),
        };

        let action = self.clone();
        let cache = ctx.cache.clone();
        let diagram = ctx.services.diagram.clone();
        let proto = ctx.services.proto.clone();
        let scenario_id = ctx.scenario_id.to_string();

        Invocation::new(async move {
            let target = broker.target();
            diagram.record_request(&scenario_id, &target, &format!("SUBSCRIBE {}", topic), &Payload::None);

            let mut session = BrokerSession::connect(options);
            let subscribed = session.client.subscribe(topic.as_str(), QoS::AtMostOnce).await;
            let received = match subscribed {
                Ok(()) => {
                    let decoder = Decoder::new(&action, proto);
                    listen_window(&mut session.events, &target, action.duration, |bytes| {
                        let msg = decoder.decode(&bytes)?;
                        if !action.filter.is_relevant(&msg, &cache)? {
                            tracing::trace!(topic = %topic, "dropping irrelevant message");
                            return Ok(false);
                        }
                        diagram.record_async_message(&scenario_id, &target, &Payload::Json(msg));
                        Ok(true)
                    })
                    .await
                }
                Err(e) => Err(Error::Protocol(format!("Subscribe to '{}' failed: {}", topic, e))),
            };
            session.close().await;

            let received = received?;
            check_count(
                diagram.as_ref(),
                &scenario_id,
                &topic,
                action.expected_messages,
                received,
            )?;
            Ok(ActionOutcome::default())
        })
    }
}

/// Payload decoder for one invocation
struct Decoder {
    codec: MessageCodec,
    schema: Option<(PathBuf, String)>,
    encoding: ProtoEncoding,
    proto: Arc<dyn ProtoCodec>,
}

impl Decoder {
    fn new(action: &MqttSubscribeAction, proto: Arc<dyn ProtoCodec>) -> Self {
        let schema = match (&action.proto_file, &action.proto_class) {
            (Some(file), Some(class)) => Some((file.clone(), class.clone())),
            _ => None,
        };
        Self {
            codec: action.codec,
            schema,
            encoding: action.encoding,
            proto,
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match (self.codec, &self.schema) {
            (MessageCodec::Json, _) => serde_json::from_slice(bytes)
                .map_err(|e| Error::Protocol(format!("Message is not valid JSON: {}", e))),
            (MessageCodec::Proto, None) => Err(Error::Config(
                "proto messages need protoFile and protoClass".to_string(),
            )),
            (MessageCodec::Proto, Some((file, class))) => match self.encoding {
                ProtoEncoding::Binary => self.proto.decode(file, class, bytes),
                ProtoEncoding::Json => {
                    let value: Value = serde_json::from_slice(bytes).map_err(|e| {
                        Error::Protocol(format!("Message is not valid JSON: {}", e))
                    })?;
                    let wire = self.proto.encode(file, class, &value)?;
                    self.proto.decode(file, class, &wire)
                }
            },
        }
    }
}

/// Count relevant messages until `window` has elapsed since the broker
/// acknowledged the connection. Broker failures end the window early with
/// an error.
async fn listen_window<F>(
    events: &mut mpsc::Receiver<BrokerEvent>,
    target: &str,
    window: Duration,
    mut on_message: F,
) -> Result<usize>
where
    F: FnMut(Vec<u8>) -> Result<bool>,
{
    let mut deadline: Option<Instant> = None;
    let mut received = 0;

    loop {
        let event = match deadline {
            Some(at) => match tokio::time::timeout_at(at, events.recv()).await {
                Ok(event) => event,
                Err(_) => return Ok(received),
            },
            None => events.recv().await,
        };

        match event {
            Some(BrokerEvent::Connected) => {
                if deadline.is_none() {
                    tracing::debug!(broker = %target, window_secs = window.as_secs(), "listening");
                    deadline = Some(Instant::now() + window);
                }
            }
            Some(BrokerEvent::Subscribed) | Some(BrokerEvent::Published) => {}
            Some(BrokerEvent::SubscribeFailed(reason)) => {
                return Err(Error::Protocol(format!("Subscribe rejected by {}: {}", target, reason)))
            }
            Some(BrokerEvent::Message(bytes)) => {
                if on_message(bytes)? {
                    received += 1;
                }
            }
            Some(BrokerEvent::Failed(message)) => return Err(Error::transport(target, message)),
            None => return Err(Error::transport(target, "connection closed")),
        }
    }
}

fn check_count(
    diagram: &dyn DiagramRecorder,
    scenario_id: &str,
    topic: &str,
    expected: usize,
    received: usize,
) -> Result<()> {
    if received == expected {
        return Ok(());
    }
    let reason = if received < expected {
        "listen window elapsed"
    } else {
        "more messages than expected"
    };
    diagram.record_missing(scenario_id, topic, expected, received, reason);
    Err(Error::count_mismatch(topic, expected, received))
}
