//! WebSocket action
//!
//! Opens a socket, optionally sends one payload, and counts relevant inbound
//! messages until the peer closes. Abnormal closures (1006, or the stream
//! dropping without a close frame) reconnect a bounded number of times; the
//! relevant-message count and the sent-payload flag carry across reconnects.
//! Cancelling a session closes the socket and ends it with the same count
//! check as a normal close.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::filter::MessageFilter;
use super::invocation::{ActionOutcome, Invocation, InvocationContext};
use super::template::{append_list, merge_data, merge_map, optional, scalar, MetaOverride};
use super::ActionMeta;
use crate::common::{short_target, Error, Result};
use crate::diagram::{DiagramRecorder, Payload};
use crate::expr::{resolve_map, resolve_string, resolve_value};
use crate::scenario::VariableCache;

const ABNORMAL_CLOSURE: u16 = 1006;
const NO_STATUS_RECEIVED: u16 = 1005;

/// WebSocket definition as written in scenario files
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebSocketDefinition {
    pub service_name: Option<String>,
    pub url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub payload: Option<Value>,
    pub expected_number_of_messages: Option<usize>,
    pub message_filter: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketAction {
    pub meta: ActionMeta,
    pub service_name: Option<String>,
    pub url: String,
    /// Sent as query parameters, not as handshake headers
    pub headers: BTreeMap<String, String>,
    pub payload: Option<Value>,
    pub expected_messages: usize,
    pub filter: MessageFilter,
}

impl WebSocketAction {
    pub fn from_definition(meta: MetaOverride, def: WebSocketDefinition) -> Result<Self> {
        let missing = |field: &str| {
            Error::Config(format!("WEBSOCKET action '{}' has no {}", meta.name, field))
        };
        let url = def.url.ok_or_else(|| missing("url"))?;
        let expected_messages = def
            .expected_number_of_messages
            .ok_or_else(|| missing("expectedNumberOfMessages"))?;
        Ok(Self {
            meta: meta.into_meta(),
            service_name: def.service_name,
            url,
            headers: def.headers.unwrap_or_default(),
            payload: def.payload,
            expected_messages,
            filter: MessageFilter::new(def.message_filter.unwrap_or_default()),
        })
    }

    pub fn from_template(meta: MetaOverride, def: WebSocketDefinition, template: &Self) -> Self {
        Self {
            meta: meta.merge(&template.meta),
            service_name: optional(def.service_name, &template.service_name),
            url: scalar(def.url, &template.url),
            headers: merge_map(&template.headers, def.headers),
            payload: merge_data(&template.payload, def.payload),
            expected_messages: scalar(def.expected_number_of_messages, &template.expected_messages),
            filter: MessageFilter::new(append_list(
                template.filter.predicates(),
                def.message_filter,
            )),
        }
    }

    pub fn describe(&self) -> String {
        format!("WS {} ({} messages)", self.url, self.expected_messages)
    }

    fn prepare(&self, cache: &VariableCache) -> Result<(String, Option<String>)> {
        let base = resolve_string(&self.url, cache)?;
        let params = resolve_map(&self.headers, cache)?;
        let url = with_query(&base, &params)?;
        if !params.is_empty() {
            tracing::debug!(
                url = %base,
                count = params.len(),
                "websocket headers sent as query parameters"
            );
        }

        let payload = match &self.payload {
            Some(payload) => Some(match resolve_value(payload, cache)? {
                Value::String(text) => text,
                other => serde_json::to_string(&other)?,
            }),
            None => None,
        };
        Ok((url, payload))
    }

    pub fn invoke(&self, ctx: &InvocationContext<'_>) -> Invocation {
        let (url, payload) = match self.prepare(ctx.cache) {
            Ok(prepared) => prepared,
            Err(e) => return Invocation::failed(e),
        };

        let session = Session {
            target: self
                .service_name
                .clone()
                .unwrap_or_else(|| short_target(&url)),
            url,
            payload,
            payload_sent: false,
            relevant: 0,
            expected: self.expected_messages,
            max_reconnects: ctx.services.config.websocket.max_reconnects,
            filter: self.filter.clone(),
            cache: ctx.cache.clone(),
            diagram: ctx.services.diagram.clone(),
            scenario_id: ctx.scenario_id.to_string(),
        };
        Invocation::cancellable(move |token| session.run(token))
    }
}

/// Append `params` to the query string of `base`
fn with_query(base: &str, params: &BTreeMap<String, String>) -> Result<String> {
    if params.is_empty() {
        return Ok(base.to_string());
    }
    let mut url = url::Url::parse(base)
        .map_err(|e| Error::Config(format!("Invalid websocket url '{}': {}", base, e)))?;
    url.query_pairs_mut().extend_pairs(params.iter());
    Ok(url.into())
}

/// How one connection ended
#[derive(Debug, PartialEq)]
enum Closure {
    Normal(u16),
    Abnormal(String),
    ConnectFailed(String),
    Cancelled,
}

/// Execution state of one invocation
struct Session {
    url: String,
    target: String,
    payload: Option<String>,
    payload_sent: bool,
    relevant: usize,
    expected: usize,
    max_reconnects: u32,
    filter: MessageFilter,
    cache: VariableCache,
    diagram: Arc<dyn DiagramRecorder>,
    scenario_id: String,
}

impl Session {
    async fn run(mut self, token: CancellationToken) -> Result<ActionOutcome> {
        let mut reconnects = 0;
        loop {
            let closure = self.connection(&token).await?;
            match closure {
                Closure::Cancelled => {
                    tracing::debug!(url = %self.url, "websocket cancelled at scenario end");
                    return self.finish("cancelled at scenario end");
                }
                Closure::Abnormal(reason) | Closure::ConnectFailed(reason)
                    if reconnects < self.max_reconnects =>
                {
                    reconnects += 1;
                    tracing::warn!(
                        url = %self.url,
                        attempt = reconnects,
                        reason = %reason,
                        "websocket closed abnormally, reconnecting"
                    );
                }
                Closure::ConnectFailed(reason) => return Err(Error::transport(&self.target, reason)),
                Closure::Abnormal(reason) => {
                    tracing::debug!(url = %self.url, reason = %reason, "websocket gave up reconnecting");
                    return self.finish("socket closed");
                }
                Closure::Normal(code) => {
                    tracing::debug!(url = %self.url, code, "websocket closed");
                    return self.finish("socket closed");
                }
            }
        }
    }

    async fn connection(&mut self, token: &CancellationToken) -> Result<Closure> {
        let connected = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Closure::Cancelled),
            connected = tokio_tungstenite::connect_async(self.url.as_str()) => connected,
        };
        let mut socket = match connected {
            Ok((socket, _)) => socket,
            Err(e) => return Ok(Closure::ConnectFailed(e.to_string())),
        };

        if !self.payload_sent {
            let summary = format!("WS {}", path_of(&self.url));
            let recorded = match &self.payload {
                Some(text) => {
                    if let Err(e) = socket.send(Message::Text(text.clone())).await {
                        return Ok(Closure::Abnormal(e.to_string()));
                    }
                    text_payload(text)
                }
                None => Payload::None,
            };
            self.payload_sent = true;
            self.diagram
                .record_request(&self.scenario_id, &self.target, &summary, &recorded);
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    let _ = socket.close(None).await;
                    return Ok(Closure::Cancelled);
                }
                next = socket.next() => next,
            };

            match next {
                None => return Ok(Closure::Abnormal("connection dropped".to_string())),
                Some(Err(e)) => return Ok(Closure::Abnormal(e.to_string())),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(NO_STATUS_RECEIVED);
                    if code == ABNORMAL_CLOSURE {
                        return Ok(Closure::Abnormal(format!("close code {}", code)));
                    }
                    return Ok(Closure::Normal(code));
                }
                Some(Ok(Message::Text(text))) => self.on_message(text.as_bytes())?,
                Some(Ok(Message::Binary(bytes))) => self.on_message(&bytes)?,
                Some(Ok(_)) => {}
            }
        }
    }

    fn on_message(&mut self, raw: &[u8]) -> Result<()> {
        let msg: Value = serde_json::from_slice(raw)
            .map_err(|e| Error::Protocol(format!("WebSocket message is not valid JSON: {}", e)))?;
        if !self.filter.is_relevant(&msg, &self.cache)? {
            return Ok(());
        }
        self.relevant += 1;
        self.diagram
            .record_async_message(&self.scenario_id, &self.target, &Payload::Json(msg));
        Ok(())
    }

    fn finish(&self, reason: &str) -> Result<ActionOutcome> {
        if self.relevant == self.expected {
            return Ok(ActionOutcome::default());
        }
        self.diagram.record_missing(
            &self.scenario_id,
            &self.url,
            self.expected,
            self.relevant,
            reason,
        );
        Err(Error::count_mismatch(&self.url, self.expected, self.relevant))
    }
}

fn text_payload(text: &str) -> Payload {
    match serde_json::from_str(text) {
        Ok(value) => Payload::Json(value),
        Err(_) => Payload::Text(text.to_string()),
    }
}

fn path_of(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}
