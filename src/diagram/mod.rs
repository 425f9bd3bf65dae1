//! Sequence diagram recording
//!
//! Actions report what went over the wire; a recorder turns that into one
//! diagram per scenario. Recording is fire-and-forget and never affects
//! control flow, only `finalize` can fail.

mod format;
mod mermaid;

use async_trait::async_trait;
use serde_json::Value;

use crate::common::Result;

pub use format::PayloadFormatter;
pub use mermaid::{DiagramEntry, MermaidRecorder};

/// A message body as seen on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// JSON view used when binding a payload into expressions; binary
    /// bodies become an array of byte values
    pub fn to_value(&self) -> Value {
        match self {
            Payload::None => Value::Null,
            Payload::Json(value) => value.clone(),
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::None => true,
            Payload::Json(_) => false,
            Payload::Text(text) => text.is_empty(),
            Payload::Binary(bytes) => bytes.is_empty(),
        }
    }
}

/// Consumer of per-scenario diagram events
#[async_trait]
pub trait DiagramRecorder: Send + Sync {
    fn start_scenario(&self, id: &str, title: &str);

    fn record_request(&self, id: &str, target: &str, summary: &str, payload: &Payload);

    fn record_response(
        &self,
        id: &str,
        source: &str,
        status: u16,
        payload: &Payload,
        error: Option<&str>,
    );

    fn record_async_message(&self, id: &str, source: &str, payload: &Payload);

    fn record_missing(&self, id: &str, topic: &str, expected: usize, received: usize, reason: &str);

    /// Write out the diagram for a finished scenario
    async fn finalize(&self, id: &str) -> Result<()>;
}

/// Recorder that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

#[async_trait]
impl DiagramRecorder for NullRecorder {
    fn start_scenario(&self, _id: &str, _title: &str) {}

    fn record_request(&self, _id: &str, _target: &str, _summary: &str, _payload: &Payload) {}

    fn record_response(
        &self,
        _id: &str,
        _source: &str,
        _status: u16,
        _payload: &Payload,
        _error: Option<&str>,
    ) {
    }

    fn record_async_message(&self, _id: &str, _source: &str, _payload: &Payload) {}

    fn record_missing(
        &self,
        _id: &str,
        _topic: &str,
        _expected: usize,
        _received: usize,
        _reason: &str,
    ) {
    }

    async fn finalize(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}
