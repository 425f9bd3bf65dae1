//! Payload formatting for diagram notes
//!
//! Redaction, truncation and binary summaries all happen here so protocol
//! code can hand over raw payloads.

use std::collections::HashSet;

use serde_json::Value;

use super::Payload;
use crate::common::config::DiagramConfig;

const REDACTED: &str = "***";

/// Turns payloads into short, redacted note text
#[derive(Debug, Clone)]
pub struct PayloadFormatter {
    hidden_fields: HashSet<String>,
    hide_plaintext: bool,
    max_text_length: usize,
}

impl PayloadFormatter {
    pub fn new(config: &DiagramConfig) -> Self {
        Self {
            hidden_fields: config.hidden_fields.iter().cloned().collect(),
            hide_plaintext: config.hide_plaintext,
            max_text_length: config.max_text_length,
        }
    }

    /// Render a payload, or `None` when there is nothing to show
    pub fn format(&self, payload: &Payload) -> Option<String> {
        match payload {
            Payload::None => None,
            Payload::Json(value) => {
                let mut value = value.clone();
                self.redact(&mut value);
                Some(self.truncate(&value.to_string()))
            }
            Payload::Text(text) if self.hide_plaintext => {
                Some(format!("<text {} chars>", text.chars().count()))
            }
            Payload::Text(text) => Some(self.truncate(text)),
            Payload::Binary(bytes) => Some(format!("<binary {} bytes>", bytes.len())),
        }
    }

    fn redact(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, item) in map.iter_mut() {
                    if self.hidden_fields.contains(key) {
                        *item = Value::String(REDACTED.to_string());
                    } else {
                        self.redact(item);
                    }
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact(item)),
            _ => {}
        }
    }

    fn truncate(&self, text: &str) -> String {
        match text.char_indices().nth(self.max_text_length) {
            Some((cut, _)) => format!("{}…", &text[..cut]),
            None => text.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn formatter(hidden: &[&str], hide_plaintext: bool, max: usize) -> PayloadFormatter {
        PayloadFormatter::new(&DiagramConfig {
            hidden_fields: hidden.iter().map(|s| s.to_string()).collect(),
            hide_plaintext,
            max_text_length: max,
            ..DiagramConfig::default()
        })
    }

    #[test]
    fn test_redacts_nested_fields() {
        let f = formatter(&["password"], false, 300);
        let out = f
            .format(&Payload::Json(json!({"user": {"name": "a", "password": "s3cret"}})))
            .unwrap();
        assert!(out.contains("***"));
        assert!(!out.contains("s3cret"));
    }

    #[test]
    fn test_truncates_long_text() {
        let f = formatter(&[], false, 5);
        assert_eq!(f.format(&Payload::Text("abcdefgh".into())).unwrap(), "abcde…");
        assert_eq!(f.format(&Payload::Text("abc".into())).unwrap(), "abc");
    }

    #[test]
    fn test_hides_plaintext_and_summarises_binary() {
        let f = formatter(&[], true, 300);
        assert_eq!(
            f.format(&Payload::Text("hello".into())).unwrap(),
            "<text 5 chars>"
        );
        assert_eq!(
            f.format(&Payload::Binary(vec![0; 16])).unwrap(),
            "<binary 16 bytes>"
        );
        assert!(f.format(&Payload::None).is_none());
    }
}
