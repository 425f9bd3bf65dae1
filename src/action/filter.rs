//! Relevance filter for pub/sub and WebSocket messages

use serde_json::Value;

use crate::common::Result;
use crate::expr::{eval_predicate, Bindings};
use crate::scenario::VariableCache;

/// A message is relevant when any predicate is truthy with `msg` bound to
/// it, or when no predicates are configured
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    predicates: Vec<String>,
}

impl MessageFilter {
    pub fn new(predicates: Vec<String>) -> Self {
        Self { predicates }
    }

    pub fn predicates(&self) -> &[String] {
        &self.predicates
    }

    pub fn is_relevant(&self, msg: &Value, cache: &VariableCache) -> Result<bool> {
        if self.predicates.is_empty() {
            return Ok(true);
        }
        let scope = Bindings::new(cache).with("msg", msg);
        for predicate in &self.predicates {
            if eval_predicate(predicate, &scope)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_predicates_accepts_everything() {
        let filter = MessageFilter::default();
        assert!(filter.is_relevant(&json!(null), &VariableCache::new()).unwrap());
    }

    #[test]
    fn test_any_predicate_matches() {
        let filter = MessageFilter::new(vec![
            "msg.type === 'alarm'".to_string(),
            "msg.level > 3".to_string(),
        ]);
        let cache = VariableCache::new();
        assert!(filter.is_relevant(&json!({"type": "alarm", "level": 0}), &cache).unwrap());
        assert!(filter.is_relevant(&json!({"type": "info", "level": 5}), &cache).unwrap());
        assert!(!filter.is_relevant(&json!({"type": "info", "level": 1}), &cache).unwrap());
    }

    #[test]
    fn test_predicates_can_read_cache() {
        let mut cache = VariableCache::new();
        cache.insert("deviceId", json!("d-7"));
        let filter = MessageFilter::new(vec!["msg.device == deviceId".to_string()]);
        assert!(filter.is_relevant(&json!({"device": "d-7"}), &cache).unwrap());
    }

    #[test]
    fn test_throwing_predicate_is_an_error() {
        let filter = MessageFilter::new(vec!["msg.a.b".to_string()]);
        assert!(filter
            .is_relevant(&json!({"a": null}), &VariableCache::new())
            .is_err());
    }
}
