//! Per-scenario variable cache

use std::collections::HashMap;

use serde_json::Value;

use crate::expr::Scope;

/// Key/value store written by action results and read by later actions'
/// templates. Keys are unique and the last write wins.
#[derive(Debug, Default, Clone)]
pub struct VariableCache {
    entries: HashMap<String, Value>,
}

impl VariableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Apply a batch of writes in order
    pub fn extend(&mut self, writes: impl IntoIterator<Item = (String, Value)>) {
        for (key, value) in writes {
            tracing::debug!(key = %key, "cache write");
            self.entries.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Scope for VariableCache {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_write_wins() {
        let mut cache = VariableCache::new();
        cache.insert("id", json!(1));
        cache.extend(vec![("id".to_string(), json!(2)), ("name".to_string(), json!("x"))]);
        assert_eq!(cache.get("id"), Some(&json!(2)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_is_an_expression_scope() {
        let mut cache = VariableCache::new();
        cache.insert("token", json!("abc"));
        assert_eq!(
            crate::expr::resolve_string("Bearer ${token}", &cache).unwrap(),
            "Bearer abc"
        );
    }
}
