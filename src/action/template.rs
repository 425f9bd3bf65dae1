//! Field merge rules for deriving an action from a template
//!
//! - scalars: the override wins when present
//! - maps (headers, query, form, variables): shallow merge, override keys win
//! - data: list templates are extended, object templates shallow-merged
//! - accumulating lists (validations, filters): template first, then override
//!
//! Templates are only ever read.

use std::collections::BTreeMap;

use serde_json::Value;

use super::ActionMeta;

pub(crate) fn scalar<T: Clone>(over: Option<T>, base: &T) -> T {
    over.unwrap_or_else(|| base.clone())
}

pub(crate) fn optional<T: Clone>(over: Option<T>, base: &Option<T>) -> Option<T> {
    over.or_else(|| base.clone())
}

pub(crate) fn merge_map<V: Clone>(
    base: &BTreeMap<String, V>,
    over: Option<BTreeMap<String, V>>,
) -> BTreeMap<String, V> {
    let mut merged = base.clone();
    if let Some(over) = over {
        merged.extend(over);
    }
    merged
}

pub(crate) fn append_list<T: Clone>(base: &[T], over: Option<Vec<T>>) -> Vec<T> {
    let mut merged = base.to_vec();
    merged.extend(over.unwrap_or_default());
    merged
}

pub(crate) fn merge_data(base: &Option<Value>, over: Option<Value>) -> Option<Value> {
    match (base, over) {
        (None, over) => over,
        (Some(base), None) => Some(base.clone()),
        (Some(Value::Array(base)), Some(Value::Array(over))) => {
            let mut merged = base.clone();
            merged.extend(over);
            Some(Value::Array(merged))
        }
        (Some(Value::Array(base)), Some(single)) => {
            let mut merged = base.clone();
            merged.push(single);
            Some(Value::Array(merged))
        }
        (Some(Value::Object(base)), Some(Value::Object(over))) => {
            let mut merged = base.clone();
            merged.extend(over);
            Some(Value::Object(merged))
        }
        (Some(_), Some(over)) => Some(over),
    }
}

/// Common header fields of an override definition
#[derive(Debug, Clone, Default)]
pub struct MetaOverride {
    pub name: String,
    pub description: Option<String>,
    pub invoke_even_on_fail: Option<bool>,
    pub allow_failure: Option<bool>,
}

impl MetaOverride {
    /// Standalone action header with defaults for absent fields
    pub fn into_meta(self) -> ActionMeta {
        ActionMeta {
            description: self.description.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            invoke_even_on_fail: self.invoke_even_on_fail.unwrap_or(false),
            allow_failure: self.allow_failure.unwrap_or(false),
        }
    }

    /// Header for an action derived from `template`
    pub fn merge(self, template: &ActionMeta) -> ActionMeta {
        ActionMeta {
            name: self.name,
            description: scalar(self.description, &template.description),
            invoke_even_on_fail: scalar(self.invoke_even_on_fail, &template.invoke_even_on_fail),
            allow_failure: scalar(self.allow_failure, &template.allow_failure),
        }
    }
}
