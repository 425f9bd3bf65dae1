//! Scenarios and their execution
//!
//! A scenario is a flat, ordered list of actions sharing one variable
//! cache. The runner executes one scenario; the orchestrator runs many in
//! parallel batches and aggregates the results.

mod cache;
mod orchestrator;
mod runner;

use std::sync::Arc;

use crate::action::Action;

pub use cache::VariableCache;
pub use orchestrator::{Orchestrator, RunReport};
pub use runner::{ScenarioReport, ScenarioRunner, ScenarioStatus, TestResult};

/// A named, ordered sequence of actions
#[derive(Debug, Clone)]
pub struct Scenario {
    /// File-name safe identifier, also the diagram id
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub actions: Vec<Arc<Action>>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, description: Option<String>, actions: Vec<Arc<Action>>) -> Self {
        let name = name.into();
        Self {
            id: slug(&name),
            name,
            description,
            actions,
        }
    }
}

/// Lowercase ASCII alphanumerics separated by single dashes
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("scenario");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug() {
        assert_eq!(slug("Create user, then fetch it!"), "create-user-then-fetch-it");
        assert_eq!(slug("  MQTT / alerts  "), "mqtt-alerts");
        assert_eq!(slug("!!!"), "scenario");
    }
}
