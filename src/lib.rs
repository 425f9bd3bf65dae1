//! Scenario CLI - declarative integration-test scenarios
//!
//! This library executes ordered sequences of network actions (HTTP
//! requests, MQTT subscribe/publish, WebSocket exchanges) against live
//! services, validating responses and chaining data between steps.

pub mod action;
pub mod cli;
pub mod commands;
pub mod common;
pub mod diagram;
pub mod expr;
pub mod loader;
pub mod proto;
pub mod scenario;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use scenario::{Orchestrator, Scenario, ScenarioRunner};
