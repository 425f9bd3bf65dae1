//! Common utilities shared by the loader, the actions and the CLI

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use config::Config;
pub use error::{Error, Result};

/// `host[:port]` of a URL, used as the diagram participant when an action
/// names no service. Falls back to the raw string for unparseable input.
pub fn short_target(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            },
            None => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}
