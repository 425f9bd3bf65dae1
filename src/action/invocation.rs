//! Invocation handles
//!
//! `Action::invoke` resolves its parameters against the scenario cache and
//! returns an [`Invocation`]: a self-contained completion future paired with
//! a cancel handle. All execution state (open sockets, message counters)
//! lives inside the completion, never in the action definition.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::common::{Config, Error, Result};
use crate::diagram::DiagramRecorder;
use crate::proto::ProtoCodec;
use crate::scenario::VariableCache;

/// Shared collaborators handed to every invocation
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub diagram: Arc<dyn DiagramRecorder>,
    pub proto: Arc<dyn ProtoCodec>,
    pub http: reqwest::Client,
}

impl Services {
    pub fn new(
        config: Arc<Config>,
        diagram: Arc<dyn DiagramRecorder>,
        proto: Arc<dyn ProtoCodec>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config,
            diagram,
            proto,
            http,
        })
    }
}

/// What an action invocation sees of its scenario
pub struct InvocationContext<'a> {
    pub scenario_id: &'a str,
    pub cache: &'a VariableCache,
    pub services: &'a Services,
}

/// Result of a successful invocation
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ActionOutcome {
    /// Cache writes, applied by the runner in order
    pub variables: Vec<(String, Value)>,
}

/// Cloneable handle that cancels an invocation
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// A running action: completion plus cancellation
pub struct Invocation {
    completion: BoxFuture<'static, Result<ActionOutcome>>,
    token: CancellationToken,
}

impl Invocation {
    /// An invocation that ignores cancellation
    pub fn new<F>(completion: F) -> Self
    where
        F: Future<Output = Result<ActionOutcome>> + Send + 'static,
    {
        Self {
            completion: completion.boxed(),
            token: CancellationToken::new(),
        }
    }

    /// An invocation whose completion observes the cancel token
    pub fn cancellable<F, Fut>(build: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<ActionOutcome>> + Send + 'static,
    {
        let token = CancellationToken::new();
        Self {
            completion: build(token.clone()).boxed(),
            token,
        }
    }

    /// An invocation that already failed, e.g. during parameter resolution
    pub fn failed(error: Error) -> Self {
        Self::new(async move { Err(error) })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.token.clone())
    }

    /// Release any resources the invocation holds
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the invocation to finish
    pub async fn wait(self) -> Result<ActionOutcome> {
        self.completion.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_failed_invocation_rejects() {
        let err = Invocation::failed(Error::Internal("boom".into()))
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INTERNAL");
    }

    #[tokio::test]
    async fn test_cancel_reaches_completion() {
        let invocation = Invocation::cancellable(|token| async move {
            token.cancelled().await;
            Ok(ActionOutcome {
                variables: vec![("closed".to_string(), json!(true))],
            })
        });
        let handle = invocation.cancel_handle();
        handle.cancel();
        assert!(handle.is_cancelled());
        let outcome = invocation.wait().await.unwrap();
        assert_eq!(outcome.variables[0].1, json!(true));
    }
}
