//! Scenario runner
//!
//! Executes one scenario's actions strictly in order against a fresh
//! variable cache, stopping at the first failure. WebSocket actions run in
//! the background: later actions start without waiting for them, and any
//! still open when the scenario ends are cancelled and reported then.

use std::time::{Duration, Instant};

use colored::Colorize;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

use super::{Scenario, VariableCache};
use crate::action::{Action, ActionOutcome, CancelHandle, InvocationContext, Services};
use crate::common::{Error, Result};

/// Outcome of one action
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub action: String,
    pub description: String,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    /// Stable error code, see [`Error::kind`]
    pub error_kind: Option<&'static str>,
}

/// Scenario lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Ordered result log of one scenario
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub id: String,
    pub name: String,
    pub status: ScenarioStatus,
    pub results: Vec<TestResult>,
    /// Actions never started because an earlier one failed
    pub skipped: usize,
}

impl ScenarioReport {
    pub fn pending(scenario: &Scenario) -> Self {
        Self {
            id: scenario.id.clone(),
            name: scenario.name.clone(),
            status: ScenarioStatus::Pending,
            results: Vec::new(),
            skipped: 0,
        }
    }

    pub fn success(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn duration_ms(&self) -> u64 {
        self.results.iter().map(|r| r.duration_ms).sum()
    }
}

/// Runs scenarios one at a time; cheap to clone and share across tasks
#[derive(Clone)]
pub struct ScenarioRunner {
    services: Services,
    /// Print a line per action as it completes
    print_progress: bool,
}

impl ScenarioRunner {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            print_progress: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.print_progress = false;
        self
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(&self, scenario: &Scenario) -> ScenarioReport {
        let span = tracing::info_span!("scenario", name = %scenario.name);
        self.execute(scenario).instrument(span).await
    }

    async fn execute(&self, scenario: &Scenario) -> ScenarioReport {
        let mut report = ScenarioReport::pending(scenario);
        report.status = ScenarioStatus::Running;
        self.services
            .diagram
            .start_scenario(&scenario.id, &scenario.name);
        tracing::info!(actions = scenario.actions.len(), "scenario started");

        let mut cache = VariableCache::new();
        let mut background = Vec::new();

        for (index, action) in scenario.actions.iter().enumerate() {
            let mut failed = false;
            if let Some(result) = self
                .run_action(scenario, index, action, &mut cache, &mut background)
                .await
            {
                failed |= self.push_result(scenario, &mut report, result);
            }
            for result in self.collect_finished(scenario, &mut background, &mut cache).await {
                failed |= self.push_result(scenario, &mut report, result);
            }

            if failed {
                report.skipped = scenario.actions.len() - index - 1;
                if report.skipped > 0 {
                    tracing::warn!(skipped = report.skipped, "aborting remaining actions");
                }
                break;
            }
        }

        let grace = if report.success() {
            self.services.config.websocket.close_grace()
        } else {
            Duration::ZERO
        };
        for result in self
            .close_background(scenario, background, grace, &mut cache)
            .await
        {
            self.push_result(scenario, &mut report, result);
        }

        report.status = if report.success() {
            ScenarioStatus::Succeeded
        } else {
            ScenarioStatus::Failed
        };
        tracing::info!(status = ?report.status, duration_ms = report.duration_ms(), "scenario finished");
        report
    }

    /// Append a result; returns whether it failed
    fn push_result(
        &self,
        scenario: &Scenario,
        report: &mut ScenarioReport,
        result: TestResult,
    ) -> bool {
        self.print_result(scenario, &result);
        let failed = !result.success;
        report.results.push(result);
        failed
    }

    /// Invoke one action. Background actions are spawned and yield no result
    /// until they finish or are cancelled.
    async fn run_action(
        &self,
        scenario: &Scenario,
        index: usize,
        action: &Action,
        cache: &mut VariableCache,
        background: &mut Vec<BackgroundAction>,
    ) -> Option<TestResult> {
        let span = tracing::info_span!("action", name = %action.name(), kind = %action.kind());
        let start = Instant::now();

        let invocation = {
            let ctx = InvocationContext {
                scenario_id: &scenario.id,
                cache: &*cache,
                services: &self.services,
            };
            span.in_scope(|| action.invoke(&ctx))
        };

        if action.is_background() {
            span.in_scope(|| tracing::debug!("running in background"));
            let cancel = invocation.cancel_handle();
            let task = tokio::spawn(
                async move {
                    let outcome = invocation.wait().await;
                    (outcome, start.elapsed().as_millis() as u64)
                }
                .instrument(span),
            );
            background.push(BackgroundAction {
                index,
                started: start,
                cancel,
                task,
            });
            return None;
        }

        let outcome = invocation.wait().instrument(span.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let _entered = span.enter();
        Some(complete(action, outcome, duration_ms, cache))
    }

    /// Results of background actions that already ended on their own
    async fn collect_finished(
        &self,
        scenario: &Scenario,
        background: &mut Vec<BackgroundAction>,
        cache: &mut VariableCache,
    ) -> Vec<TestResult> {
        let mut results = Vec::new();
        let mut running = Vec::with_capacity(background.len());
        for mut task in background.drain(..) {
            if task.task.is_finished() {
                let joined = (&mut task.task).await;
                results.push(task.finish(joined, scenario, cache));
            } else {
                running.push(task);
            }
        }
        *background = running;
        results
    }

    /// Give background actions `grace` to end on their own, then cancel the
    /// rest and collect every result in start order
    async fn close_background(
        &self,
        scenario: &Scenario,
        background: Vec<BackgroundAction>,
        grace: Duration,
        cache: &mut VariableCache,
    ) -> Vec<TestResult> {
        if background.is_empty() {
            return Vec::new();
        }
        let deadline = tokio::time::Instant::now() + grace;
        let mut results = Vec::with_capacity(background.len());
        for mut task in background {
            let joined = match tokio::time::timeout_at(deadline, &mut task.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::debug!(
                        action = %scenario.actions[task.index].name(),
                        "cancelling background action"
                    );
                    task.cancel.cancel();
                    (&mut task.task).await
                }
            };
            results.push(task.finish(joined, scenario, cache));
        }
        results
    }

    fn print_result(&self, scenario: &Scenario, result: &TestResult) {
        if !self.print_progress {
            return;
        }
        let mark = if result.success {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "  {} {} {} {}",
            mark,
            format!("[{}]", scenario.name).dimmed(),
            result.description,
            format!("({} ms)", result.duration_ms).dimmed()
        );
        if let Some(error) = &result.error {
            println!("      {}", error.red());
        }
    }
}

/// A spawned invocation the scenario does not wait for
struct BackgroundAction {
    index: usize,
    started: Instant,
    cancel: CancelHandle,
    task: JoinHandle<(Result<ActionOutcome>, u64)>,
}

impl BackgroundAction {
    fn finish(
        &self,
        joined: std::result::Result<(Result<ActionOutcome>, u64), JoinError>,
        scenario: &Scenario,
        cache: &mut VariableCache,
    ) -> TestResult {
        let action = &scenario.actions[self.index];
        let (outcome, duration_ms) = match joined {
            Ok(joined) => joined,
            Err(e) => (
                Err(Error::Internal(format!("background action stopped: {}", e))),
                self.started.elapsed().as_millis() as u64,
            ),
        };
        let span = tracing::info_span!("action", name = %action.name(), kind = %action.kind());
        let _entered = span.enter();
        complete(action, outcome, duration_ms, cache)
    }
}

/// Turn an outcome into a result, writing its variables on success
fn complete(
    action: &Action,
    outcome: Result<ActionOutcome>,
    duration_ms: u64,
    cache: &mut VariableCache,
) -> TestResult {
    match outcome {
        Ok(outcome) => {
            cache.extend(outcome.variables);
            tracing::debug!(duration_ms, "action succeeded");
            TestResult {
                action: action.name().to_string(),
                description: action.description().to_string(),
                duration_ms,
                success: true,
                error: None,
                error_kind: None,
            }
        }
        Err(e) => {
            tracing::error!(duration_ms, kind = e.kind(), error = %e, "action failed");
            failed_result(action, duration_ms, &e)
        }
    }
}

fn failed_result(action: &Action, duration_ms: u64, error: &Error) -> TestResult {
    TestResult {
        action: action.name().to_string(),
        description: action.description().to_string(),
        duration_ms,
        success: false,
        error: Some(error.to_string()),
        error_kind: Some(error.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::action::{ActionDefinition, ActionKind, MetaOverride};
    use crate::common::Config;
    use crate::diagram::MermaidRecorder;
    use crate::proto::ReflectCodec;

    fn rest(name: &str, yaml: &str) -> Arc<Action> {
        let def = ActionDefinition::parse(ActionKind::Rest, serde_yaml::from_str(yaml).unwrap())
            .unwrap();
        let meta = MetaOverride {
            name: name.into(),
            ..Default::default()
        };
        Arc::new(Action::from_definition(meta, def).unwrap())
    }

    fn runner(recorder: Arc<MermaidRecorder>) -> ScenarioRunner {
        let services = Services::new(
            Arc::new(Config::default()),
            recorder,
            Arc::new(ReflectCodec::new()),
        )
        .unwrap();
        ScenarioRunner::new(services).quiet()
    }

    #[tokio::test]
    async fn test_fail_fast_skips_remaining_actions() {
        let recorder = Arc::new(MermaidRecorder::new(&Default::default()));
        let scenario = Scenario::new(
            "broken chain",
            None,
            vec![
                rest("first", "url: 'http://localhost/${missingId}'"),
                rest("second", "url: http://localhost/never"),
            ],
        );

        let report = runner(recorder.clone()).run(&scenario).await;

        assert_eq!(report.status, ScenarioStatus::Failed);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.results[0].action, "first");
        assert_eq!(report.results[0].error_kind, Some("EXPRESSION"));
        // Nothing went over the wire
        assert!(recorder.entries(&scenario.id).is_empty());
    }

    #[tokio::test]
    async fn test_empty_scenario_succeeds() {
        let recorder = Arc::new(MermaidRecorder::new(&Default::default()));
        let scenario = Scenario::new("nothing", None, Vec::new());
        let report = runner(recorder).run(&scenario).await;
        assert_eq!(report.status, ScenarioStatus::Succeeded);
        assert!(report.success());
    }

    #[test]
    fn test_failed_result_carries_kind() {
        let action = rest("a", "url: http://x");
        let err = Error::count_mismatch("t", 2, 1);
        let result = failed_result(&action, 12, &err);
        assert!(!result.success);
        assert_eq!(result.error_kind, Some("COUNT_MISMATCH"));
        assert!(result.error.unwrap().contains("1/2"));
    }
}
