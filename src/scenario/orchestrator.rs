//! Batched execution of many scenarios

use colored::Colorize;
use futures_util::future::join_all;

use super::{Scenario, ScenarioReport, ScenarioRunner};

/// Results of one orchestrated run, in input order
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    /// No scenario contains a failed result
    pub fn success(&self) -> bool {
        self.scenarios.iter().all(ScenarioReport::success)
    }

    pub fn failed(&self) -> usize {
        self.scenarios.iter().filter(|s| !s.success()).count()
    }

    /// Per-scenario summary: every action with its duration and outcome
    pub fn print_summary(&self) {
        println!("\n{}", "Summary".bold());
        for scenario in &self.scenarios {
            let header = if scenario.success() {
                format!("✓ {}", scenario.name).green().bold()
            } else {
                format!("✗ {}", scenario.name).red().bold()
            };
            println!("{} {}", header, format!("({} ms)", scenario.duration_ms()).dimmed());

            for result in &scenario.results {
                let outcome = if result.success {
                    "pass".green()
                } else {
                    "FAIL".red()
                };
                println!(
                    "    {:<4} {:>7} ms  {}",
                    outcome, result.duration_ms, result.action
                );
            }
            if scenario.skipped > 0 {
                println!("    {}", format!("{} action(s) skipped", scenario.skipped).yellow());
            }
        }

        let total = self.scenarios.len();
        let failed = self.failed();
        let line = format!("{} scenario(s), {} passed, {} failed", total, total - failed, failed);
        if failed == 0 {
            println!("\n{}", line.green().bold());
        } else {
            println!("\n{}", line.red().bold());
        }
    }
}

/// Runs scenarios in fixed-size batches; a batch finishes completely
/// before the next one starts
pub struct Orchestrator {
    runner: ScenarioRunner,
    parallelism: usize,
    print_summary: bool,
}

impl Orchestrator {
    pub fn new(runner: ScenarioRunner, parallelism: usize) -> Self {
        Self {
            runner,
            parallelism: parallelism.max(1),
            print_summary: true,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.print_summary = false;
        self
    }

    pub async fn run(&self, scenarios: &[Scenario]) -> RunReport {
        let mut report = RunReport::default();

        for (index, batch) in scenarios.chunks(self.parallelism).enumerate() {
            tracing::info!(batch = index + 1, size = batch.len(), "starting batch");
            let results = join_all(batch.iter().map(|scenario| self.runner.run(scenario))).await;
            report.scenarios.extend(results);
        }

        if self.print_summary {
            report.print_summary();
        }
        self.finalize(&report).await;
        report
    }

    /// Write every scenario's diagram concurrently; failures are logged only
    async fn finalize(&self, report: &RunReport) {
        let diagram = &self.runner.services().diagram;
        let written = join_all(
            report
                .scenarios
                .iter()
                .map(|scenario| async move { (scenario, diagram.finalize(&scenario.id).await) }),
        )
        .await;

        for (scenario, result) in written {
            if let Err(e) = result {
                tracing::warn!(scenario = %scenario.name, error = %e, "failed to write diagram");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::action::{Action, ActionDefinition, ActionKind, MetaOverride, Services};
    use crate::common::config::DiagramConfig;
    use crate::common::Config;
    use crate::diagram::MermaidRecorder;
    use crate::proto::ReflectCodec;
    use crate::scenario::ScenarioStatus;

    fn failing_scenario(name: &str) -> Scenario {
        let def = ActionDefinition::parse(
            ActionKind::Rest,
            serde_yaml::from_str("url: 'http://localhost/${nope}'").unwrap(),
        )
        .unwrap();
        let action = Action::from_definition(
            MetaOverride {
                name: "call".into(),
                ..Default::default()
            },
            def,
        )
        .unwrap();
        Scenario::new(name, None, vec![Arc::new(action)])
    }

    #[tokio::test]
    async fn test_reports_in_input_order_and_writes_diagrams() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(MermaidRecorder::new(&DiagramConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        }));
        let services = Services::new(
            Arc::new(Config::default()),
            recorder.clone(),
            Arc::new(ReflectCodec::new()),
        )
        .unwrap();
        let orchestrator = Orchestrator::new(ScenarioRunner::new(services).quiet(), 2).quiet();

        let scenarios = vec![
            Scenario::new("one", None, Vec::new()),
            failing_scenario("two"),
            Scenario::new("three", None, Vec::new()),
        ];
        let report = orchestrator.run(&scenarios).await;

        let names: Vec<_> = report.scenarios.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["one", "two", "three"]);
        assert_eq!(report.scenarios[1].status, ScenarioStatus::Failed);
        assert!(!report.success());
        assert_eq!(report.failed(), 1);
        for id in ["one", "two", "three"] {
            assert!(recorder.path_for(id).exists());
        }
    }

    #[test]
    fn test_empty_run_succeeds() {
        assert!(RunReport::default().success());
    }

    #[test]
    fn test_zero_parallelism_clamped() {
        let services = Services::new(
            Arc::new(Config::default()),
            Arc::new(crate::diagram::NullRecorder),
            Arc::new(ReflectCodec::new()),
        )
        .unwrap();
        let orchestrator = Orchestrator::new(ScenarioRunner::new(services), 0);
        assert_eq!(orchestrator.parallelism, 1);
    }
}
