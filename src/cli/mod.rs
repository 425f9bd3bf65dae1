//! CLI command handling
//!
//! Dispatches CLI commands and formats output.

use std::path::PathBuf;
use std::sync::Arc;

use colored::Colorize;

use crate::action::Services;
use crate::commands::Commands;
use crate::common::{Config, Result};
use crate::diagram::{DiagramRecorder, MermaidRecorder, NullRecorder};
use crate::loader;
use crate::proto::ReflectCodec;
use crate::scenario::{Orchestrator, ScenarioRunner};

/// Dispatch a CLI command; returns whether every scenario passed
pub async fn dispatch(command: Commands) -> Result<bool> {
    match command {
        Commands::Run {
            paths,
            parallel,
            config,
            diagrams,
            no_diagrams,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(parallel) = parallel {
                config.runner.parallelism = parallel.max(1);
            }
            if let Some(dir) = diagrams {
                config.diagrams.output_dir = dir;
            }
            if no_diagrams {
                config.diagrams.enabled = false;
            }
            run(&paths, config).await
        }

        Commands::Check { paths } => check(&paths),
    }
}

async fn run(paths: &[PathBuf], config: Config) -> Result<bool> {
    let scenarios = loader::load_paths(paths)?;
    tracing::info!(
        scenarios = scenarios.len(),
        parallelism = config.runner.parallelism,
        "loaded scenarios"
    );

    let recorder: Arc<dyn DiagramRecorder> = if config.diagrams.enabled {
        Arc::new(MermaidRecorder::new(&config.diagrams))
    } else {
        Arc::new(NullRecorder)
    };
    let parallelism = config.runner.parallelism;
    let services = Services::new(Arc::new(config), recorder, Arc::new(ReflectCodec::new()))?;

    let orchestrator = Orchestrator::new(ScenarioRunner::new(services), parallelism);
    let report = orchestrator.run(&scenarios).await;
    Ok(report.success())
}

fn check(paths: &[PathBuf]) -> Result<bool> {
    let scenarios = loader::load_paths(paths)?;
    let mut valid = true;

    for scenario in &scenarios {
        match loader::check_expressions(scenario) {
            Ok(()) => println!(
                "{} {} {}",
                "✓".green(),
                scenario.name.bold(),
                format!("({} actions)", scenario.actions.len()).dimmed()
            ),
            Err(e) => {
                valid = false;
                println!("{} {}: {}", "✗".red(), scenario.name.bold(), e);
            }
        }
        if let Some(description) = &scenario.description {
            println!("    {}", description.dimmed());
        }
        for action in &scenario.actions {
            println!("    {:<15} {}", action.kind().to_string(), action.describe());
        }
    }
    Ok(valid)
}
