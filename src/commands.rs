//! CLI command definitions
//!
//! Defines the clap commands for the scenario CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run scenarios and report per-action results
    Run {
        /// Scenario files or directories of *.yaml / *.yml files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Number of scenarios run concurrently in one batch
        #[arg(long, short)]
        parallel: Option<usize>,

        /// Configuration file (default: platform config dir)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory sequence diagrams are written to
        #[arg(long, value_name = "DIR")]
        diagrams: Option<PathBuf>,

        /// Do not write sequence diagrams
        #[arg(long, conflicts_with = "diagrams")]
        no_diagrams: bool,
    },

    /// Load and validate scenarios without running them
    Check {
        /// Scenario files or directories of *.yaml / *.yml files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}
