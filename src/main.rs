//! Scenario CLI - declarative integration tests over HTTP, MQTT and WebSocket
//!
//! Runs YAML-defined scenarios against live services and exits non-zero
//! if any scenario fails.

use clap::Parser;
use scenario::commands::Commands;
use scenario::{cli, common};

#[derive(Parser)]
#[command(name = "scenario", about = "Declarative integration-test scenarios")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging for this crate
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Also write logs to the platform log directory
    #[arg(long, global = true)]
    log_file: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _guard = common::logging::init_cli(cli.verbose, cli.log_file);

    match cli::dispatch(cli.command).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
