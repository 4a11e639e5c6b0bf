use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::prelude::*;

use ledger_rollup::{RollupConfig, RollupError, RollupPipeline, RunOutcome};

#[derive(Parser, Debug)]
#[command(name = "ledger-rollup")]
#[command(about = "Aggregate the sales ledger, merge with history and write the ranking report")]
struct Cli {
    /// Path to the TOML configuration
    #[arg(long, env = "LEDGER_ROLLUP_CONFIG", default_value = "rollup.toml")]
    config: PathBuf,

    #[command(subcommand)]
    step: Option<Step>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Step {
    /// Ledger → current-year aggregates
    Aggregate,
    /// Current aggregates + history → merged tables
    Merge,
    /// Merged tables → report workbook
    Export,
    /// All of the above
    Run,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_rollup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn execute(cli: &Cli) -> Result<RunOutcome, RollupError> {
    let config = RollupConfig::load(&cli.config)?;
    let pipeline = RollupPipeline::from_clock(config)?;

    match cli.step.unwrap_or(Step::Run) {
        Step::Aggregate => {
            pipeline.aggregate()?;
            Ok(RunOutcome::default())
        }
        Step::Merge => {
            let outcome = pipeline.merge()?;
            Ok(RunOutcome {
                report: Some(outcome.report),
            })
        }
        Step::Export => {
            pipeline.export()?;
            Ok(RunOutcome::default())
        }
        Step::Run => pipeline.run(),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match execute(&cli) {
        Ok(outcome) if outcome.passed() => ExitCode::SUCCESS,
        Ok(_) => {
            error!("completed, but verification failed; check the report before use");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "run aborted");
            ExitCode::FAILURE
        }
    }
}
