use clap::Parser;
use courier::clock::SystemClock;
use courier::dispatcher::FlushOutcome;
use courier::scheduler::SkipReason;
use courier::sources::ReplaySource;
use courier::{ServiceError, TrackingService};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;
mod input;
mod logging;
mod statsd;

use config::Config;
use input::FixLine;

#[derive(Parser)]
#[command(version, about = "Store-and-forward location tracker")]
enum CliCommand {
    /// Track fixes read as JSON lines from stdin, then flush on EOF
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// Send everything queued to every endpoint
    Flush {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print queue length and endpoint watermarks
    Status {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the configured log file, or empty it with --clear
    Logs {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        clear: bool,
    },
}

impl CliCommand {
    fn config_path(&self) -> &Path {
        match self {
            CliCommand::Run { config }
            | CliCommand::Flush { config }
            | CliCommand::Status { config }
            | CliCommand::Logs { config, .. } => config,
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("could not read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode status: {0}")]
    Json(#[from] serde_json::Error),
    #[error("flush failed for at least one endpoint")]
    FlushFailed,
    #[error("no log file is configured")]
    NoLogFile,
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let config = match Config::from_file(cli.config_path()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let _logging = logging::init(config.common.logging.as_ref());
    if let Some(metrics_config) = &config.common.metrics
        && let Err(err) = statsd::init(metrics_config)
    {
        tracing::warn!(error = %err, "metrics disabled");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "could not start runtime");
            return ExitCode::FAILURE;
        }
    };

    let log_file = config.common.logging.and_then(|logging| logging.log_file);
    let courier_config = config.courier;
    let result = runtime.block_on(async move {
        match cli {
            CliCommand::Run { .. } => run(&courier_config).await,
            CliCommand::Flush { .. } => flush(&courier_config).await,
            CliCommand::Status { .. } => status(&courier_config),
            CliCommand::Logs { clear, .. } => logs(log_file.as_deref(), clear),
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &courier::Config) -> Result<(), CliError> {
    let source = Arc::new(ReplaySource::new());
    let service = TrackingService::from_config(config, source.clone())?;
    service.start()?;

    let clock = SystemClock;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut accepted = 0usize;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping input");
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match FixLine::parse(line) {
            Ok(fix_line) => {
                let (fix, provenance) = fix_line.into_fix(&clock);
                source.observe(&fix);
                service.add_locations(vec![(fix, provenance)]).await?;
                accepted += 1;
            }
            Err(err) => tracing::warn!(error = %err, "skipping malformed fix"),
        }
    }

    tracing::info!(fixes = accepted, "input closed, sending remaining locations");
    service.settle().await?;
    let outcome = service.flush_now().await;
    service.shutdown().await;

    check_outcome(outcome)
}

async fn flush(config: &courier::Config) -> Result<(), CliError> {
    let service = TrackingService::from_config(config, Arc::new(ReplaySource::new()))?;
    let outcome = service.flush_now().await;
    service.shutdown().await;

    check_outcome(outcome)
}

/// Having no endpoints is not an error; a round that ran and failed is.
fn check_outcome(outcome: FlushOutcome) -> Result<(), CliError> {
    match outcome {
        FlushOutcome::Completed { success: true, .. } => Ok(()),
        FlushOutcome::Completed { reports, .. } => {
            for report in &reports {
                if let Err(err) = &report.result {
                    tracing::warn!(endpoint = %report.endpoint, error = %err, "endpoint did not acknowledge");
                }
            }
            Err(CliError::FlushFailed)
        }
        FlushOutcome::Skipped(SkipReason::NoEndpoints) => Ok(()),
        FlushOutcome::Skipped(_) => Err(CliError::FlushFailed),
    }
}

/// Reads persisted state only. Tracking left on by a `run` is not resumed.
fn status(config: &courier::Config) -> Result<(), CliError> {
    let service = TrackingService::inspect(config, Arc::new(ReplaySource::new()))?;
    let status = service.status();

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn logs(log_file: Option<&Path>, clear: bool) -> Result<(), CliError> {
    let path = log_file.ok_or(CliError::NoLogFile)?;
    if clear {
        logging::clear_log(path)?;
    } else {
        logging::print_log(path, &mut std::io::stdout().lock())?;
    }
    Ok(())
}
