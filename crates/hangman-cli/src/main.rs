//! hangman - a parallel command executor which does not block.
//!
//! The first launch becomes the primary and keeps running; it owns the job
//! queue. Every later launch forwards its arguments, working directory and
//! environment to the primary, prints the reply, and exits.

mod cli;
mod controller;
mod logging;
mod table;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use hangman::{
    CoordinatorConfig, Envelope, ExecutionQueue, ExitHandle, PrimaryInstance, Role, elect,
    run_admitted,
};
use tokio::signal::unix::{SignalKind, signal};

use crate::controller::QueueController;

/// Exit code when the primary's own arguments do not parse.
const USAGE_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    let config = CoordinatorConfig::from_env().context("invalid configuration")?;
    let envelope = Envelope::current().context("failed to capture invocation")?;

    match elect(&config).await.context("failed to determine instance role")? {
        Role::Primary(primary) => run_primary(primary, envelope, &config).await,
        Role::Secondary(secondary) => {
            let reply = secondary
                .forward(&envelope)
                .await
                .with_context(|| format!("failed to reach primary at {}", secondary.address()))?;
            if let Some(reply) = reply
                && !reply.is_empty()
            {
                println!("{reply}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_primary(
    primary: PrimaryInstance,
    envelope: Envelope,
    config: &CoordinatorConfig,
) -> Result<ExitCode> {
    let cli = match cli::try_parse_invocation(&envelope.args) {
        Ok(cli) => cli,
        Err(e) => return Ok(ExitCode::from(report_parse_failure(&e))),
    };

    let (queue, admissions) = ExecutionQueue::new(config.max_parallel);
    let queue = Arc::new(queue);
    tokio::spawn(run_admitted(Arc::clone(&queue), admissions));

    let exit = primary.exit_handle();
    let controller = Arc::new(QueueController::new(queue, exit.clone()));
    println!("{}", controller.apply(cli, &envelope));

    tokio::spawn(watch_signals(exit));

    tracing::info!(address = %primary.address(), "Serving invocations");
    primary
        .run(controller)
        .await
        .context("primary did not shut down cleanly")?;
    Ok(ExitCode::SUCCESS)
}

/// Print a parse failure and pick the exit code. Help and version go to
/// stdout and are not failures.
fn report_parse_failure(e: &clap::Error) -> u8 {
    if let Err(print_err) = e.print() {
        tracing::debug!(error = %print_err, "Failed to print usage");
    }
    if e.use_stderr() { USAGE_ERROR } else { 0 }
}

/// Route SIGINT and SIGTERM to the exit handle.
async fn watch_signals(exit: ExitHandle) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => exit.request_exit(),
                _ = exit.exit_requested() => {}
            }
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, shutting down");
            exit.request_exit();
        }
        _ = terminate.recv() => {
            tracing::info!("Terminate received, shutting down");
            exit.request_exit();
        }
        _ = exit.exit_requested() => {}
    }
}
