//! `crowdsky-worker` -- stacking agent daemon.
//!
//! Claims stacking jobs from the CrowdSky coordinator, runs up to
//! `MAX_WORKERS` of them concurrently and reports each outcome. See
//! [`crowdsky_worker::config`] for the environment variables it reads.
//!
//! Exit codes: `0` job processed or clean shutdown, `1` no job available
//! (`--once` only), `2` fatal startup error or unusable scratch root.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crowdsky_cloud::WebDavStorage;
use crowdsky_worker::config::WorkerConfig;
use crowdsky_worker::coordinator::{Coordinator, CoordinatorClient};
use crowdsky_worker::dispatcher::{DispatchError, DispatchSettings, Dispatcher};
use crowdsky_worker::executor::JobRunner;
use crowdsky_worker::preview::{CommandPreview, PREVIEW_TIMEOUT};
use crowdsky_worker::stacker::CommandStacker;
use crowdsky_worker::workspace;

const EXIT_NO_JOB: u8 = 1;
const EXIT_STARTUP: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "crowdsky-worker", version, about = "CrowdSky stacking worker")]
struct Cli {
    /// Claim and process at most one job, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crowdsky_worker=info,crowdsky_cloud=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    if let Err(e) = workspace::check_scratch_root(&config.work_dir) {
        tracing::error!(error = %e, "Scratch root check failed");
        return ExitCode::from(EXIT_STARTUP);
    }

    tracing::info!(
        worker_id = %config.worker_id,
        api_base_url = %config.api_base_url,
        max_workers = config.max_workers,
        work_dir = %config.work_dir.display(),
        preview = config.preview_command.is_some(),
        "Starting crowdsky-worker",
    );

    let coordinator: Arc<dyn Coordinator> = Arc::new(CoordinatorClient::new(
        &config.api_base_url,
        &config.api_key,
        &config.worker_id,
    ));
    let storage = Arc::new(WebDavStorage::new(&config.webdav_url, &config.share_token));
    let stacker = Arc::new(CommandStacker::new(
        config.stack_command.clone(),
        config.stack_timeout,
    ));

    let mut runner = JobRunner::new(
        Arc::clone(&coordinator),
        storage,
        stacker,
        config.work_dir.clone(),
        config.base_path.clone(),
    );
    if let Some(command) = config.preview_command.clone() {
        runner = runner.with_preview(Arc::new(CommandPreview::new(command, PREVIEW_TIMEOUT)));
    }

    let dispatcher = Dispatcher::new(
        coordinator,
        Arc::new(runner),
        DispatchSettings::from(&config),
    );

    if cli.once {
        return match dispatcher.run_once().await {
            Ok(Some(disposition)) => {
                tracing::info!(
                    job_id = disposition.job_id(),
                    completed = disposition.is_completed(),
                    "Single job finished",
                );
                ExitCode::SUCCESS
            }
            Ok(None) => ExitCode::from(EXIT_NO_JOB),
            Err(DispatchError::Claim(e)) => {
                tracing::error!(error = %e, "Failed to claim job");
                ExitCode::from(EXIT_NO_JOB)
            }
            Err(DispatchError::Scratch(e)) => {
                tracing::error!(error = %e, "Scratch root check failed");
                ExitCode::from(EXIT_STARTUP)
            }
        };
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let stats = dispatcher.run(shutdown).await;
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        abandoned = stats.abandoned,
        "crowdsky-worker stopped",
    );
    ExitCode::SUCCESS
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
