use std::sync::Arc;

use clap::Parser;
use cli::{Args, Commands};
use fetchtastic_core::{config::Config, orchestrator::Orchestrator};
use indicatif::MultiProgress;
use logging::setup_logging;
use tracing::{error, info};

mod cli;
mod logging;
mod progress;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logging(&args);

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Configuration error: {err}");
            std::process::exit(2);
        }
    };

    match args.command {
        Commands::Download { force_refresh } => {
            run_download(config, force_refresh).await;
        }
        Commands::Clean => {
            run_clean(config);
        }
    }
}

async fn run_download(config: Config, force_refresh: bool) {
    let multi = Arc::new(MultiProgress::new());
    let mut orchestrator = match Orchestrator::new(config, None) {
        Ok(orchestrator) => orchestrator
            .with_force_refresh(force_refresh)
            .with_progress(progress::progress_callback(multi)),
        Err(err) => {
            error!("Could not initialize pipeline: {err}");
            std::process::exit(1);
        }
    };

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling in-flight downloads...");
            cancel.cancel();
        }
    });

    match orchestrator.run().await {
        Ok(summary) => {
            if summary.failed > 0 {
                info!(
                    "Run finished with {} failures; see log above",
                    summary.failed
                );
            }
            // Per-file failures do not fail the process.
            std::process::exit(0);
        }
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}

fn run_clean(config: Config) {
    let orchestrator = match Orchestrator::new(config, None) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!("Could not initialize pipeline: {err}");
            std::process::exit(1);
        }
    };

    let summary = orchestrator.clean_repository();
    info!(
        "Removed {} files and {} directories",
        summary.removed_files, summary.removed_dirs
    );
    std::process::exit(if summary.success { 0 } else { 1 });
}
