//! Winbuild
//!
//! Builds a multi-arch Windows container image on ephemeral Compute Engine
//! workers, one worker per Windows Server version.
//!
//! Architecture:
//! - Configuration: Flags parsed once into an immutable config
//! - Adapter: Worker provisioning, transfer, execution and deletion
//! - Services: The per-version build state machine
//!
//! Every worker is deleted before the next version starts, and before the
//! process exits on failure.

mod adapter;
mod config;
mod error;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::adapter::{GcloudAdapter, WorkerAdapter};
use crate::config::{Cli, Config};
use crate::error::{BuildError, EXIT_BUILD_FAILED, EXIT_INVALID_CONFIG};
use crate::service::Orchestrator;
use winbuild_core::domain::run::RunReport;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "winbuild=info,winbuild_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Windows multi-arch container builder");

    let cli = Cli::parse();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };
    info!(
        "Loaded configuration: target={}, zone={}, workspace={}",
        config.target,
        config.zone,
        config.workspace_path.display()
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<BuildError>() {
                Some(build_error) => {
                    let version = build_error.version().unwrap_or("-");
                    error!("Build failed (version {}): {:#}", version, e);
                    ExitCode::from(build_error.exit_code())
                }
                None => {
                    error!("Build failed: {:#}", e);
                    ExitCode::from(EXIT_BUILD_FAILED)
                }
            }
        }
    }
}

/// Runs the build and logs the run report either way
async fn run(config: Config) -> Result<()> {
    adapter::check_gcloud_available().context("Cloud SDK check failed")?;

    let adapter: Arc<dyn WorkerAdapter> = Arc::new(GcloudAdapter::new(
        config.project.clone(),
        config.workspace_bucket.clone(),
    ));
    let orchestrator = Orchestrator::new(config, adapter);

    let mut report = RunReport::new(orchestrator.config().target.as_str());
    let result = orchestrator.run(&mut report).await;

    match serde_json::to_string(&report) {
        Ok(json) => info!("Run report: {}", json),
        Err(e) => error!("Failed to serialize run report: {}", e),
    }

    for failure in &report.teardown_failures {
        error!(
            "Instance {} ({}) may still be running: {}",
            failure.worker, failure.version, failure.message
        );
    }

    result.map_err(anyhow::Error::from)
}
