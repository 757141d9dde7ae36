//! Loom - Command Line Entry Point

use std::process::ExitCode;

use loom_host::HostConfig;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<ExitCode> {
    let config = HostConfig::load(std::env::args().skip(1))?;

    // Initialize logging
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Loom...");

    let report = loom_host::run(&config)?;
    Ok(ExitCode::from(report.exit_code()))
}
