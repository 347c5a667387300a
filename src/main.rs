//! Headless entry point for scope_daq
//!
//! Starts a session against the simulated microscope, optionally loads a
//! position list from an earlier session folder, runs one acquisition and
//! prints the final session status as JSON.
//!
//! # Usage
//!
//! ```bash
//! scope_daq --acquires 3 --delay-s 2
//! scope_daq --positions-from ./2024-03-01_10-12-44_scope_session --loop-positions
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scope_daq::config::ScopeConfig;
use scope_daq::hardware::mock::MockMicroscope;
use scope_daq::session::RunOptions;
use scope_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use scope_daq::{spawn_session, SessionRequest};
use tracing::info;

#[derive(Parser)]
#[command(name = "scope_daq")]
#[command(about = "Headless acquisition session against a simulated microscope", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session folder whose position logs are loaded before the run
    #[arg(long)]
    positions_from: Option<PathBuf>,

    /// Number of acquisitions
    #[arg(long, default_value_t = 1)]
    acquires: u32,

    /// Delay between acquisitions in seconds
    #[arg(long, default_value_t = 0.0)]
    delay_s: f64,

    /// Visit every position-list entry each iteration
    #[arg(long)]
    loop_positions: bool,

    /// Free-text label appended to the run folder
    #[arg(long, default_value = "")]
    label: String,

    /// Log output format: pretty, compact or json
    #[arg(long, default_value = "compact")]
    log_format: OutputFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ScopeConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    let microscope = Arc::new(MockMicroscope::new());
    let (session, task) = spawn_session(config, microscope)
        .await
        .context("starting session")?;

    if let Some(folder) = cli.positions_from {
        session
            .request(SessionRequest::LoadPositions { folder })
            .await
            .context("loading position list")?;
    }

    let options = RunOptions {
        acquire_number: cli.acquires,
        delay_s: cli.delay_s,
        loop_over_position_list: cli.loop_positions,
        label: cli.label,
        ..RunOptions::default()
    };
    session
        .request(SessionRequest::SetRunOptions(options))
        .await?;

    let mut modes = session.subscribe_mode().await?;
    session.start_acquire().await.context("starting acquisition")?;
    info!("acquisition started");
    modes
        .wait_for(|state| !state.mode.is_run())
        .await
        .context("session stopped during the run")?;

    let status = session.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    session.shutdown().await?;
    task.await?;
    Ok(())
}
