//! Open Peer Power server
//!
//! Main entry point: loads the configuration, runs the core until it is
//! stopped and exits with the core's exit code.

use anyhow::{Context as _, Result};
use opp_config::CoreConfig;
use opp_server::{CoreOptions, OpenPeerPower};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Config directory used when none is given
const DEFAULT_CONFIG_DIR: &str = "config";

fn config_dir() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("OPP_CONFIG_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_dir = config_dir();
    info!("Config directory: {}", config_dir.display());

    let core = CoreConfig::load(&config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    let opp = OpenPeerPower::new(core, CoreOptions::default());
    if !opp.config.load().await? {
        info!("No stored core config, using configuration.yaml values");
    }

    let signal_opp = opp.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down...");
                signal_opp.stop(0).await;
            }
            Err(err) => warn!("Unable to listen for shutdown signal: {}", err),
        }
    });

    let exit_code = opp.run().await?;
    info!("Open Peer Power exited with code {}", exit_code);
    std::process::exit(exit_code);
}
