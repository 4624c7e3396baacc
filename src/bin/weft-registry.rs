//! The location registry: the directory of live location processes.

use clap::Parser;
use tracing::{error, info};

use weft::cli::{CommonArgs, EXIT_CONFIG, EXIT_STARTUP, init_logging};
use weft::config::Config;
use weft::locations::LocationRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CommonArgs::parse();
    init_logging(args.debug, args.log_file.as_deref())?;

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let registry = match LocationRegistry::bind(&config.location_manager).await {
        Ok(registry) => registry,
        Err(error) => {
            error!(%error, "cannot start location registry");
            std::process::exit(EXIT_STARTUP);
        }
    };
    info!(rep = %registry.rep_address(), "location registry serving");

    tokio::signal::ctrl_c().await?;
    info!("location registry shutting down");
    Ok(())
}
