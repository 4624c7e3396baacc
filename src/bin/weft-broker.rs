//! The broker device: a pub/sub fan-out every front-end publishes through.

use clap::Parser;
use tracing::{error, info};

use weft::broker::BrokerDevice;
use weft::cli::{CommonArgs, EXIT_CONFIG, EXIT_STARTUP, init_logging};
use weft::config::Config;

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

    let device = match BrokerDevice::bind(
        &config.message_broker.sub_address,
        &config.message_broker.pub_address,
    )
    .await
    {
        Ok(device) => device,
        Err(error) => {
            error!(%error, "cannot start broker device");
            std::process::exit(EXIT_STARTUP);
        }
    };
    info!(
        ingress = %device.sub_address(),
        egress = %device.pub_address(),
        "broker forwarding"
    );

    tokio::signal::ctrl_c().await?;
    info!("broker shutting down");
    Ok(())
}
