//! CLI argument structs and logging setup shared by every process.
//!
//! The infrastructure binaries (`weft-broker`, `weft-registry`) use
//! [`CommonArgs`] directly; application front-end and location programs
//! embed [`FrontendArgs`] / [`LocationArgs`] with `#[command(flatten)]`.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 startup failure.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Process exit code for configuration errors.
pub const EXIT_CONFIG: i32 = 1;
/// Process exit code for startup failures (port in use, registry
/// unreachable).
pub const EXIT_STARTUP: i32 = 2;

/// Flags every weft process takes.
#[derive(Debug, Parser)]
pub struct CommonArgs {
    /// Path to the YAML config file.
    #[arg(short = 'c', long)]
    pub config: PathBuf,

    /// Log at debug level.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Log to a file instead of stderr.
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

/// Flags of a front-end process.
#[derive(Debug, Parser)]
pub struct FrontendArgs {
    /// Shared flags.
    #[command(flatten)]
    pub common: CommonArgs,

    /// Client port to listen on.
    #[arg(short = 'p', long)]
    pub port: u16,

    /// Maximum number of simultaneous client connections.
    #[arg(long = "max-conn")]
    pub max_conn: usize,
}

/// Flags of a location process.
#[derive(Debug, Parser)]
pub struct LocationArgs {
    /// Shared flags.
    #[command(flatten)]
    pub common: CommonArgs,

    /// Address to bind the location's pub endpoint at.
    #[arg(long = "pub-address")]
    pub pub_address: String,

    /// Address to bind the location's pull endpoint at.
    #[arg(long = "pull-address")]
    pub pull_address: String,

    /// Ident of the location this process will own.
    #[arg(long)]
    pub ident: String,
}

/// Installs the global tracing subscriber.
///
/// Stderr output is ANSI-colored; `--log-file` switches to a plain file
/// writer. `RUST_LOG` overrides the level chosen by `--debug`.
pub fn init_logging(debug: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
