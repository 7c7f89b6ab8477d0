//! Wheelhouse control service binary.
//!
//! Serves the package management API for a cluster.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wheelhouse_control::{ControlConfig, ControlService};

/// Cluster-wide Python dependency control plane.
#[derive(Parser, Debug)]
#[command(name = "wheelhouse-control")]
#[command(about = "Manage Python requirements installed across cluster components")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    let filter = if cli.verbose {
        "wheelhouse_control=debug,tower_http=debug,hyper=info"
    } else {
        "wheelhouse_control=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    info!("wheelhouse control service starting");

    let config = match cli.config.as_deref() {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::load()?,
    };

    info!(
        listen_addr = %config.server.listen_addr,
        namespace = %config.cluster.namespace,
        config_map = %config.cluster.config_map,
        "configuration loaded"
    );

    ControlService::new(config).run().await?;
    Ok(())
}
