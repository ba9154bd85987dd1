//! # Virtumancer Daemon
//!
//! Mediates between the web UI and a fleet of libvirt hosts: unified
//! host/VM inventory, lifecycle commands, live statistics streaming and
//! graphical console tunneling over WebSockets.
//!
//! ## Usage
//! ```bash
//! virtumancer-server --config /etc/virtumancer/config.yaml
//! ```

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use virtumancer_server::cli::Args;
use virtumancer_server::config::Config;
use virtumancer_server::server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    virtumancer_common::init_logging(&args.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Virtumancer daemon"
    );

    let config = match Config::load(&args.config) {
        Ok(config) => {
            info!(config_path = %args.config, "Configuration loaded");
            config
        }
        Err(_) if args.config == "/etc/virtumancer/config.yaml" => {
            info!("No config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            error!(error = %e, path = %args.config, "Failed to load configuration");
            return Err(e);
        }
    };

    let config = config.with_cli_overrides(&args);

    info!(
        listen = %config.server.listen_address,
        database = %config.database.path,
        backend = ?config.hypervisor.backend,
        "Daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
