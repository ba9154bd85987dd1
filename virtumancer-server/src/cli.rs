//! Command-line argument parsing.

use clap::Parser;

/// Virtumancer - multi-hypervisor management service
#[derive(Parser, Debug)]
#[command(name = "virtumancer-server")]
#[command(about = "Virtumancer - multi-hypervisor management service")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/virtumancer/config.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Listen address for the HTTPS server
    #[arg(long)]
    pub listen: Option<String>,

    /// Path to the cache database file
    #[arg(long)]
    pub database: Option<String>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}
