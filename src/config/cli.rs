//! Configuration sourced from the CLI.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "A credential-brokering reverse proxy for geospatial web services")]
pub struct Cli {
    /// Path to the configuration file, in TOML format
    #[arg(long, default_value = "./geoproxy.toml")]
    pub config: PathBuf,

    /// Validate configuration and exit without starting the server
    #[arg(long)]
    pub validate_configs: bool,

    /// Override every `server.listen` address from the config file
    #[arg(long)]
    pub listen: Option<String>,

    /// Number of threads used in the worker pool for the proxy service
    #[arg(long)]
    pub threads_per_service: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
