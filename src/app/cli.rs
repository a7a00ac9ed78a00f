//! Command-line argument definitions (clap).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "sensorium")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live hardware sensor monitoring server", long_about = None)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "sensorium.conf")]
    pub config: PathBuf,

    /// Scan hwmon, print the discovered configuration as JSON, and exit
    #[arg(long)]
    pub scan: bool,

    /// Log filter (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}
