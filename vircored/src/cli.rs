//! Command-line argument parsing.

use clap::{Parser, Subcommand};

/// vircored - host-local hypervisor management daemon
#[derive(Parser, Debug)]
#[command(name = "vircored")]
#[command(about = "vircored - host-local hypervisor management daemon")]
#[command(version)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/vircore/vircored.yaml")]
    pub config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON instead of colorized console output
    #[arg(long)]
    pub json_logs: bool,

    /// Run unprivileged, under the per-user state directory
    #[arg(long)]
    pub session: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Debug subcommands for exercising the driver context without a real
/// connection layer (§10.4).
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List every VM known to the registry.
    List,
    /// Print detailed status for one VM.
    Vm {
        /// VM name.
        name: String,
    },
}
