use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::{DaemonArgs, PrintConfigArgs};

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the governor daemon
    Daemon(Box<DaemonArgs>),
    /// Print the effective configuration as YAML
    #[command(name = "print-config")]
    PrintConfig(PrintConfigArgs),
}
