use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node device agent
    Daemon(Box<DaemonArgs>),
}
