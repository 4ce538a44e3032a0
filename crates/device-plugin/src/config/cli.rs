use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::daemon::TopoArgs;

#[derive(Parser)]
#[command(about = "Biren GPU device plugin", long_about = None, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(Box<DaemonArgs>),
    /// Print discovered devices and their interconnect topology
    Topo(TopoArgs),
}
