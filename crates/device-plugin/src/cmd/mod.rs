//! Command layer - entry points for the subcommands

pub mod daemon;
pub mod topo;

pub use daemon::run_daemon;
pub use topo::run_topo;
