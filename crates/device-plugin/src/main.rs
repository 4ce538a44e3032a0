use anyhow::Result;
use brgpu_device_plugin::cmd;
use brgpu_device_plugin::config::Cli;
use brgpu_device_plugin::config::Commands;
use clap::Parser;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => cmd::run_daemon(*daemon_args).await,
        Commands::Topo(topo_args) => cmd::run_topo(topo_args),
    }
}
