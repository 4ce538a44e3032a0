use anyhow::Result;
use utils::logging;
use utils::version;

use crate::config::DaemonArgs;
use crate::config::PluginConfig;
use crate::manager::Manager;

pub async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.log_path.as_deref())?;

    tracing::info!("Starting brgpu device plugin {}", &**version::VERSION);

    let config = PluginConfig::from(&daemon_args);
    Manager::from_config(config)?.run().await
}
