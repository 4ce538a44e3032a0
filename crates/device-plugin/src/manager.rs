//! Process-level orchestration.
//!
//! The manager picks the discovery strategy for the configured runtime,
//! writes the CDI descriptor, serves one device plugin per pool and owns the
//! single stop channel. Termination signals, heartbeat loss and plugin
//! failures all funnel into that channel; the first reason received ends
//! the process.

use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::cdi::DescriptorGenerator;
use crate::config::ContainerRuntime;
use crate::config::PluginConfig;
use crate::discovery::DeviceDiscovery;
use crate::discovery::PartitionDiscovery;
use crate::discovery::SriovDiscovery;
use crate::k8s::device_plugin::KUBELET_SOCKET;
use crate::k8s::BrgpuDevicePlugin;
use crate::k8s::Lister;
use crate::mounts::DriverMounts;
use crate::platform::Brml;
use crate::platform::DeviceLibrary;
use crate::platform::PciDeviceTree;
use crate::topology::ExactAllocator;

/// Why the process is going down.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum StopReason {
    #[display("received {_0}")]
    Signal(&'static str),
    #[display("device heartbeat lost: {_0}")]
    HeartbeatLost(String),
    #[display("device plugin failed: {_0}")]
    PluginFailed(String),
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        !matches!(self, StopReason::Signal(_))
    }
}

/// Sender side of the process-wide stop channel.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::UnboundedSender<StopReason>,
}

impl StopHandle {
    pub fn stop(&self, reason: StopReason) {
        if self.tx.send(reason).is_err() {
            warn!("stop requested after the manager finished");
        }
    }
}

pub struct Manager {
    config: PluginConfig,
    discovery: Arc<dyn DeviceDiscovery>,
    library: Option<Arc<dyn DeviceLibrary>>,
    mounts: DriverMounts,
    stop_handle: StopHandle,
    stop_rx: mpsc::UnboundedReceiver<StopReason>,
    cancellation_token: CancellationToken,
}

impl Manager {
    pub fn new(
        config: PluginConfig,
        discovery: Arc<dyn DeviceDiscovery>,
        library: Option<Arc<dyn DeviceLibrary>>,
        mounts: DriverMounts,
    ) -> Self {
        let (tx, stop_rx) = mpsc::unbounded_channel();
        Self {
            config,
            discovery,
            library,
            mounts,
            stop_handle: StopHandle { tx },
            stop_rx,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Wires the production backend for the configured runtime.
    pub fn from_config(config: PluginConfig) -> Result<Self> {
        info!("Container runtime: {}", config.container_runtime);
        let pci_tree = PciDeviceTree::new(&config.sysfs_pci_path);
        match config.container_runtime {
            ContainerRuntime::Runc => {
                let library: Arc<dyn DeviceLibrary> = Arc::new(
                    Brml::load().map_err(|e| anyhow::anyhow!("brml init failed: {e:?}"))?,
                );
                let version = library
                    .library_version()
                    .inspect_err(|e| warn!("failed to query brml version: {e:?}"))
                    .ok();
                let discovery = Arc::new(PartitionDiscovery::new(
                    library.clone(),
                    &config.device_dir,
                    pci_tree,
                    &config.sysfs_class_path,
                ));
                Ok(Self::new(
                    config,
                    discovery,
                    Some(library),
                    DriverMounts::new(version),
                ))
            }
            ContainerRuntime::Kata => Ok(Self::new(
                config,
                Arc::new(SriovDiscovery::new(pci_tree)),
                None,
                DriverMounts::new(None),
            )),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Runs until the first stop reason arrives.
    ///
    /// Returns `Ok` for a termination signal and an error for anything else.
    pub async fn run(mut self) -> Result<()> {
        let mode = self.discovery.mode();
        let inventory = self
            .discovery
            .discover()
            .map_err(|e| anyhow::anyhow!("{mode} device discovery failed: {e:?}"))?;
        info!("discovered {} devices in {mode} mode", inventory.len());

        DescriptorGenerator::new(self.config.descriptor_settings(), self.mounts.clone())
            .generate(self.discovery.as_ref())
            .map_err(|e| anyhow::anyhow!("generate cdi config failed: {e:?}"))?;

        let lister = Lister::new(
            inventory,
            self.discovery.clone(),
            Arc::new(ExactAllocator),
            self.mounts.clone(),
            self.config.allocate_settings(),
        );
        let plugins = lister.plugins();
        if plugins.is_empty() {
            warn!("no resource pool to announce");
        }

        let plugin_dir = self.config.device_plugin_path.clone();
        let servers = self.cancellation_token.child_token();
        let started = async {
            // installed before the first registration
            let kubelet_watch = watch_kubelet_socket(&plugin_dir)?;
            start_plugins(&plugins, &plugin_dir, &servers).await?;
            if self.config.container_runtime == ContainerRuntime::Runc {
                if let (Some(pulse), Some(library)) = (self.config.pulse, self.library.clone()) {
                    self.spawn_heartbeat(library, pulse)?;
                }
            }
            self.spawn_kubelet_watcher(kubelet_watch, plugins, plugin_dir, servers);
            self.spawn_signal_handler()
        }
        .await;
        if let Err(e) = started {
            self.cancellation_token.cancel();
            return Err(e);
        }

        let reason = self
            .stop_rx
            .recv()
            .await
            .unwrap_or(StopReason::PluginFailed("stop channel closed".to_string()));
        self.cancellation_token.cancel();

        if reason.is_failure() {
            error!("shutting down: {reason}");
            Err(anyhow::anyhow!("{reason}"))
        } else {
            info!("shutting down: {reason}");
            Ok(())
        }
    }

    /// Polls the device count; an error or fewer devices than at startup
    /// stops the process.
    fn spawn_heartbeat(&self, library: Arc<dyn DeviceLibrary>, pulse: Duration) -> Result<()> {
        let expected = library
            .device_count()
            .map_err(|e| anyhow::anyhow!("can't find device from host: {e:?}"))?;
        let stop = self.stop_handle();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pulse);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match library.device_count() {
                    Ok(count) if count >= expected => {}
                    Ok(count) => {
                        stop.stop(StopReason::HeartbeatLost(format!(
                            "{count} of {expected} devices visible"
                        )));
                        break;
                    }
                    Err(e) => {
                        error!("Can't find device from host: {e:?}");
                        stop.stop(StopReason::HeartbeatLost("device count query failed".to_string()));
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Restarts and re-registers every plugin when kubelet recreates its
    /// socket.
    fn spawn_kubelet_watcher(
        &self,
        (watcher, mut restarts): KubeletWatch,
        plugins: Vec<Arc<BrgpuDevicePlugin>>,
        plugin_dir: PathBuf,
        mut servers: CancellationToken,
    ) {
        let stop = self.stop_handle();
        let root = self.cancellation_token.clone();

        tokio::spawn(async move {
            // dropping the watcher ends the notifications
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = root.cancelled() => break,
                    restart = restarts.recv() => {
                        if restart.is_none() {
                            break;
                        }
                    }
                }
                info!("kubelet socket recreated, restarting device plugins");
                servers.cancel();
                servers = root.child_token();
                if let Err(e) = start_plugins(&plugins, &plugin_dir, &servers).await {
                    stop.stop(StopReason::PluginFailed(format!("{e:#}")));
                    break;
                }
            }
        });
    }

    fn spawn_signal_handler(&self) -> Result<()> {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let stop = self.stop_handle();

        tokio::spawn(async move {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            info!("Get the signal {name}");
            stop.stop(StopReason::Signal(name));
        });
        Ok(())
    }
}

async fn start_plugins(
    plugins: &[Arc<BrgpuDevicePlugin>],
    plugin_dir: &Path,
    token: &CancellationToken,
) -> Result<()> {
    let kubelet_socket = plugin_dir.join(KUBELET_SOCKET);
    for plugin in plugins {
        plugin
            .start(&plugin_dir.join(plugin.endpoint()), token.clone())
            .await
            .with_context(|| format!("start server for {}", plugin.resource_name()))?;
        plugin
            .register_with_kubelet(&kubelet_socket)
            .await
            .with_context(|| format!("register {}", plugin.resource_name()))?;
    }
    Ok(())
}

type KubeletWatch = (RecommendedWatcher, mpsc::UnboundedReceiver<()>);

/// Notifies once per creation of `kubelet.sock` inside `plugin_dir`.
fn watch_kubelet_socket(plugin_dir: &Path) -> Result<KubeletWatch> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let kubelet = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(OsStr::new(KUBELET_SOCKET)));
                if kubelet && matches!(event.kind, EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
            Err(e) => error!("device plugin directory watch error: {e:?}"),
        },
        Config::default(),
    )?;
    watcher.watch(plugin_dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixListener;
    use tonic::Request;
    use tonic::Response;

    use super::*;
    use crate::k8s::device_plugin::api::registration_server::Registration;
    use crate::k8s::device_plugin::api::registration_server::RegistrationServer;
    use crate::k8s::device_plugin::api::Empty;
    use crate::k8s::device_plugin::api::RegisterRequest;
    use crate::platform::mock::FakeLibrary;

    const WAIT: Duration = Duration::from_secs(10);

    struct FakeKubelet {
        requests: mpsc::UnboundedSender<RegisterRequest>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> tonic::Result<Response<Empty>> {
            let _ = self.requests.send(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    fn serve_kubelet(
        dir: &Path,
        requests: mpsc::UnboundedSender<RegisterRequest>,
    ) -> CancellationToken {
        let socket = dir.join(KUBELET_SOCKET);
        let _ = std::fs::remove_file(&socket);
        let listener = UnixListener::bind(&socket).unwrap();
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(FakeKubelet { requests }))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown.cancelled_owned(),
                )
                .await
        });
        token
    }

    struct Host {
        dir: tempfile::TempDir,
        library: Arc<FakeLibrary>,
    }

    impl Host {
        fn new(library: FakeLibrary) -> Self {
            let dir = tempfile::tempdir().unwrap();
            for sub in ["plugins", "class", "pci"] {
                std::fs::create_dir_all(dir.path().join(sub)).unwrap();
            }
            Self {
                dir,
                library: Arc::new(library),
            }
        }

        fn plugin_dir(&self) -> PathBuf {
            self.dir.path().join("plugins")
        }

        fn manager(&self, pulse: Option<Duration>) -> Manager {
            let config = PluginConfig {
                pulse,
                device_plugin_path: self.plugin_dir(),
                cdi_config_path: self.dir.path().join("cdi/biren.yaml"),
                sysfs_pci_path: self.dir.path().join("pci"),
                sysfs_class_path: self.dir.path().join("class"),
                ..Default::default()
            };
            let library: Arc<dyn DeviceLibrary> = self.library.clone();
            let discovery = Arc::new(PartitionDiscovery::new(
                library.clone(),
                &config.device_dir,
                PciDeviceTree::new(&config.sysfs_pci_path),
                &config.sysfs_class_path,
            ));
            Manager::new(config, discovery, Some(library), DriverMounts::new(None))
        }
    }

    #[test_log::test(tokio::test)]
    async fn registers_every_pool_and_stops_cleanly() {
        let host = Host::new(FakeLibrary::new().with_card(1).with_card(2));
        let (tx, mut registrations) = mpsc::unbounded_channel();
        let kubelet = serve_kubelet(&host.plugin_dir(), tx);

        let manager = host.manager(None);
        let stop = manager.stop_handle();
        let running = tokio::spawn(manager.run());

        let mut names = Vec::new();
        for _ in 0..2 {
            let request = tokio::time::timeout(WAIT, registrations.recv())
                .await
                .unwrap()
                .unwrap();
            names.push(request.resource_name);
        }
        names.sort();
        assert_eq!(names, ["birentech.com/1-2-gpu", "birentech.com/gpu"]);
        assert!(host.plugin_dir().join("birentech.com_gpu.sock").exists());

        stop.stop(StopReason::Signal("SIGTERM"));
        let result = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
        assert!(result.is_ok());
        kubelet.cancel();
    }

    #[tokio::test]
    async fn lost_device_fails_the_process() {
        let host = Host::new(
            FakeLibrary::new()
                .with_card(1)
                .with_card(1)
                .with_adjustable_count(),
        );
        let (tx, mut registrations) = mpsc::unbounded_channel();
        let kubelet = serve_kubelet(&host.plugin_dir(), tx);

        let manager = host.manager(Some(Duration::from_millis(20)));
        let running = tokio::spawn(manager.run());
        tokio::time::timeout(WAIT, registrations.recv())
            .await
            .unwrap()
            .unwrap();

        host.library.set_visible_count(1);
        let result = tokio::time::timeout(WAIT, running).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("1 of 2 devices visible"));
        kubelet.cancel();
    }

    #[tokio::test]
    async fn kubelet_restart_triggers_reregistration() {
        let host = Host::new(FakeLibrary::new().with_card(1));
        let (tx, mut registrations) = mpsc::unbounded_channel();
        let first = serve_kubelet(&host.plugin_dir(), tx.clone());

        let manager = host.manager(None);
        let stop = manager.stop_handle();
        let running = tokio::spawn(manager.run());
        tokio::time::timeout(WAIT, registrations.recv())
            .await
            .unwrap()
            .unwrap();

        first.cancel();
        let second = serve_kubelet(&host.plugin_dir(), tx);
        let again = tokio::time::timeout(WAIT, registrations.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.resource_name, "birentech.com/gpu");

        stop.stop(StopReason::Signal("SIGINT"));
        tokio::time::timeout(WAIT, running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        second.cancel();
    }

    #[tokio::test]
    async fn discovery_failure_aborts_startup() {
        let host = Host::new(FakeLibrary::new().with_card(1).failing_at(0));
        let err = host.manager(None).run().await.unwrap_err();
        assert!(err.to_string().contains("partition device discovery failed"));
    }

    #[tokio::test]
    async fn missing_kubelet_fails_startup() {
        let host = Host::new(FakeLibrary::new().with_card(1));
        let err = host.manager(None).run().await.unwrap_err();
        assert!(format!("{err:#}").contains("register birentech.com/gpu"));
    }

    #[tokio::test]
    async fn socket_watch_reports_only_kubelet_creation() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut restarts) = watch_kubelet_socket(dir.path()).unwrap();

        std::fs::write(dir.path().join("birentech.com_gpu.sock"), "").unwrap();
        let quiet = tokio::time::timeout(Duration::from_millis(200), restarts.recv()).await;
        assert!(quiet.is_err());

        // kubelet coming up after the watch is installed is observed
        let (tx, _registrations) = mpsc::unbounded_channel();
        let kubelet = serve_kubelet(dir.path(), tx);
        tokio::time::timeout(WAIT, restarts.recv())
            .await
            .unwrap()
            .unwrap();
        kubelet.cancel();
    }

    #[test]
    fn only_signals_are_clean_stops() {
        assert!(!StopReason::Signal("SIGTERM").is_failure());
        assert!(StopReason::HeartbeatLost("gone".to_string()).is_failure());
        assert!(StopReason::PluginFailed("bind".to_string()).is_failure());
    }
}
