#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use api::device_plugin_server::DevicePlugin;
use api::device_plugin_server::DevicePluginServer;
use api::registration_client::RegistrationClient;
use api::AllocateRequest;
use api::AllocateResponse;
use api::CdiDevice;
use api::ContainerAllocateRequest;
use api::ContainerAllocateResponse;
use api::ContainerPreferredAllocationResponse;
use api::DevicePluginOptions;
use api::DeviceSpec;
use api::Empty;
use api::ListAndWatchResponse;
use api::NumaNode;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use api::RegisterRequest;
use api::TopologyInfo;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::discovery::DeviceDiscovery;
use crate::discovery::Inventory;
use crate::discovery::WHOLE_DEVICE_POOL;
use crate::mounts::DriverMounts;
use crate::topology::Allocator;
use crate::topology::Graph;
use crate::RESOURCE_NAMESPACE;

pub const API_VERSION: &str = "v1beta1";
pub const KUBELET_SOCKET: &str = "kubelet.sock";
pub const DEFAULT_DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
/// Environment variable listing the device ids handed to a container.
pub const ALLOCATED_DEVICES_ENV: &str = "BR_PHY_CARDS";
const HEALTHY: &str = "Healthy";

/// Feature switches that shape `Allocate` responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocateSettings {
    /// Answer with CDI device references only.
    pub cdi_enabled: bool,
    pub mount_host_path: bool,
    pub mount_dri_device: bool,
}

/// Device plugin for one Biren resource pool
pub struct BrgpuDevicePlugin {
    pool: String,
    /// resource name (e.g. "birentech.com/1-4-gpu")
    resource_name: String,
    /// socket file name inside the device plugin directory
    endpoint: String,
    /// the pool's share of the discovered devices
    inventory: Inventory,
    discovery: Arc<dyn DeviceDiscovery>,
    allocator: Arc<dyn Allocator>,
    mounts: DriverMounts,
    settings: AllocateSettings,
    options: DevicePluginOptions,
    /// graph built by the latest ListAndWatch, read by preferred allocation
    topology: RwLock<Option<Arc<Graph>>>,
    /// open ListAndWatch streams
    watchers: AtomicUsize,
}

impl std::fmt::Debug for BrgpuDevicePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrgpuDevicePlugin")
            .field("resource_name", &self.resource_name)
            .field("endpoint", &self.endpoint)
            .field("devices", &self.inventory.len())
            .field("mode", &self.discovery.mode())
            .finish_non_exhaustive()
    }
}

impl BrgpuDevicePlugin {
    /// create the plugin for `pool`, keeping only that pool's devices
    pub fn new(
        pool: &str,
        inventory: &Inventory,
        discovery: Arc<dyn DeviceDiscovery>,
        allocator: Arc<dyn Allocator>,
        mounts: DriverMounts,
        settings: AllocateSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool: pool.to_string(),
            resource_name: format!("{RESOURCE_NAMESPACE}/{pool}"),
            endpoint: format!("{RESOURCE_NAMESPACE}_{pool}.sock"),
            inventory: inventory.filter_by_pool(pool),
            discovery,
            allocator,
            mounts,
            settings,
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: true,
            },
            topology: RwLock::new(None),
            watchers: AtomicUsize::new(0),
        })
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[cfg(test)]
    pub(crate) fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    #[cfg(test)]
    pub(crate) fn watchers(&self) -> usize {
        self.watchers.load(Ordering::SeqCst)
    }

    pub fn topology(&self) -> Option<Arc<Graph>> {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_topology(&self, graph: Option<Graph>) {
        *self
            .topology
            .write()
            .unwrap_or_else(PoisonError::into_inner) = graph.map(Arc::new);
    }

    /// start device plugin server
    pub async fn start(
        self: &Arc<Self>,
        socket_path: &Path,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("start device plugin server: {}", socket_path.display());

        // clean up old socket file if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }

        let listener = UnixListener::bind(socket_path)?;

        let device_plugin_service =
            DevicePluginService::new(self.clone(), cancellation_token.clone());
        let device_plugin_server = DevicePluginServer::new(device_plugin_service);

        info!("gRPC server is bound to: {}", socket_path.display());

        let resource_name = self.resource_name.clone();
        tokio::spawn(async move {
            let served = tonic::transport::Server::builder()
                .add_service(device_plugin_server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        cancellation_token.cancelled().await;
                        info!("shutting down gRPC server for {resource_name}");
                    },
                )
                .await;
            if let Err(e) = served {
                error!("device plugin gRPC server failed: {e}");
            }
        });

        Ok(())
    }

    /// register device plugin with kubelet
    pub async fn register_with_kubelet(&self, kubelet_socket: &Path) -> anyhow::Result<()> {
        info!(
            "registering {} with kubelet: {}",
            self.resource_name,
            kubelet_socket.display()
        );

        let channel = create_uds_channel(kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(self.options),
        };

        match client.register(Request::new(request)).await {
            Ok(_) => {
                info!("successfully registered {} with kubelet", self.resource_name);
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("registration failed: {e}")),
        }
    }

    fn device_list(&self) -> Vec<api::Device> {
        self.inventory
            .units()
            .iter()
            .map(|unit| {
                let topology = self.discovery.numa_node(unit).map(|numa| {
                    info!("dev {} topology numa {numa}", unit.id);
                    TopologyInfo {
                        nodes: vec![NumaNode { id: numa }],
                    }
                });
                api::Device {
                    id: unit.id.clone(),
                    health: HEALTHY.to_string(),
                    topology,
                }
            })
            .collect()
    }

    /// Rebuilds and publishes the topology graph for `ids`.
    fn refresh_topology(&self, ids: &[String]) {
        let graph = match self.discovery.topology(ids) {
            Ok(graph) => graph,
            Err(e) => {
                error!("generate topology for {ids:?} failed: {e:?}");
                None
            }
        };
        self.set_topology(graph);
    }

    fn preferred_allocation(
        &self,
        request: PreferredAllocationRequest,
    ) -> PreferredAllocationResponse {
        let Some(graph) = self.topology() else {
            debug!("no topology yet for {}, no preference", self.resource_name);
            return PreferredAllocationResponse::default();
        };

        let container_responses = request
            .container_requests
            .into_iter()
            .map(|req| {
                let available = graph.select_nodes(&req.available_device_ids);
                let device_ids = self.allocator.preferred(
                    &available,
                    &req.must_include_device_ids,
                    req.allocation_size,
                );
                ContainerPreferredAllocationResponse { device_ids }
            })
            .collect();
        PreferredAllocationResponse {
            container_responses,
        }
    }

    fn allocate_container(
        &self,
        request: &ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse, Status> {
        let mut response = ContainerAllocateResponse::default();

        if self.settings.cdi_enabled {
            response.cdi_devices = request
                .devices_ids
                .iter()
                .map(|id| {
                    let pool = self.inventory.pool_of(id).unwrap_or(WHOLE_DEVICE_POOL);
                    CdiDevice {
                        name: format!("{RESOURCE_NAMESPACE}/{pool}={id}"),
                    }
                })
                .collect();
            return Ok(response);
        }

        if self.settings.mount_host_path {
            response.mounts = self
                .mounts
                .present()
                .into_iter()
                .map(|m| api::Mount {
                    host_path: m.host_path.to_string_lossy().into_owned(),
                    container_path: m.container_path.to_string_lossy().into_owned(),
                    read_only: true,
                })
                .collect();
        }

        if self.settings.mount_dri_device {
            if let Some(render) = self.discovery.render_node() {
                let path = render.to_string_lossy().into_owned();
                response.devices.push(DeviceSpec {
                    container_path: path.clone(),
                    host_path: path,
                    permissions: "rw".to_string(),
                });
            }
        }

        for id in &request.devices_ids {
            let node = self
                .discovery
                .validate_for_allocation(&self.pool, &self.inventory, id)
                .map_err(|e| {
                    let message = e.current_context().to_string();
                    error!("{message}");
                    Status::invalid_argument(message)
                })?;
            let path = node.to_string_lossy().into_owned();
            response.devices.push(DeviceSpec {
                container_path: path.clone(),
                host_path: path,
                permissions: "rw".to_string(),
            });
            info!("Allocate device {id} successfully");
        }

        response.envs = HashMap::from([(
            ALLOCATED_DEVICES_ENV.to_string(),
            request.devices_ids.join(","),
        )]);
        Ok(response)
    }
}

/// create Unix Domain Socket client connection
pub(crate) async fn create_uds_channel(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path = socket_path.to_path_buf();

    // The HTTP URL is a placeholder since we're using Unix socket connector
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;

    Ok(channel)
}

/// DevicePlugin service implementation
#[derive(Debug)]
pub struct DevicePluginService {
    device_plugin: Arc<BrgpuDevicePlugin>,
    /// ends the device stream when the server is shut down
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        device_plugin: Arc<BrgpuDevicePlugin>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            device_plugin,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        let options = self.device_plugin.options;
        info!("Start Plugin With Options {options:?}");
        Ok(Response::new(options))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// send one device snapshot, then hold the stream open
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let plugin = self.device_plugin.clone();
        info!("starting to watch device list for {}", plugin.resource_name);

        let devices = plugin.device_list();
        plugin.refresh_topology(&plugin.inventory.ids());

        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = self.cancellation_token.clone();
        plugin.watchers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            if let Err(e) = tx.send(Ok(ListAndWatchResponse { devices })) {
                error!("failed to send device list: {e}");
            } else {
                // holding the sender keeps the stream open
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("device watch for {} stopped", plugin.resource_name);
                    }
                    _ = tx.closed() => {
                        info!("device watch for {} closed by kubelet", plugin.resource_name);
                    }
                }
            }
            plugin.watchers.fetch_sub(1, Ordering::SeqCst);
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        Ok(Response::new(self.device_plugin.preferred_allocation(req)))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices: {:?}", req);

        let container_responses = req
            .container_requests
            .iter()
            .map(|container_req| self.device_plugin.allocate_container(container_req))
            .collect::<Result<Vec<_>, Status>>()?;

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use futures::StreamExt;
    use similar_asserts::assert_eq;

    use super::api::device_plugin_client::DevicePluginClient;
    use super::api::registration_server::Registration;
    use super::api::registration_server::RegistrationServer;
    use super::api::ContainerPreferredAllocationRequest;
    use super::*;
    use crate::discovery::DeviceUnit;
    use crate::discovery::PartitionDiscovery;
    use crate::discovery::SriovDiscovery;
    use crate::platform::mock::FakeLibrary;
    use crate::platform::PciDeviceTree;
    use crate::topology::ExactAllocator;

    struct Fixture {
        _dir: tempfile::TempDir,
        discovery: Arc<PartitionDiscovery>,
        inventory: Inventory,
    }

    fn partition_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = dir.path().join("pci/0000:3b:00.0");
        std::fs::create_dir_all(&bus).unwrap();
        std::fs::write(bus.join("numa_node"), "0\n").unwrap();

        // card_0 and card_2 share the strongest link
        let lib = FakeLibrary::new()
            .with_card(1)
            .with_card(1)
            .with_card(1)
            .with_card(2)
            .with_default_link(0)
            .with_link(0, 2, 2)
            .with_link(0, 1, 1)
            .with_link(1, 2, 1);
        let discovery = Arc::new(PartitionDiscovery::new(
            Arc::new(lib),
            "/dev/biren",
            PciDeviceTree::new(dir.path().join("pci")),
            dir.path().join("class"),
        ));
        let inventory = discovery.discover().unwrap();
        Fixture {
            _dir: dir,
            discovery,
            inventory,
        }
    }

    fn plugin(fixture: &Fixture, pool: &str, settings: AllocateSettings) -> Arc<BrgpuDevicePlugin> {
        BrgpuDevicePlugin::new(
            pool,
            &fixture.inventory,
            fixture.discovery.clone(),
            Arc::new(ExactAllocator),
            DriverMounts::new(None),
            settings,
        )
    }

    fn service(plugin: &Arc<BrgpuDevicePlugin>) -> DevicePluginService {
        DevicePluginService::new(plugin.clone(), CancellationToken::new())
    }

    fn allocate_request(ids: &[&str]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_ids: ids.iter().map(ToString::to_string).collect(),
            }],
        })
    }

    fn preferred_request(available: &[&str], size: i32) -> Request<PreferredAllocationRequest> {
        Request::new(PreferredAllocationRequest {
            container_requests: vec![ContainerPreferredAllocationRequest {
                available_device_ids: available.iter().map(ToString::to_string).collect(),
                must_include_device_ids: vec![],
                allocation_size: size,
            }],
        })
    }

    #[test]
    fn names_follow_vendor_namespace() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "1-2-gpu", AllocateSettings::default());
        assert_eq!(plugin.resource_name(), "birentech.com/1-2-gpu");
        assert_eq!(plugin.endpoint(), "birentech.com_1-2-gpu.sock");
        assert_eq!(plugin.inventory().ids(), vec!["card_3", "card_4"]);
    }

    #[tokio::test]
    async fn options_declare_preferred_allocation() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        let options = service(&plugin)
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(options.get_preferred_allocation_available);
        assert!(!options.pre_start_required);
    }

    #[test_log::test(tokio::test)]
    async fn watch_sends_snapshot_and_publishes_graph() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        assert_eq!(plugin.watchers(), 0);
        assert!(plugin.topology().is_none());

        let mut stream = service(&plugin)
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let snapshot = stream.next().await.unwrap().unwrap();

        let ids: Vec<&str> = snapshot.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["card_0", "card_1", "card_2"]);
        assert!(snapshot.devices.iter().all(|d| d.health == "Healthy"));
        assert_eq!(
            snapshot.devices[0].topology,
            Some(TopologyInfo {
                nodes: vec![NumaNode { id: 0 }]
            })
        );
        assert_eq!(snapshot.devices[1].topology, None);

        assert_eq!(plugin.watchers(), 1);
        let graph = plugin.topology().unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.weight("card_0", "card_2"), Some(9));

        // nothing else is sent
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn dropped_stream_ends_its_watch_task() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        let service = service(&plugin);

        let mut first = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        first.next().await.unwrap().unwrap();
        let mut second = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        second.next().await.unwrap().unwrap();
        assert_eq!(plugin.watchers(), 2);

        // kubelet reconnecting drops the old stream; the server token is untouched
        drop(first);
        let settled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while plugin.watchers() != 1 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok());
        assert!(!service.cancellation_token.is_cancelled());

        drop(second);
        let settled = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while plugin.watchers() != 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok());
    }

    #[tokio::test]
    async fn preferred_allocation_is_empty_before_watch() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        let response = service(&plugin)
            .get_preferred_allocation(preferred_request(&["card_0", "card_1"], 1))
            .await
            .unwrap()
            .into_inner();
        assert!(response.container_responses.is_empty());
    }

    #[tokio::test]
    async fn preferred_allocation_picks_best_linked_cards() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        let service = service(&plugin);
        let _stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap();

        let response = service
            .get_preferred_allocation(preferred_request(&["card_0", "card_1", "card_2"], 2))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.container_responses.len(), 1);
        assert_eq!(
            response.container_responses[0].device_ids,
            vec!["card_0".to_string(), "card_2".to_string()]
        );

        // restricted to what kubelet still has available
        let response = service
            .get_preferred_allocation(preferred_request(&["card_1", "card_2"], 2))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            response.container_responses[0].device_ids,
            vec!["card_1".to_string(), "card_2".to_string()]
        );
    }

    #[tokio::test]
    async fn allocate_maps_device_nodes_and_env() {
        let fixture = partition_fixture();
        let plugin = plugin(
            &fixture,
            "gpu",
            AllocateSettings {
                mount_dri_device: true,
                ..Default::default()
            },
        );
        let response = service(&plugin)
            .allocate(allocate_request(&["card_0", "card_2"]))
            .await
            .unwrap()
            .into_inner();

        let container = &response.container_responses[0];
        let paths: Vec<&str> = container.devices.iter().map(|d| d.host_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/dev/dri/renderD128", "/dev/biren/card_0", "/dev/biren/card_2"]
        );
        assert!(container.devices.iter().all(|d| d.permissions == "rw"));
        assert_eq!(container.envs[ALLOCATED_DEVICES_ENV], "card_0,card_2");
        assert!(container.cdi_devices.is_empty());
    }

    #[tokio::test]
    async fn allocate_rejects_unknown_device() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        let status = service(&plugin)
            .allocate(allocate_request(&["card_0", "card_3"]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("unknown device card_3"));
    }

    #[tokio::test]
    async fn allocate_with_cdi_only_references_devices() {
        let fixture = partition_fixture();
        let plugin = plugin(
            &fixture,
            "1-2-gpu",
            AllocateSettings {
                cdi_enabled: true,
                mount_dri_device: true,
                mount_host_path: true,
            },
        );
        let response = service(&plugin)
            .allocate(allocate_request(&["card_4", "card_9"]))
            .await
            .unwrap()
            .into_inner();

        let container = &response.container_responses[0];
        let names: Vec<&str> = container.cdi_devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["birentech.com/1-2-gpu=card_4", "birentech.com/gpu=card_9"]
        );
        assert!(container.devices.is_empty());
        assert!(container.mounts.is_empty());
        assert!(container.envs.is_empty());
    }

    #[tokio::test]
    async fn sandbox_mode_passes_vfio_paths_through() {
        let inventory = Inventory::new(vec![DeviceUnit {
            id: "/dev/vfio/40".to_string(),
            pool: "gpu".to_string(),
            device_node: PathBuf::from("/dev/vfio/40"),
            physical_index: None,
        }]);
        let plugin = BrgpuDevicePlugin::new(
            "gpu",
            &inventory,
            Arc::new(SriovDiscovery::default()),
            Arc::new(ExactAllocator),
            DriverMounts::new(None),
            AllocateSettings {
                mount_dri_device: true,
                ..Default::default()
            },
        );
        let service = service(&plugin);

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let snapshot = stream.next().await.unwrap().unwrap();
        assert_eq!(snapshot.devices[0].id, "/dev/vfio/40");
        assert!(plugin.topology().is_none());

        let response = service
            .allocate(allocate_request(&["/dev/vfio/40"]))
            .await
            .unwrap()
            .into_inner();
        let container = &response.container_responses[0];
        assert_eq!(container.devices.len(), 1);
        assert_eq!(container.devices[0].container_path, "/dev/vfio/40");
        assert_eq!(container.envs[ALLOCATED_DEVICES_ENV], "/dev/vfio/40");
    }

    #[tokio::test]
    async fn pre_start_is_a_no_op() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        service(&plugin)
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["card_0".to_string()],
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn serves_over_unix_socket() {
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        let socket_dir = tempfile::tempdir().unwrap();
        let socket = socket_dir.path().join(plugin.endpoint());
        // stale socket from a previous run
        std::fs::write(&socket, "").unwrap();

        let token = CancellationToken::new();
        plugin.start(&socket, token.clone()).await.unwrap();

        let channel = create_uds_channel(&socket).await.unwrap();
        let mut client = DevicePluginClient::new(channel);
        let mut stream = client
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let snapshot = stream.message().await.unwrap().unwrap();
        assert_eq!(snapshot.devices.len(), 3);

        let response = client
            .allocate(allocate_request(&["card_1"]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.container_responses[0].devices[0].host_path, "/dev/biren/card_1");

        token.cancel();
    }

    #[derive(Debug)]
    struct RecordingKubelet {
        requests: mpsc::UnboundedSender<RegisterRequest>,
    }

    #[tonic::async_trait]
    impl Registration for RecordingKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> TonicResult<Response<Empty>> {
            let _ = self.requests.send(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    #[tokio::test]
    async fn registers_with_kubelet() {
        let dir = tempfile::tempdir().unwrap();
        let kubelet_socket = dir.path().join(KUBELET_SOCKET);
        let listener = UnixListener::bind(&kubelet_socket).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(RegistrationServer::new(RecordingKubelet { requests: tx }))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown.cancelled_owned(),
                )
                .await
        });

        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "1-2-gpu", AllocateSettings::default());
        plugin.register_with_kubelet(&kubelet_socket).await.unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.version, "v1beta1");
        assert_eq!(request.endpoint, "birentech.com_1-2-gpu.sock");
        assert_eq!(request.resource_name, "birentech.com/1-2-gpu");
        assert!(request.options.unwrap().get_preferred_allocation_available);
        token.cancel();
    }

    #[tokio::test]
    async fn registration_fails_without_kubelet() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = partition_fixture();
        let plugin = plugin(&fixture, "gpu", AllocateSettings::default());
        assert!(plugin
            .register_with_kubelet(&dir.path().join(KUBELET_SOCKET))
            .await
            .is_err());
    }
}
