//! Discovery of physical accelerators and their partition instances through
//! the management library.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;

use super::pool_name;
use super::AllocationError;
use super::DeviceDiscovery;
use super::DeviceUnit;
use super::DiscoveryError;
use super::Inventory;
use crate::platform::sysfs::sysfs_bus_id;
use crate::platform::BrmlError;
use crate::platform::DeviceLibrary;
use crate::platform::PciDeviceTree;
use crate::topology::link_weight;
use crate::topology::Graph;

pub const RENDER_NODE: &str = "/dev/dri/renderD128";

const CARD_PREFIX: &str = "card_";

/// Card identifier for a management library node id.
pub fn card_id(node_id: u32) -> String {
    format!("{CARD_PREFIX}{node_id}")
}

pub fn parse_card_id(id: &str) -> Result<u32, Report<DiscoveryError>> {
    id.strip_prefix(CARD_PREFIX)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Report::new(DiscoveryError::InvalidCardId { id: id.to_string() }))
}

/// One exposed compute slice of a physical card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub card_id: String,
    pub uuid: String,
    pub pool: String,
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalUnit {
    pub index: u32,
    pub uuid: String,
    pub partition_mode: u32,
    pub memory: u64,
    pub instances: Vec<Instance>,
}

pub struct PartitionDiscovery {
    library: Arc<dyn DeviceLibrary>,
    device_dir: PathBuf,
    pci_tree: PciDeviceTree,
    class_root: PathBuf,
}

fn at_device<T>(
    result: Result<T, Report<BrmlError>>,
    index: u32,
) -> Result<T, Report<DiscoveryError>> {
    result
        .change_context(DiscoveryError::Library)
        .attach_printable_lazy(|| format!("device index {index}"))
}

impl PartitionDiscovery {
    pub fn new(
        library: Arc<dyn DeviceLibrary>,
        device_dir: impl Into<PathBuf>,
        pci_tree: PciDeviceTree,
        class_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            library,
            device_dir: device_dir.into(),
            pci_tree,
            class_root: class_root.into(),
        }
    }

    /// Queries every physical card and expands partitioned ones into their
    /// instances.
    pub fn discover_units(&self) -> Result<Vec<PhysicalUnit>, Report<DiscoveryError>> {
        let lib = &self.library;
        let count = lib.device_count().change_context(DiscoveryError::Library)?;

        let mut units = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mode = at_device(lib.partition_mode(index), index)?;
            let uuid = at_device(lib.device_uuid(index), index)?.trim().to_string();

            let unit = match mode {
                0 | 1 => {
                    let memory = at_device(lib.memory_total(index), index)?;
                    let node = at_device(lib.node_id(index), index)?;
                    PhysicalUnit {
                        index,
                        uuid: uuid.clone(),
                        partition_mode: mode,
                        memory,
                        instances: vec![Instance {
                            card_id: card_id(node),
                            uuid,
                            pool: pool_name(1),
                            memory,
                        }],
                    }
                }
                2 | 4 => {
                    let mut instances = Vec::with_capacity(mode as usize);
                    for j in 0..mode {
                        let memory = at_device(lib.instance_memory_total(index, j), index)
                            .attach_printable_lazy(|| format!("instance {j}"))?;
                        let node = at_device(lib.instance_node_id(index, j), index)
                            .attach_printable_lazy(|| format!("instance {j}"))?;
                        instances.push(Instance {
                            card_id: card_id(node),
                            uuid: format!("{uuid}-instance-{j}"),
                            pool: pool_name(mode),
                            memory,
                        });
                    }
                    PhysicalUnit {
                        index,
                        uuid,
                        partition_mode: mode,
                        memory: instances.iter().map(|i| i.memory).sum(),
                        instances,
                    }
                }
                other => {
                    tracing::warn!(index, mode = other, "unsupported partition mode, skipping device");
                    continue;
                }
            };
            units.push(unit);
        }
        Ok(units)
    }

    /// Builds the interconnect graph over `card_<n>` ids.
    ///
    /// Every ordered pair, self pairs included, is classified by the
    /// management library; the first insertion of an unordered pair wins.
    pub fn build_graph<S: AsRef<str>>(&self, ids: &[S]) -> Result<Graph, Report<DiscoveryError>> {
        let nodes = ids
            .iter()
            .map(|id| parse_card_id(id.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut graph = Graph::new();
        for &node in &nodes {
            graph.add_node(card_id(node));
        }
        for &a in &nodes {
            for &b in &nodes {
                let class = self
                    .library
                    .link_class(a, b)
                    .change_context(DiscoveryError::Library)
                    .attach_printable_lazy(|| format!("link between node {a} and node {b}"))?;
                graph.add_edge(&card_id(a), &card_id(b), link_weight(class));
            }
        }

        let ids: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
        tracing::info!("create topo for devices: {:?}; result:\n{}", ids, graph);
        Ok(graph)
    }
}

impl DeviceDiscovery for PartitionDiscovery {
    fn mode(&self) -> &'static str {
        "partition"
    }

    fn discover(&self) -> Result<Inventory, Report<DiscoveryError>> {
        let units = self
            .discover_units()?
            .into_iter()
            .flat_map(|unit| {
                let index = unit.index;
                unit.instances.into_iter().map(move |instance| DeviceUnit {
                    device_node: self.device_dir.join(&instance.card_id),
                    id: instance.card_id,
                    pool: instance.pool,
                    physical_index: Some(index),
                })
            })
            .collect();
        Ok(Inventory::new(units))
    }

    fn resource_pool_names(&self, inventory: &Inventory) -> Vec<String> {
        if !self.class_root.exists() {
            tracing::info!(
                class_path = %self.class_root.display(),
                "device class directory missing, not announcing any pool"
            );
            return Vec::new();
        }
        inventory.resource_pool_names()
    }

    fn numa_node(&self, unit: &DeviceUnit) -> Option<i64> {
        let index = unit.physical_index?;
        let bus_id = match self.library.pci_bus_id(index) {
            Ok(bus_id) => sysfs_bus_id(&bus_id),
            Err(e) => {
                tracing::error!(index, "get device pcie info failed: {e:?}");
                return None;
            }
        };
        match self.pci_tree.numa_node(&bus_id) {
            Ok(node) => node,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::error!(%bus_id, "error parsing value for NUMA node: {e}");
                None
            }
            Err(e) => {
                tracing::error!(%bus_id, "read bus numa_node failed: {e}");
                None
            }
        }
    }

    fn topology(&self, ids: &[String]) -> Result<Option<Graph>, Report<DiscoveryError>> {
        self.build_graph(ids).map(Some)
    }

    fn validate_for_allocation(
        &self,
        pool: &str,
        inventory: &Inventory,
        id: &str,
    ) -> Result<PathBuf, Report<AllocationError>> {
        if !inventory.contains(id) {
            return Err(Report::new(AllocationError::UnknownDevice {
                pool: pool.to_string(),
                id: id.to_string(),
            }));
        }
        Ok(self.device_dir.join(id))
    }

    fn render_node(&self) -> Option<PathBuf> {
        Some(PathBuf::from(RENDER_NODE))
    }
}
