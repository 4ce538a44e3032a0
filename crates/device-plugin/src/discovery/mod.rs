//! Device discovery.
//!
//! Two strategies produce an [`Inventory`]: [`PartitionDiscovery`] for whole
//! or sliced accelerators handed to ordinary containers, and
//! [`SriovDiscovery`] for virtual functions handed to VM sandboxes. One of
//! them is chosen at startup and used through [`DeviceDiscovery`] from then on.

use core::error::Error;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::PathBuf;

use error_stack::Report;

use crate::topology::Graph;

pub mod partition;
pub mod sriov;

pub use partition::PartitionDiscovery;
pub use sriov::SriovDiscovery;

/// Resource pool shared by units that are not split.
pub const WHOLE_DEVICE_POOL: &str = "gpu";

/// Pool name for devices split `count` ways: `gpu` or `1-<count>-gpu`.
pub fn pool_name(count: u32) -> String {
    if count <= 1 {
        WHOLE_DEVICE_POOL.to_string()
    } else {
        format!("1-{count}-gpu")
    }
}

/// One allocatable unit as the kubelet sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUnit {
    /// Device id reported to kubelet and used in allocation requests.
    pub id: String,
    pub pool: String,
    /// Host device node backing the unit.
    pub device_node: PathBuf,
    /// Physical card index, for units backed by the management library.
    pub physical_index: Option<u32>,
}

/// Snapshot of every unit found by one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    units: Vec<DeviceUnit>,
}

impl Inventory {
    pub fn new(units: Vec<DeviceUnit>) -> Self {
        Self { units }
    }

    pub fn units(&self) -> &[DeviceUnit] {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.units.iter().map(|u| u.id.clone()).collect()
    }

    /// Distinct pool names, sorted.
    pub fn resource_pool_names(&self) -> Vec<String> {
        self.units
            .iter()
            .map(|u| u.pool.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Units of a single pool, order preserved.
    pub fn filter_by_pool(&self, pool: &str) -> Inventory {
        Inventory::new(
            self.units
                .iter()
                .filter(|u| u.pool == pool)
                .cloned()
                .collect(),
        )
    }

    pub fn contains(&self, id: &str) -> bool {
        self.units.iter().any(|u| u.id == id)
    }

    pub fn pool_of(&self, id: &str) -> Option<&str> {
        self.units
            .iter()
            .find(|u| u.id == id)
            .map(|u| u.pool.as_str())
    }

    /// Units grouped by pool, pools in sorted order.
    pub fn by_pool(&self) -> BTreeMap<&str, Vec<&DeviceUnit>> {
        let mut pools: BTreeMap<&str, Vec<&DeviceUnit>> = BTreeMap::new();
        for unit in &self.units {
            pools.entry(unit.pool.as_str()).or_default().push(unit);
        }
        pools
    }
}

#[derive(Debug, derive_more::Display)]
pub enum DiscoveryError {
    #[display("device management library query failed")]
    Library,
    #[display("failed to read sysfs entry {}", path.display())]
    Sysfs { path: PathBuf },
    #[display("card identifier {id} is not of the form card_<n>")]
    InvalidCardId { id: String },
}

impl Error for DiscoveryError {}

#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("invalid allocation request for {pool}: unknown device {id}")]
    UnknownDevice { pool: String, id: String },
}

impl Error for AllocationError {}

/// A device discovery strategy.
pub trait DeviceDiscovery: Send + Sync {
    /// Short name used in logs.
    fn mode(&self) -> &'static str;

    /// Runs a full discovery pass. Any failure aborts the whole pass.
    fn discover(&self) -> Result<Inventory, Report<DiscoveryError>>;

    /// Pools to serve for `inventory`.
    fn resource_pool_names(&self, inventory: &Inventory) -> Vec<String> {
        inventory.resource_pool_names()
    }

    /// NUMA node to report for a unit, if known.
    fn numa_node(&self, _unit: &DeviceUnit) -> Option<i64> {
        None
    }

    /// Interconnect graph over the given device ids, for strategies that
    /// have one.
    fn topology(&self, _ids: &[String]) -> Result<Option<Graph>, Report<DiscoveryError>> {
        Ok(None)
    }

    /// Checks that `id` may be handed out from `inventory` and returns the
    /// device node to map into the container.
    fn validate_for_allocation(
        &self,
        pool: &str,
        inventory: &Inventory,
        id: &str,
    ) -> Result<PathBuf, Report<AllocationError>>;

    /// Extra render node to expose alongside allocated devices.
    fn render_node(&self) -> Option<PathBuf> {
        None
    }
}
