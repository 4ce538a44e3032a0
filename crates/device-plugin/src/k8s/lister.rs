//! Builds one device plugin per resource pool from a shared inventory.

use std::sync::Arc;

use super::device_plugin::AllocateSettings;
use super::device_plugin::BrgpuDevicePlugin;
use crate::discovery::DeviceDiscovery;
use crate::discovery::Inventory;
use crate::mounts::DriverMounts;
use crate::topology::Allocator;

pub struct Lister {
    inventory: Inventory,
    discovery: Arc<dyn DeviceDiscovery>,
    allocator: Arc<dyn Allocator>,
    mounts: DriverMounts,
    settings: AllocateSettings,
}

impl Lister {
    pub fn new(
        inventory: Inventory,
        discovery: Arc<dyn DeviceDiscovery>,
        allocator: Arc<dyn Allocator>,
        mounts: DriverMounts,
        settings: AllocateSettings,
    ) -> Self {
        Self {
            inventory,
            discovery,
            allocator,
            mounts,
            settings,
        }
    }

    /// Pools to serve, as decided by the discovery strategy.
    pub fn pool_names(&self) -> Vec<String> {
        self.discovery.resource_pool_names(&self.inventory)
    }

    fn new_plugin(&self, pool: &str) -> Arc<BrgpuDevicePlugin> {
        BrgpuDevicePlugin::new(
            pool,
            &self.inventory,
            self.discovery.clone(),
            self.allocator.clone(),
            self.mounts.clone(),
            self.settings,
        )
    }

    pub fn plugins(&self) -> Vec<Arc<BrgpuDevicePlugin>> {
        self.pool_names()
            .iter()
            .map(|pool| self.new_plugin(pool))
            .collect()
    }
}
