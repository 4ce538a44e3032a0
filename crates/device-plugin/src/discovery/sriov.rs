//! SR-IOV discovery over the sysfs PCI tree.

use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;

use super::pool_name;
use super::AllocationError;
use super::DeviceDiscovery;
use super::DeviceUnit;
use super::DiscoveryError;
use super::Inventory;
use super::WHOLE_DEVICE_POOL;
use crate::platform::PciDeviceTree;

pub const BIREN_VENDOR_ID: &str = "1ee0";
/// Driver of a physical function that can spawn virtual functions.
pub const HYPERVISOR_DRIVER: &str = "BEV_HYPER_DRIVER";
pub const PASSTHROUGH_DRIVER: &str = "vfio-pci";

const VFIO_DIR: &str = "/dev/vfio";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFunction {
    pub device_id: String,
    pub iommu_group: String,
    pub address: String,
    pub pool: String,
}

impl VirtualFunction {
    /// VFIO group node handed to the sandbox.
    pub fn endpoint(&self) -> PathBuf {
        Path::new(VFIO_DIR).join(&self.iommu_group)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalFunction {
    pub address: String,
    pub vfs: Vec<VirtualFunction>,
    pub vf_count: u32,
}

fn contains_vf(functions: &[PhysicalFunction], address: &str) -> bool {
    functions
        .iter()
        .flat_map(|pf| &pf.vfs)
        .any(|vf| vf.address == address)
}

#[derive(Debug, Clone, Default)]
pub struct SriovDiscovery {
    tree: PciDeviceTree,
}

impl SriovDiscovery {
    pub fn new(tree: PciDeviceTree) -> Self {
        Self { tree }
    }

    fn sysfs<T>(
        &self,
        result: io::Result<T>,
        address: &str,
        property: &str,
    ) -> Result<T, Report<DiscoveryError>> {
        result.change_context_lazy(|| DiscoveryError::Sysfs {
            path: self.tree.entry(address, property),
        })
    }

    /// Walks the PCI tree for vendor functions bound to the hypervisor or the
    /// passthrough driver.
    pub fn discover_functions(&self) -> Result<Vec<PhysicalFunction>, Report<DiscoveryError>> {
        let addresses = self
            .tree
            .device_addresses()
            .change_context_lazy(|| DiscoveryError::Sysfs {
                path: self.tree.root().to_path_buf(),
            })?;

        let mut functions = Vec::new();
        for address in addresses {
            let vendor = match self.tree.read_id(&address, "vendor") {
                Ok(vendor) => vendor,
                Err(e) => {
                    tracing::error!(%address, "could not get vendor id for device: {e}");
                    continue;
                }
            };
            if vendor != BIREN_VENDOR_ID {
                continue;
            }
            tracing::info!(%address, "found Biren device");

            let driver = match self.tree.read_link_name(&address, "driver") {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::error!(%address, "could not get driver for device, skipping it: {e}");
                    continue;
                }
            };

            match driver.as_str() {
                HYPERVISOR_DRIVER => match self.tree.read_link_name(&address, "physfn") {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        functions.push(self.physical_function(&address)?);
                    }
                    Ok(_) => tracing::debug!(%address, "virtual function, counted under its parent"),
                    Err(e) => tracing::warn!(%address, "could not read physfn link, skipping: {e}"),
                },
                PASSTHROUGH_DRIVER => {
                    let iommu_group = self.sysfs(
                        self.tree.read_link_name(&address, "iommu_group"),
                        &address,
                        "iommu_group",
                    )?;
                    let device_id =
                        self.sysfs(self.tree.read_id(&address, "device"), &address, "device")?;
                    if !contains_vf(&functions, &address) {
                        functions.push(PhysicalFunction {
                            address: address.clone(),
                            vf_count: 1,
                            vfs: vec![VirtualFunction {
                                device_id,
                                iommu_group,
                                address,
                                pool: WHOLE_DEVICE_POOL.to_string(),
                            }],
                        });
                    }
                }
                other => tracing::debug!(%address, driver = other, "unhandled driver, skipping"),
            }
        }
        Ok(functions)
    }

    fn physical_function(&self, address: &str) -> Result<PhysicalFunction, Report<DiscoveryError>> {
        let vf_count = self.sysfs(
            self.tree.read_number(address, "sriov_numvfs"),
            address,
            "sriov_numvfs",
        )?;

        let mut vfs = Vec::with_capacity(vf_count as usize);
        for i in 0..vf_count {
            let link = format!("virtfn{i}");
            let vf_address = self.sysfs(self.tree.read_link_name(address, &link), address, &link)?;
            let iommu_group = self.sysfs(
                self.tree.read_link_name(&vf_address, "iommu_group"),
                &vf_address,
                "iommu_group",
            )?;
            let device_id = self.sysfs(
                self.tree.read_id(&vf_address, "device"),
                &vf_address,
                "device",
            )?;
            vfs.push(VirtualFunction {
                device_id,
                iommu_group,
                address: vf_address,
                pool: pool_name(vf_count),
            });
        }

        Ok(PhysicalFunction {
            address: address.to_string(),
            vfs,
            vf_count,
        })
    }
}

impl DeviceDiscovery for SriovDiscovery {
    fn mode(&self) -> &'static str {
        "sriov"
    }

    fn discover(&self) -> Result<Inventory, Report<DiscoveryError>> {
        let units = self
            .discover_functions()?
            .into_iter()
            .flat_map(|pf| pf.vfs)
            .map(|vf| {
                let endpoint = vf.endpoint();
                DeviceUnit {
                    id: endpoint.to_string_lossy().into_owned(),
                    pool: vf.pool,
                    device_node: endpoint,
                    physical_index: None,
                }
            })
            .collect();
        Ok(Inventory::new(units))
    }

    fn validate_for_allocation(
        &self,
        _pool: &str,
        _inventory: &Inventory,
        id: &str,
    ) -> Result<PathBuf, Report<AllocationError>> {
        Ok(PathBuf::from(id))
    }
}
