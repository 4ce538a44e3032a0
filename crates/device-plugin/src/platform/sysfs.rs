//! Thin readers over the sysfs PCI device tree.

use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

pub const DEFAULT_PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";
pub const DEFAULT_CLASS_PATH: &str = "/sys/class/biren";

/// A view of `/sys/bus/pci/devices` rooted at a configurable path.
#[derive(Debug, Clone)]
pub struct PciDeviceTree {
    root: PathBuf,
}

impl Default for PciDeviceTree {
    fn default() -> Self {
        Self::new(DEFAULT_PCI_DEVICES_PATH)
    }
}

impl PciDeviceTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry(&self, address: &str, property: &str) -> PathBuf {
        self.root.join(address).join(property)
    }

    /// PCI addresses present under the tree, in lexical order.
    pub fn device_addresses(&self) -> io::Result<Vec<String>> {
        let mut addresses = fs::read_dir(&self.root)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect::<io::Result<Vec<_>>>()?;
        addresses.sort();
        Ok(addresses)
    }

    /// Reads a hex id file such as `vendor` or `device`, without the `0x` prefix.
    pub fn read_id(&self, address: &str, property: &str) -> io::Result<String> {
        let raw = fs::read_to_string(self.entry(address, property))?;
        let raw = raw.trim();
        Ok(raw.strip_prefix("0x").unwrap_or(raw).to_string())
    }

    pub fn read_number(&self, address: &str, property: &str) -> io::Result<u32> {
        let raw = fs::read_to_string(self.entry(address, property))?;
        raw.trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Final path component of a symlink such as `driver` or `iommu_group`.
    pub fn read_link_name(&self, address: &str, link: &str) -> io::Result<String> {
        let target = fs::read_link(self.entry(address, link))?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("link {} has no file name", target.display()),
                )
            })
    }

    /// NUMA node of the device at `bus_id`; `None` when the kernel reports no affinity.
    pub fn numa_node(&self, bus_id: &str) -> io::Result<Option<i64>> {
        let raw = fs::read_to_string(self.entry(bus_id, "numa_node"))?;
        let node: i64 = raw
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((node >= 0).then_some(node))
    }
}

/// Normalises a management-library bus id (`00000000:3B:00.0`) to its sysfs name.
pub fn sysfs_bus_id(bus_id: &str) -> String {
    let bus_id = bus_id.trim();
    let extended_domain = bus_id.split(':').next().is_some_and(|d| d.len() == 8);
    match bus_id.strip_prefix("0000") {
        Some(short) if extended_domain => short.to_lowercase(),
        _ => bus_id.to_lowercase(),
    }
}

/// Reads the hardware physical id of a card from the vendor class directory.
pub fn physical_id(class_root: &Path, card: &str) -> io::Result<String> {
    let raw = fs::read_to_string(class_root.join(card).join("device").join("physical_id"))?;
    Ok(raw.trim().to_string())
}
