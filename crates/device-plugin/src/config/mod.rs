use std::path::PathBuf;
use std::time::Duration;

use crate::cdi::DescriptorSettings;
use crate::k8s::AllocateSettings;

pub mod cli;
pub mod daemon;

/// Settings shared by the manager, plugins and descriptor generator.
///
/// Built once from the command line and never mutated.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub container_runtime: ContainerRuntime,
    /// Device presence check interval; `None` disables it.
    pub pulse: Option<Duration>,
    pub cdi_feature: bool,
    pub overwrite_cdi_config: bool,
    pub mount_host_path: bool,
    pub mount_dri_device: bool,
    pub device_plugin_path: PathBuf,
    pub cdi_config_path: PathBuf,
    pub device_dir: PathBuf,
    pub sysfs_pci_path: PathBuf,
    pub sysfs_class_path: PathBuf,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            container_runtime: ContainerRuntime::Runc,
            pulse: None,
            cdi_feature: false,
            overwrite_cdi_config: false,
            mount_host_path: false,
            mount_dri_device: false,
            device_plugin_path: crate::k8s::device_plugin::DEFAULT_DEVICE_PLUGIN_PATH.into(),
            cdi_config_path: crate::cdi::DEFAULT_CDI_CONFIG_PATH.into(),
            device_dir: daemon::DEFAULT_DEVICE_DIR.into(),
            sysfs_pci_path: crate::platform::sysfs::DEFAULT_PCI_DEVICES_PATH.into(),
            sysfs_class_path: crate::platform::sysfs::DEFAULT_CLASS_PATH.into(),
        }
    }
}

impl From<&DaemonArgs> for PluginConfig {
    fn from(args: &DaemonArgs) -> Self {
        Self {
            container_runtime: args.container_runtime,
            pulse: (args.pulse > 0).then(|| Duration::from_secs(args.pulse)),
            cdi_feature: args.cdi_feature,
            overwrite_cdi_config: args.overwrite_cdi_config,
            mount_host_path: args.mount_host_path,
            mount_dri_device: args.mount_dri_device,
            device_plugin_path: args.device_plugin_path.clone(),
            cdi_config_path: args.cdi_config_path.clone(),
            device_dir: args.device_dir.clone(),
            sysfs_pci_path: args.sysfs_pci_path.clone(),
            sysfs_class_path: args.sysfs_class_path.clone(),
        }
    }
}

impl PluginConfig {
    pub fn allocate_settings(&self) -> AllocateSettings {
        AllocateSettings {
            cdi_enabled: self.cdi_feature,
            mount_host_path: self.mount_host_path,
            mount_dri_device: self.mount_dri_device,
        }
    }

    pub fn descriptor_settings(&self) -> DescriptorSettings {
        DescriptorSettings {
            enabled: self.cdi_feature,
            overwrite: self.overwrite_cdi_config,
            mount_host_path: self.mount_host_path,
            path: self.cdi_config_path.clone(),
        }
    }
}

pub use cli::*;
pub use daemon::*;
