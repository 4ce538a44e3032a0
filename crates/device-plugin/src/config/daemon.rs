use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

use crate::cdi::DEFAULT_CDI_CONFIG_PATH;
use crate::k8s::device_plugin::DEFAULT_DEVICE_PLUGIN_PATH;
use crate::platform::sysfs::DEFAULT_CLASS_PATH;
use crate::platform::sysfs::DEFAULT_PCI_DEVICES_PATH;

pub const DEFAULT_DEVICE_DIR: &str = "/dev/biren";

/// How devices reach the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, derive_more::Display)]
pub enum ContainerRuntime {
    /// Device nodes (whole cards or partitions) in ordinary containers
    #[display("runc")]
    Runc,
    /// SR-IOV virtual functions passed into VM sandboxes
    #[display("kata")]
    Kata,
}

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "CONTAINER_RUNTIME",
        value_enum,
        default_value_t = ContainerRuntime::Runc,
        help = "The container runtime, runc or kata"
    )]
    pub container_runtime: ContainerRuntime,

    #[arg(
        long,
        env = "PULSE",
        default_value_t = 0,
        help = "Heartbeat interval in seconds, 0 disables the device presence check"
    )]
    pub pulse: u64,

    #[arg(
        long,
        env = "CDI_FEATURE",
        help = "Generate a CDI descriptor and answer allocations with CDI device references"
    )]
    pub cdi_feature: bool,

    #[arg(
        long,
        env = "OVERWRITE_CDI_CONFIG",
        help = "Rewrite the CDI descriptor even if it already exists"
    )]
    pub overwrite_cdi_config: bool,

    #[arg(
        long,
        env = "MOUNT_HOST_PATH",
        help = "Mount the host management library and brsmi into containers"
    )]
    pub mount_host_path: bool,

    #[arg(
        long,
        env = "MOUNT_DRI_DEVICE",
        help = "Expose the DRI render node alongside allocated cards"
    )]
    pub mount_dri_device: bool,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = DEFAULT_DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Kubelet device plugin directory"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        env = "CDI_CONFIG_PATH",
        default_value = DEFAULT_CDI_CONFIG_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "Where the CDI descriptor is written"
    )]
    pub cdi_config_path: PathBuf,

    #[arg(
        long,
        env = "DEVICE_DIR",
        default_value = DEFAULT_DEVICE_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the card device nodes"
    )]
    pub device_dir: PathBuf,

    #[arg(
        long,
        env = "SYSFS_PCI_PATH",
        default_value = DEFAULT_PCI_DEVICES_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "sysfs PCI device tree"
    )]
    pub sysfs_pci_path: PathBuf,

    #[arg(
        long,
        env = "SYSFS_CLASS_PATH",
        default_value = DEFAULT_CLASS_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "sysfs class directory of the Biren driver"
    )]
    pub sysfs_class_path: PathBuf,

    #[arg(
        long,
        env = "BRGPU_LOG_PATH",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory for daily rotated log files, stderr only when unset"
    )]
    pub log_path: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
pub struct TopoArgs {
    #[arg(
        long,
        default_value = DEFAULT_DEVICE_DIR,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the card device nodes"
    )]
    pub device_dir: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_CLASS_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "sysfs class directory of the Biren driver"
    )]
    pub sysfs_class_path: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_PCI_DEVICES_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "sysfs PCI device tree"
    )]
    pub sysfs_pci_path: PathBuf,
}
