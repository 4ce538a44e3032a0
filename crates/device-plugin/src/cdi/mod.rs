//! Container Device Interface descriptor generation.
//!
//! The descriptor lets a CDI-aware runtime inject device nodes and driver
//! mounts for a device referenced as `birentech.com/<pool>=<id>`. One YAML
//! document is written per resource pool into a single file.

use core::error::Error;
use std::fs;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::discovery::DeviceDiscovery;
use crate::discovery::DeviceUnit;
use crate::mounts::DriverMounts;
use crate::mounts::HostMount;
use crate::RESOURCE_NAMESPACE;

pub const DEFAULT_CDI_CONFIG_PATH: &str = "/etc/cdi/biren.yaml";
/// Newer format versions are rejected by the containerd releases in use.
pub const CDI_VERSION: &str = "0.5.0";

const DOCUMENT_SEPARATOR: &str = "---\n";
const MOUNT_OPTIONS: [&str; 4] = ["ro", "nosuid", "nodev", "bind"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub cdi_version: String,
    pub kind: String,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default, skip_serializing_if = "ContainerEdits::is_empty")]
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub container_edits: ContainerEdits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
}

impl ContainerEdits {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.device_nodes.is_empty() && self.mounts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    pub host_path: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub permissions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub options: Vec<String>,
}

impl From<&HostMount> for Mount {
    fn from(m: &HostMount) -> Self {
        Self {
            host_path: m.host_path.to_string_lossy().into_owned(),
            container_path: m.container_path.to_string_lossy().into_owned(),
            options: MOUNT_OPTIONS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl From<&DeviceUnit> for Device {
    fn from(unit: &DeviceUnit) -> Self {
        let node = unit.device_node.to_string_lossy().into_owned();
        Self {
            name: unit.id.clone(),
            container_edits: ContainerEdits {
                device_nodes: vec![DeviceNode {
                    path: node.clone(),
                    host_path: node,
                    node_type: "c".to_string(),
                    permissions: "rw".to_string(),
                }],
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, derive_more::Display)]
pub enum DescriptorError {
    #[display("device discovery for the descriptor failed")]
    Discovery,
    #[display("failed to inspect {}", path.display())]
    Inspect { path: PathBuf },
    #[display("failed to serialize descriptor for {kind}")]
    Serialize { kind: String },
    #[display("failed to write {}", path.display())]
    Write { path: PathBuf },
}

impl Error for DescriptorError {}

#[derive(Debug, Clone)]
pub struct DescriptorSettings {
    pub enabled: bool,
    pub overwrite: bool,
    pub mount_host_path: bool,
    pub path: PathBuf,
}

impl Default for DescriptorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            overwrite: false,
            mount_host_path: false,
            path: PathBuf::from(DEFAULT_CDI_CONFIG_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerateOutcome {
    Disabled,
    KeptExisting,
    Written { pools: Vec<String> },
}

pub struct DescriptorGenerator {
    settings: DescriptorSettings,
    mounts: DriverMounts,
}

impl DescriptorGenerator {
    pub fn new(settings: DescriptorSettings, mounts: DriverMounts) -> Self {
        Self { settings, mounts }
    }

    /// Builds one spec per pool, pools in name order.
    pub fn specs(
        &self,
        discovery: &dyn DeviceDiscovery,
    ) -> Result<Vec<Spec>, Report<DescriptorError>> {
        let inventory = discovery
            .discover()
            .change_context(DescriptorError::Discovery)?;

        let mounts: Vec<Mount> = if self.settings.mount_host_path {
            self.mounts.present().iter().map(Mount::from).collect()
        } else {
            Vec::new()
        };

        Ok(inventory
            .by_pool()
            .into_iter()
            .map(|(pool, units)| Spec {
                cdi_version: CDI_VERSION.to_string(),
                kind: format!("{RESOURCE_NAMESPACE}/{pool}"),
                devices: units.into_iter().map(Device::from).collect(),
                container_edits: ContainerEdits {
                    mounts: mounts.clone(),
                    ..Default::default()
                },
            })
            .collect())
    }

    /// Writes the descriptor file unless disabled or already present.
    ///
    /// The file is truncated and rewritten in place.
    pub fn generate(
        &self,
        discovery: &dyn DeviceDiscovery,
    ) -> Result<GenerateOutcome, Report<DescriptorError>> {
        let path = &self.settings.path;
        if !self.settings.enabled {
            tracing::info!("cdi feature isn't enabled");
            return Ok(GenerateOutcome::Disabled);
        }

        let exists = path
            .try_exists()
            .change_context_lazy(|| DescriptorError::Inspect { path: path.clone() })?;
        if exists && !self.settings.overwrite {
            tracing::info!(path = %path.display(), "cdi config already exists and no need to rewrite");
            return Ok(GenerateOutcome::KeptExisting);
        }

        let specs = self.specs(discovery)?;
        let mut contents = String::new();
        for spec in &specs {
            let document = serde_yaml::to_string(spec)
                .change_context_lazy(|| DescriptorError::Serialize { kind: spec.kind.clone() })?;
            contents.push_str(DOCUMENT_SEPARATOR);
            contents.push_str(&document);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .change_context_lazy(|| DescriptorError::Write { path: path.clone() })?;
        }
        fs::write(path, contents)
            .change_context_lazy(|| DescriptorError::Write { path: path.clone() })?;

        let pools: Vec<String> = specs
            .iter()
            .filter_map(|s| s.kind.rsplit('/').next().map(str::to_string))
            .collect();
        tracing::info!(path = %path.display(), ?pools, "cdi config written");
        Ok(GenerateOutcome::Written { pools })
    }
}
