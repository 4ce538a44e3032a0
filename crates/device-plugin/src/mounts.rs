//! Driver library and tool paths bind-mounted into containers.

use std::path::Path;
use std::path::PathBuf;

const HOST_PREFIX: &str = "/usr/";
const CONTAINER_PREFIX: &str = "/opt/birentech/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
}

/// The fixed set of management library and CLI paths shared with
/// workloads.
///
/// Each mount is only offered if its container-side path exists when
/// looked up under `probe_root`. The daemon itself sees the host's `/usr`
/// at that location.
#[derive(Debug, Clone)]
pub struct DriverMounts {
    library_version: Option<String>,
    probe_root: PathBuf,
}

fn container_path(host_path: &str) -> PathBuf {
    PathBuf::from(host_path.replace(HOST_PREFIX, CONTAINER_PREFIX))
}

impl DriverMounts {
    pub fn new(library_version: Option<String>) -> Self {
        Self::with_probe_root(library_version, "/")
    }

    pub fn with_probe_root(library_version: Option<String>, probe_root: impl Into<PathBuf>) -> Self {
        Self {
            library_version,
            probe_root: probe_root.into(),
        }
    }

    /// Every candidate mount, present or not.
    pub fn candidates(&self) -> Vec<HostMount> {
        let mut hosts = vec![
            "/usr/lib/libbiren-ml.so".to_string(),
            "/usr/lib/libbiren-ml.so.1".to_string(),
        ];
        if let Some(version) = &self.library_version {
            hosts.push(format!("/usr/lib/libbiren-ml.so.{version}"));
        }
        hosts.push("/usr/bin/brsmi".to_string());

        hosts
            .into_iter()
            .map(|host| HostMount {
                container_path: container_path(&host),
                host_path: PathBuf::from(host),
            })
            .collect()
    }

    pub fn present(&self) -> Vec<HostMount> {
        self.candidates()
            .into_iter()
            .filter(|m| self.probe_path(&m.container_path).exists())
            .collect()
    }

    fn probe_path(&self, path: &Path) -> PathBuf {
        self.probe_root
            .join(path.strip_prefix("/").unwrap_or(path))
    }
}
