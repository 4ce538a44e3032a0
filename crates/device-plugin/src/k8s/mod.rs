//! Kubelet device plugin integration.

pub mod device_plugin;
pub mod lister;

pub use device_plugin::AllocateSettings;
pub use device_plugin::BrgpuDevicePlugin;
pub use lister::Lister;
