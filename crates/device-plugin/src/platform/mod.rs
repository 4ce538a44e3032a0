//! Host platform access: the vendor management library and sysfs.

pub mod brml;
#[cfg(test)]
pub mod mock;
pub mod sysfs;

pub use brml::Brml;
pub use brml::BrmlError;
pub use brml::DeviceLibrary;
pub use sysfs::PciDeviceTree;
