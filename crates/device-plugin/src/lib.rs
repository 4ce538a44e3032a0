//! Kubernetes device plugin for Biren accelerators.

pub mod cdi;
pub mod cmd;
pub mod config;
pub mod discovery;
pub mod k8s;
pub mod manager;
pub mod mounts;
pub mod platform;
pub mod topology;

/// Extended resource namespace and CDI vendor.
pub const RESOURCE_NAMESPACE: &str = "birentech.com";
