//! Binding to the vendor management library (`libbiren-ml`).
//!
//! The library is opened at runtime with `libloading`; every entry point the
//! plugin needs is resolved once in [`Brml::load`]. Callers only ever see the
//! [`DeviceLibrary`] trait so discovery and topology code can run against an
//! in-memory fake in tests.

use std::env;
use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::ffi::OsString;

use error_stack::Report;
use error_stack::ResultExt;
use libloading::Library;

const PRIMARY_BRML_LIB: &str = "libbiren-ml.so.1";
const BRML_FALLBACK_LIB: &str = "libbiren-ml.so";
const BRML_LIB_PATH_ENV: &str = "BRML_LIB_PATH";

const BRML_SUCCESS: c_int = 0;
const BRML_STRING_BUFFER: usize = 96;

#[derive(Debug, derive_more::Display)]
pub enum BrmlError {
    #[display("failed to load management library from {path}")]
    LibraryLoad { path: String },
    #[display("management library has no symbol `{name}`")]
    MissingSymbol { name: &'static str },
    #[display("{function} returned error code {code}")]
    Call { function: &'static str, code: i32 },
}

impl std::error::Error for BrmlError {}

/// Queries the plugin issues against the accelerator management layer.
///
/// Physical devices are addressed by their enumeration index, partitions and
/// topology queries by the GPU node id that also names the device node
/// (`card_<node id>`).
pub trait DeviceLibrary: Send + Sync {
    fn device_count(&self) -> Result<u32, Report<BrmlError>>;

    /// Number of isolated instances the device is split into (0 or 1 = not partitioned).
    fn partition_mode(&self, index: u32) -> Result<u32, Report<BrmlError>>;

    fn device_uuid(&self, index: u32) -> Result<String, Report<BrmlError>>;

    /// Total device memory in bytes.
    fn memory_total(&self, index: u32) -> Result<u64, Report<BrmlError>>;

    fn node_id(&self, index: u32) -> Result<u32, Report<BrmlError>>;

    fn instance_node_id(&self, index: u32, instance: u32) -> Result<u32, Report<BrmlError>>;

    fn instance_memory_total(&self, index: u32, instance: u32) -> Result<u64, Report<BrmlError>>;

    /// PCI bus id as reported by the library, e.g. `00000000:3B:00.0`.
    fn pci_bus_id(&self, index: u32) -> Result<String, Report<BrmlError>>;

    /// Interconnect class between two devices; larger means a tighter link.
    fn link_class(&self, node_a: u32, node_b: u32) -> Result<u32, Report<BrmlError>>;

    fn library_version(&self) -> Result<String, Report<BrmlError>>;
}

type DeviceHandle = *mut c_void;

#[repr(C)]
#[allow(dead_code)]
struct BrmlMemory {
    total: u64,
    free: u64,
    used: u64,
}

#[repr(C)]
#[allow(dead_code)]
struct BrmlPciInfo {
    bus_id_legacy: [c_char; 16],
    domain: c_uint,
    bus: c_uint,
    device: c_uint,
    pci_device_id: c_uint,
    pci_sub_system_id: c_uint,
    bus_id: [c_char; 32],
}

#[repr(C)]
#[allow(dead_code)]
struct BrmlP2pStatus {
    link_type: c_uint,
    reserved: [c_uint; 15],
}

type InitFn = unsafe extern "C" fn() -> c_int;
type CountFn = unsafe extern "C" fn(*mut c_uint) -> c_int;
type HandleFn = unsafe extern "C" fn(c_uint, *mut DeviceHandle) -> c_int;
type UintQueryFn = unsafe extern "C" fn(DeviceHandle, *mut c_uint) -> c_int;
type StringQueryFn = unsafe extern "C" fn(DeviceHandle, *mut c_char, c_uint) -> c_int;
type MemoryFn = unsafe extern "C" fn(DeviceHandle, *mut BrmlMemory) -> c_int;
type InstanceFn = unsafe extern "C" fn(DeviceHandle, c_uint, *mut DeviceHandle) -> c_int;
type PciInfoFn = unsafe extern "C" fn(DeviceHandle, *mut BrmlPciInfo) -> c_int;
type P2pStatusFn = unsafe extern "C" fn(DeviceHandle, DeviceHandle, *mut BrmlP2pStatus) -> c_int;
type VersionFn = unsafe extern "C" fn(*mut c_char, c_uint) -> c_int;

/// Dynamically loaded `libbiren-ml`.
///
/// Function pointers stay valid for as long as `_lib` is alive, which is the
/// lifetime of this value.
pub struct Brml {
    _lib: Library,
    shutdown: InitFn,
    device_count: CountFn,
    handle_by_index: HandleFn,
    handle_by_node_id: HandleFn,
    svi_mode: UintQueryFn,
    uuid: StringQueryFn,
    memory_info: MemoryFn,
    gpu_node_id: UintQueryFn,
    instance_by_id: InstanceFn,
    pci_info: PciInfoFn,
    p2p_status: P2pStatusFn,
    version: VersionFn,
}

impl std::fmt::Debug for Brml {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Brml").finish_non_exhaustive()
    }
}

fn candidate_libs() -> Vec<OsString> {
    let mut candidates = Vec::with_capacity(3);
    if let Some(path) = env::var_os(BRML_LIB_PATH_ENV) {
        candidates.push(path);
    }
    candidates.push(PRIMARY_BRML_LIB.into());
    candidates.push(BRML_FALLBACK_LIB.into());
    candidates
}

/// # Safety
/// `T` must be the exact signature of the exported symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> Result<T, Report<BrmlError>> {
    let mut raw = Vec::with_capacity(name.len() + 1);
    raw.extend_from_slice(name.as_bytes());
    raw.push(0);
    let sym = lib
        .get::<T>(&raw)
        .change_context(BrmlError::MissingSymbol { name })?;
    Ok(*sym)
}

fn check(function: &'static str, code: c_int) -> Result<(), Report<BrmlError>> {
    if code == BRML_SUCCESS {
        Ok(())
    } else {
        Err(Report::new(BrmlError::Call { function, code }))
    }
}

fn c_string(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

impl Brml {
    /// Opens the library, resolves all entry points and initialises it.
    pub fn load() -> Result<Self, Report<BrmlError>> {
        let mut last_err = None;
        for candidate in candidate_libs() {
            let lib_path = candidate.to_string_lossy().to_string();
            tracing::info!("Loading management library from {}", lib_path);
            // SAFETY: loading the vendor library runs its constructors, which is
            // exactly what linking against it would do.
            match unsafe { Library::new(&candidate) } {
                Ok(lib) => return Self::from_library(lib),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to load {}", lib_path);
                    last_err = Some(
                        Report::new(err).change_context(BrmlError::LibraryLoad { path: lib_path }),
                    );
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Report::new(BrmlError::LibraryLoad {
                path: BRML_FALLBACK_LIB.to_string(),
            })
        }))
    }

    fn from_library(lib: Library) -> Result<Self, Report<BrmlError>> {
        // SAFETY: signatures mirror the vendor header.
        unsafe {
            let init: InitFn = symbol(&lib, "brmlInit")?;
            check("brmlInit", init())?;
            Ok(Self {
                shutdown: symbol(&lib, "brmlShutdown")?,
                device_count: symbol(&lib, "brmlDeviceGetCount")?,
                handle_by_index: symbol(&lib, "brmlDeviceGetHandleByIndex")?,
                handle_by_node_id: symbol(&lib, "brmlDeviceGetHandleByNodeId")?,
                svi_mode: symbol(&lib, "brmlDeviceGetSviMode")?,
                uuid: symbol(&lib, "brmlDeviceGetUUID")?,
                memory_info: symbol(&lib, "brmlDeviceGetMemoryInfo")?,
                gpu_node_id: symbol(&lib, "brmlDeviceGetGpuNodeId")?,
                instance_by_id: symbol(&lib, "brmlDeviceGetGpuInstanceById")?,
                pci_info: symbol(&lib, "brmlDeviceGetPciInfo")?,
                p2p_status: symbol(&lib, "brmlDeviceGetP2PStatusV2")?,
                version: symbol(&lib, "brmlSystemGetBrmlVersion")?,
                _lib: lib,
            })
        }
    }

    fn handle_by_node_id(&self, node: u32) -> Result<DeviceHandle, Report<BrmlError>> {
        let mut handle: DeviceHandle = std::ptr::null_mut();
        // SAFETY: out-pointer is valid for the duration of the call.
        check("brmlDeviceGetHandleByNodeId", unsafe {
            (self.handle_by_node_id)(node, &mut handle)
        })?;
        Ok(handle)
    }

    fn handle_by_index(&self, index: u32) -> Result<DeviceHandle, Report<BrmlError>> {
        let mut handle: DeviceHandle = std::ptr::null_mut();
        // SAFETY: out-pointer is valid for the duration of the call.
        check("brmlDeviceGetHandleByIndex", unsafe {
            (self.handle_by_index)(index, &mut handle)
        })?;
        Ok(handle)
    }

    fn instance(&self, index: u32, instance: u32) -> Result<DeviceHandle, Report<BrmlError>> {
        let device = self.handle_by_node_id(index)?;
        let mut handle: DeviceHandle = std::ptr::null_mut();
        // SAFETY: device handle comes from the library, out-pointer is valid.
        check("brmlDeviceGetGpuInstanceById", unsafe {
            (self.instance_by_id)(device, instance, &mut handle)
        })?;
        Ok(handle)
    }

    fn uint_query(
        &self,
        function: &'static str,
        query: UintQueryFn,
        handle: DeviceHandle,
    ) -> Result<u32, Report<BrmlError>> {
        let mut value: c_uint = 0;
        // SAFETY: handle comes from the library, out-pointer is valid.
        check(function, unsafe { query(handle, &mut value) })?;
        Ok(value)
    }

    fn memory_of(&self, handle: DeviceHandle) -> Result<u64, Report<BrmlError>> {
        let mut memory = BrmlMemory {
            total: 0,
            free: 0,
            used: 0,
        };
        // SAFETY: handle comes from the library, out-pointer is valid.
        check("brmlDeviceGetMemoryInfo", unsafe {
            (self.memory_info)(handle, &mut memory)
        })?;
        Ok(memory.total)
    }
}

impl DeviceLibrary for Brml {
    fn device_count(&self) -> Result<u32, Report<BrmlError>> {
        let mut count: c_uint = 0;
        // SAFETY: out-pointer is valid for the duration of the call.
        check("brmlDeviceGetCount", unsafe { (self.device_count)(&mut count) })?;
        Ok(count)
    }

    fn partition_mode(&self, index: u32) -> Result<u32, Report<BrmlError>> {
        let device = self.handle_by_node_id(index)?;
        self.uint_query("brmlDeviceGetSviMode", self.svi_mode, device)
    }

    fn device_uuid(&self, index: u32) -> Result<String, Report<BrmlError>> {
        let device = self.handle_by_node_id(index)?;
        let mut buf = [0 as c_char; BRML_STRING_BUFFER];
        // SAFETY: buffer length is passed alongside the buffer.
        check("brmlDeviceGetUUID", unsafe {
            (self.uuid)(device, buf.as_mut_ptr(), buf.len() as c_uint)
        })?;
        Ok(c_string(&buf))
    }

    fn memory_total(&self, index: u32) -> Result<u64, Report<BrmlError>> {
        let device = self.handle_by_node_id(index)?;
        self.memory_of(device)
    }

    fn node_id(&self, index: u32) -> Result<u32, Report<BrmlError>> {
        let device = self.handle_by_node_id(index)?;
        self.uint_query("brmlDeviceGetGpuNodeId", self.gpu_node_id, device)
    }

    fn instance_node_id(&self, index: u32, instance: u32) -> Result<u32, Report<BrmlError>> {
        let handle = self.instance(index, instance)?;
        self.uint_query("brmlDeviceGetGpuNodeId", self.gpu_node_id, handle)
    }

    fn instance_memory_total(&self, index: u32, instance: u32) -> Result<u64, Report<BrmlError>> {
        let handle = self.instance(index, instance)?;
        self.memory_of(handle)
    }

    fn pci_bus_id(&self, index: u32) -> Result<String, Report<BrmlError>> {
        let device = self.handle_by_index(index)?;
        let mut info = BrmlPciInfo {
            bus_id_legacy: [0; 16],
            domain: 0,
            bus: 0,
            device: 0,
            pci_device_id: 0,
            pci_sub_system_id: 0,
            bus_id: [0; 32],
        };
        // SAFETY: handle comes from the library, out-pointer is valid.
        check("brmlDeviceGetPciInfo", unsafe {
            (self.pci_info)(device, &mut info)
        })?;
        Ok(c_string(&info.bus_id))
    }

    fn link_class(&self, node_a: u32, node_b: u32) -> Result<u32, Report<BrmlError>> {
        let a = self.handle_by_node_id(node_a)?;
        let b = self.handle_by_node_id(node_b)?;
        let mut status = BrmlP2pStatus {
            link_type: 0,
            reserved: [0; 15],
        };
        // SAFETY: both handles come from the library, out-pointer is valid.
        check("brmlDeviceGetP2PStatusV2", unsafe {
            (self.p2p_status)(a, b, &mut status)
        })
        .attach_printable_lazy(|| format!("nodes {node_a} <-> {node_b}"))?;
        Ok(status.link_type)
    }

    fn library_version(&self) -> Result<String, Report<BrmlError>> {
        let mut buf = [0 as c_char; BRML_STRING_BUFFER];
        // SAFETY: buffer length is passed alongside the buffer.
        check("brmlSystemGetBrmlVersion", unsafe {
            (self.version)(buf.as_mut_ptr(), buf.len() as c_uint)
        })?;
        Ok(c_string(&buf))
    }
}

impl Drop for Brml {
    fn drop(&mut self) {
        // SAFETY: the library was initialised in `from_library`.
        let code = unsafe { (self.shutdown)() };
        if code != BRML_SUCCESS {
            tracing::warn!("brmlShutdown returned error code {}", code);
        }
    }
}
