//! nvmedev Backends - Storage access methods behind one capability interface
//!
//! Each backend recognizes specifiers, opens devices, reports identity and
//! geometry, and enumerates what it can reach:
//! - `kblk`: kernel block devices via device nodes and sysfs
//! - `upci`: user-space PCIe controllers via an injected controller driver
//! - `fab`: NVMe-oF subsystems over RDMA or TCP
//! - `file`: regular files presented as single-namespace devices

pub mod any;
pub mod capability;
pub mod driver;
pub mod fabric;
pub mod file;
pub mod kblk;
mod sysfs;
pub mod upci;

pub use any::{AnyBackend, AnyResources};
pub use capability::{Access, Backend, BackendScan, EnumerateFilter, NativeIdent, OpenOptions};
pub use driver::{
    AttachedNamespace, ControllerDriver, ControllerSession, NamespaceData, QpairId, TransportId,
    TransportType,
};
pub use fabric::{FabricBackend, FabricConfig, FabricResources, FabricTarget};
pub use file::{FileBackend, FileConfig, FileResources};
pub use kblk::{KblkBackend, KblkConfig, KblkResources};
pub use upci::{UpciBackend, UpciConfig, UpciResources};
