//! nvmedev - Uniform access to NVMe devices across access methods
//!
//! A [`Context`] owns a fixed registry of backends (kernel block, user-space
//! PCIe, fabric, file). Callers open devices by specifier, read identity and
//! geometry through the returned [`DeviceHandle`], and enumerate everything
//! reachable across all enabled backends.
//!
//! ```no_run
//! use nvmedev::{Config, Context, OpenOptions};
//!
//! let ctx = Context::new(Config::default())?;
//! let mut dev = ctx.open("/dev/nvme0n1", &OpenOptions::default())?;
//! println!("{}", ctx.identify(&dev)?);
//! println!("{}", ctx.geometry(&dev)?);
//! ctx.close(&mut dev)?;
//! # Ok::<(), nvmedev::Error>(())
//! ```

pub mod config;
pub mod context;
pub mod handle;
pub mod registry;

pub use config::{load_config, save_default_config, Config, ConfigError, DEFAULT_CONFIG_FILE};
pub use context::{Context, ContextBuilder};
pub use handle::{DeviceHandle, HandleState};
pub use registry::{Registry, RegistryEntry};

pub use nvmedev_backends::{
    Access, ControllerDriver, ControllerSession, EnumerateFilter, FabricConfig, FabricTarget,
    FileConfig, KblkConfig, NamespaceData, OpenOptions, QpairId, TransportId, TransportType,
    UpciConfig,
};
pub use nvmedev_core::{
    version, BackendAttr, BackendListing, DeviceType, Enumeration, Error, ErrorCode, Geometry,
    Ident, NamespaceType, NativeError, NativeResult, Result, ScanWarning, ScanWarningKind,
    Specifier, Version,
};
