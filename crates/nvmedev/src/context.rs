//! The dispatcher
//!
//! A [`Context`] owns the backend registry and routes every device operation
//! to the backend that claims it, wrapping backend-local errors with the
//! backend name and specifier.

use nvmedev_backends::{AnyResources, ControllerDriver, EnumerateFilter, NativeIdent, OpenOptions};
use nvmedev_core::{
    BackendAttr, BackendListing, Enumeration, Error, Geometry, Ident, NativeError, Result,
    ScanWarning, Specifier,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::handle::DeviceHandle;
use crate::registry::{Registry, RegistryEntry};

/// Builder for [`Context`], for attaching controller drivers
#[derive(Debug, Default)]
pub struct ContextBuilder {
    config: Config,
    pci_driver: Option<Arc<dyn ControllerDriver>>,
    fabric_driver: Option<Arc<dyn ControllerDriver>>,
}

impl ContextBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Driver for controllers found on the PCI bus
    pub fn pci_driver(mut self, driver: Arc<dyn ControllerDriver>) -> Self {
        self.pci_driver = Some(driver);
        self
    }

    /// Driver for fabric-attached subsystems
    pub fn fabric_driver(mut self, driver: Arc<dyn ControllerDriver>) -> Self {
        self.fabric_driver = Some(driver);
        self
    }

    pub fn build(self) -> Result<Context> {
        let registry = Registry::with_drivers(&self.config, self.pci_driver, self.fabric_driver)?;
        info!(backends = registry.len(), "nvmedev context initialized");
        Ok(Context { registry })
    }
}

/// Library context
#[derive(Debug)]
pub struct Context {
    registry: Registry,
}

impl Context {
    pub fn new(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn list_backends(&self) -> BackendListing {
        self.registry.list_backends()
    }

    pub fn set_enabled(&mut self, name_or_scheme: &str, enabled: bool) -> Result<()> {
        self.registry.set_enabled(name_or_scheme, enabled)
    }

    /// Scan every enabled backend. Failures become warnings on the result.
    pub fn enumerate_all(&self, filter: Option<&EnumerateFilter>) -> Enumeration {
        let default = EnumerateFilter::default();
        let filter = filter.unwrap_or(&default);

        let mut scan = Enumeration::new();
        for (_, entry) in self.registry.iter() {
            let name = entry.backend.name();
            if !filter.matches_scheme(entry.backend.scheme()) && !filter.matches_scheme(name) {
                continue;
            }
            if !entry.attr.enabled() {
                debug!(backend = name, "Skipping disabled backend");
                scan.warn(ScanWarning::skipped(
                    name,
                    Error::BackendDisabled {
                        backend: name.to_string(),
                    },
                ));
                continue;
            }
            match scan_backend(entry, filter) {
                Ok(part) => scan.append(part),
                Err(e) => {
                    warn!(backend = name, error = %e, "Backend enumeration failed");
                    scan.warn(ScanWarning::failed(name, e));
                }
            }
        }

        info!(
            entries = scan.len(),
            warnings = scan.warnings().len(),
            "Enumeration complete"
        );
        scan
    }

    /// Scan one backend, propagating its failure
    pub fn enumerate_backend(
        &self,
        name_or_scheme: &str,
        filter: Option<&EnumerateFilter>,
    ) -> Result<Enumeration> {
        let (_, entry) = self.enabled_entry(name_or_scheme)?;
        let default = EnumerateFilter::default();
        scan_backend(entry, filter.unwrap_or(&default))
    }

    /// Open through the first enabled backend whose probe accepts the specifier
    pub fn open(&self, specifier: &str, opts: &OpenOptions) -> Result<DeviceHandle> {
        let spec = Specifier::parse(specifier)?;
        for (index, entry) in self.registry.iter() {
            if !entry.attr.enabled() {
                continue;
            }
            if entry.backend.probe(&spec) {
                debug!(backend = entry.backend.name(), specifier = %spec, "Probe matched");
                return self.open_at(index, spec, opts);
            }
        }
        // an explicit scheme naming a disabled backend is a registry problem, not a mismatch
        if let Some(scheme) = spec.scheme() {
            if let Some((_, entry)) = self
                .registry
                .iter()
                .find(|(_, entry)| entry.backend.scheme() == scheme)
            {
                if !entry.attr.enabled() {
                    debug!(backend = entry.backend.name(), specifier = %spec, "Scheme belongs to a disabled backend");
                    return Err(Error::BackendDisabled {
                        backend: entry.backend.name().to_string(),
                    });
                }
            }
        }
        debug!(specifier = %spec, "No backend recognized specifier");
        Err(Error::ProbeMismatch {
            specifier: spec.raw().to_string(),
        })
    }

    /// Open through a named backend, skipping probing
    pub fn open_with(
        &self,
        name_or_scheme: &str,
        specifier: &str,
        opts: &OpenOptions,
    ) -> Result<DeviceHandle> {
        let (index, _) = self.enabled_entry(name_or_scheme)?;
        let spec = Specifier::parse(specifier)?;
        self.open_at(index, spec, opts)
    }

    pub fn identify(&self, handle: &DeviceHandle) -> Result<Ident> {
        let (entry, resources) = self.bound(handle)?;
        let native = entry
            .backend
            .identify(handle.specifier(), resources)
            .map_err(|cause| Error::IdentifyFailure {
                backend: entry.backend.name().to_string(),
                specifier: handle.specifier().raw().to_string(),
                cause,
            })?;
        to_ident(&native, *handle.backend())
    }

    /// Geometry derived from the backend's live state
    pub fn geometry(&self, handle: &DeviceHandle) -> Result<Geometry> {
        let (entry, resources) = self.bound(handle)?;
        let wrap = |cause: NativeError| Error::GeometryFailure {
            backend: entry.backend.name().to_string(),
            specifier: handle.specifier().raw().to_string(),
            cause,
        };
        let native = entry.backend.geometry(resources).map_err(wrap)?;
        Geometry::normalize(&native).map_err(wrap)
    }

    /// Release the handle's resources. A second close is `UseAfterClose`.
    pub fn close(&self, handle: &mut DeviceHandle) -> Result<()> {
        let entry = self.entry_for(handle)?;
        let resources = handle
            .take_resources()
            .ok_or_else(|| use_after_close(handle))?;

        match entry.backend.close(resources) {
            Ok(()) => {
                info!(backend = entry.backend.name(), specifier = %handle.specifier(), "Closed device");
                Ok(())
            }
            Err(cause) => {
                error!(
                    backend = entry.backend.name(),
                    specifier = %handle.specifier(),
                    error = %cause,
                    "Failed to close device"
                );
                Err(Error::CloseFailure {
                    backend: entry.backend.name().to_string(),
                    specifier: handle.specifier().raw().to_string(),
                    cause,
                })
            }
        }
    }

    fn open_at(&self, index: usize, spec: Specifier, opts: &OpenOptions) -> Result<DeviceHandle> {
        let entry = self
            .registry
            .get(index)
            .ok_or_else(|| Error::InvalidArgument(format!("no backend at index {}", index)))?;

        let resources = entry.backend.open(&spec, opts).map_err(|cause| {
            warn!(backend = entry.backend.name(), specifier = %spec, error = %cause, "Open failed");
            Error::OpenFailure {
                backend: entry.backend.name().to_string(),
                specifier: spec.raw().to_string(),
                cause,
            }
        })?;

        info!(backend = entry.backend.name(), specifier = %spec, access = ?opts.access, "Opened device");
        Ok(DeviceHandle::new(index, entry.attr, spec, resources))
    }

    fn enabled_entry(&self, name_or_scheme: &str) -> Result<(usize, &RegistryEntry)> {
        let index = self.registry.find(name_or_scheme)?;
        let entry = self
            .registry
            .get(index)
            .ok_or_else(|| Error::UnknownBackend {
                name: name_or_scheme.to_string(),
            })?;
        if !entry.attr.enabled() {
            return Err(Error::BackendDisabled {
                backend: entry.backend.name().to_string(),
            });
        }
        Ok((index, entry))
    }

    fn entry_for(&self, handle: &DeviceHandle) -> Result<&RegistryEntry> {
        self.registry.get(handle.index()).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "handle for {} does not belong to this context",
                handle.specifier()
            ))
        })
    }

    fn bound<'a>(
        &'a self,
        handle: &'a DeviceHandle,
    ) -> Result<(&'a RegistryEntry, &'a AnyResources)> {
        let entry = self.entry_for(handle)?;
        let resources = handle.resources().ok_or_else(|| use_after_close(handle))?;
        Ok((entry, resources))
    }
}

fn use_after_close(handle: &DeviceHandle) -> Error {
    Error::UseAfterClose {
        backend: handle.backend().name().to_string(),
        specifier: handle.specifier().raw().to_string(),
    }
}

fn to_ident(native: &NativeIdent, attr: BackendAttr) -> Result<Ident> {
    Ident::new(
        native.nsid,
        native.nst,
        native.dtype,
        attr,
        &native.uri,
        &native.be_uri,
    )
}

/// Run one backend's enumeration into its own result
fn scan_backend(entry: &RegistryEntry, filter: &EnumerateFilter) -> Result<Enumeration> {
    let name = entry.backend.name();
    let scan = entry
        .backend
        .enumerate(filter)
        .map_err(|cause| Error::EnumerateFailure {
            backend: name.to_string(),
            cause,
        })?;

    let mut part = Enumeration::new();
    for cause in scan.failures {
        warn!(backend = name, error = %cause, "Device skipped during enumeration");
        part.warn(ScanWarning::failed(
            name,
            Error::EnumerateFailure {
                backend: name.to_string(),
                cause,
            },
        ));
    }
    for native in &scan.entries {
        match to_ident(native, entry.attr) {
            Ok(ident) => {
                debug!(backend = name, uri = %native.uri, "Discovered device");
                part.push(ident);
            }
            Err(e) => {
                warn!(backend = name, uri = %native.uri, error = %e, "Dropping entry that does not fit");
                part.warn(ScanWarning::failed(name, e));
            }
        }
    }
    Ok(part)
}
