//! Backend registry
//!
//! The table of backends is fixed at construction in declaration order
//! (`kblk`, `upci`, `fab`, `file`). Only the enabled flags change afterwards.

use nvmedev_backends::{
    AnyBackend, ControllerDriver, FabricBackend, FileBackend, KblkBackend, UpciBackend,
};
use nvmedev_core::{BackendAttr, BackendListing, Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;

/// One registered backend
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub attr: BackendAttr,
    pub backend: AnyBackend,
}

#[derive(Debug, Clone)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// Build the table from configuration, without controller drivers
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_drivers(config, None, None)
    }

    pub fn with_drivers(
        config: &Config,
        pci_driver: Option<Arc<dyn ControllerDriver>>,
        fabric_driver: Option<Arc<dyn ControllerDriver>>,
    ) -> Result<Self> {
        let backends: [(AnyBackend, bool); 4] = [
            (KblkBackend::new(config.kblk.clone()).into(), config.kblk.enabled),
            (
                UpciBackend::new(config.upci.clone(), pci_driver).into(),
                config.upci.enabled,
            ),
            (
                FabricBackend::new(config.fab.clone(), fabric_driver).into(),
                config.fab.enabled,
            ),
            (FileBackend::new(config.file.clone()).into(), config.file.enabled),
        ];

        let mut entries = Vec::with_capacity(backends.len());
        for (backend, enabled) in backends {
            let attr = BackendAttr::new(backend.name(), backend.scheme(), enabled)?;
            debug!(backend = backend.name(), enabled, "Registered backend");
            entries.push(RegistryEntry { attr, backend });
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RegistryEntry> {
        self.entries.get(index)
    }

    /// Entries in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RegistryEntry)> {
        self.entries.iter().enumerate()
    }

    /// Index of the backend with this name or scheme
    pub fn find(&self, name_or_scheme: &str) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.attr.matches(name_or_scheme))
            .ok_or_else(|| Error::UnknownBackend {
                name: name_or_scheme.to_string(),
            })
    }

    /// Snapshot of every backend's attributes
    pub fn list_backends(&self) -> BackendListing {
        let mut listing = BackendListing::with_capacity(self.entries.len() as u32);
        for entry in &self.entries {
            listing.push(entry.attr);
        }
        listing
    }

    pub fn set_enabled(&mut self, name_or_scheme: &str, enabled: bool) -> Result<()> {
        let index = self.find(name_or_scheme)?;
        let attr = &mut self.entries[index].attr;
        if attr.enabled() != enabled {
            info!(backend = %attr.name(), enabled, "Backend toggled");
        }
        attr.set_enabled(enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declaration_order() {
        let registry = Registry::new(&Config::default()).unwrap();
        let listing = registry.list_backends();
        let names: Vec<_> = listing.iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["kblk", "upci", "fab", "file"]);
        let schemes: Vec<_> = listing.iter().map(|a| a.scheme().to_string()).collect();
        assert_eq!(schemes, vec!["kblk", "pci", "fab", "file"]);
        assert!(listing.iter().all(|a| a.enabled()));
        assert_eq!(listing.capacity(), 4);
    }

    #[test]
    fn test_config_flags_apply() {
        let mut config = Config::default();
        config.fab.enabled = false;
        let registry = Registry::new(&config).unwrap();
        let fab = registry.get(registry.find("fab").unwrap()).unwrap();
        assert!(!fab.attr.enabled());
    }

    #[test]
    fn test_set_enabled_by_name_or_scheme() {
        let mut registry = Registry::new(&Config::default()).unwrap();
        registry.set_enabled("pci", false).unwrap();
        assert!(!registry.get(1).unwrap().attr.enabled());
        registry.set_enabled("upci", true).unwrap();
        assert!(registry.get(1).unwrap().attr.enabled());

        let err = registry.set_enabled("spdk", true).unwrap_err();
        assert_eq!(
            err,
            Error::UnknownBackend {
                name: "spdk".to_string()
            }
        );
    }
}
