//! User-space PCIe backend
//!
//! Drives NVMe controllers that were unbound from the kernel driver and handed
//! to a user-space capable stub (vfio-pci, uio_pci_generic). Candidate
//! controllers come from the PCI sysfs tree; the controller itself is driven
//! through an injected [`ControllerDriver`].

use nvmedev_core::specifier::SCHEME_PCI;
use nvmedev_core::{DeviceType, NamespaceType, NativeError, NativeGeometry, NativeResult, Specifier};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::{
    Backend, BackendScan, EnumerateFilter, FirstError, NativeIdent, OpenOptions,
};
use crate::driver::{list_namespaces, AttachedNamespace, ControllerDriver, TransportId};
use crate::sysfs::{link_name, list_dir_names, read_attr_u64};

/// PCI class code of an NVMe controller (mass storage, non-volatile memory, NVMe)
pub const NVME_CLASS_CODE: u64 = 0x010802;

/// User-space PCIe backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpciConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Root of the sysfs tree
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Kernel drivers that leave a controller usable from user space
    #[serde(default = "default_drivers")]
    pub drivers: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_drivers() -> Vec<String> {
    vec!["vfio-pci".to_string(), "uio_pci_generic".to_string()]
}

impl Default for UpciConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sysfs_root: default_sysfs_root(),
            drivers: default_drivers(),
        }
    }
}

/// An opened controller namespace
#[derive(Debug)]
pub struct UpciResources {
    bdf: String,
    config_space: Option<File>,
    attached: Option<AttachedNamespace>,
}

impl UpciResources {
    pub fn bdf(&self) -> &str {
        &self.bdf
    }

    fn attached(&self) -> NativeResult<&AttachedNamespace> {
        self.attached
            .as_ref()
            .ok_or_else(|| NativeError::new(libc::EBADF, "controller already detached"))
    }
}

#[derive(Debug, Clone)]
pub struct UpciBackend {
    config: UpciConfig,
    driver: Option<Arc<dyn ControllerDriver>>,
}

impl UpciBackend {
    pub fn new(config: UpciConfig, driver: Option<Arc<dyn ControllerDriver>>) -> Self {
        Self { config, driver }
    }

    pub fn config(&self) -> &UpciConfig {
        &self.config
    }

    fn devices_dir(&self) -> PathBuf {
        self.config.sysfs_root.join("bus/pci/devices")
    }

    fn driver(&self) -> NativeResult<&dyn ControllerDriver> {
        self.driver.as_deref().ok_or_else(|| {
            NativeError::new(libc::ENODEV, "no user-space controller driver attached")
        })
    }

    /// Bound kernel driver, if it is one that allows user-space access
    fn check_binding(&self, bdf: &str) -> NativeResult<()> {
        let bound = link_name(&self.devices_dir().join(bdf).join("driver"))?;
        match bound {
            Some(name) if self.config.drivers.contains(&name) => Ok(()),
            Some(name) => Err(NativeError::new(
                libc::EBUSY,
                format!("{} is bound to kernel driver {}", bdf, name),
            )),
            None => Err(NativeError::new(
                libc::ENXIO,
                format!("{} is not bound to a user-space driver", bdf),
            )),
        }
    }

    fn controllers(&self) -> NativeResult<Vec<String>> {
        let dir = self.devices_dir();
        let mut found = Vec::new();
        for bdf in list_dir_names(&dir)? {
            if read_attr_u64(&dir.join(&bdf).join("class"))? != Some(NVME_CLASS_CODE) {
                continue;
            }
            match self.check_binding(&bdf) {
                Ok(()) => found.push(bdf),
                Err(e) => debug!(bdf = %bdf, reason = %e, "Skipping NVMe controller"),
            }
        }
        Ok(found)
    }
}

impl Backend for UpciBackend {
    type Resources = UpciResources;

    const NAME: &'static str = "upci";
    const SCHEME: &'static str = SCHEME_PCI;

    fn probe(&self, spec: &Specifier) -> bool {
        match spec.scheme() {
            Some(scheme) => scheme == SCHEME_PCI,
            None => normalize_bdf(spec.path()).is_some(),
        }
    }

    fn open(&self, spec: &Specifier, opts: &OpenOptions) -> NativeResult<UpciResources> {
        let bdf = normalize_bdf(spec.path()).ok_or_else(|| {
            NativeError::new(
                libc::EINVAL,
                format!("{:?} is not a PCI address", spec.path()),
            )
        })?;
        let nsid = opts.resolve_nsid(spec)?.unwrap_or(1);

        let dev_dir = self.devices_dir().join(&bdf);
        if !dev_dir.is_dir() {
            return Err(NativeError::new(
                libc::ENODEV,
                format!("no PCI device at {}", bdf),
            ));
        }
        self.check_binding(&bdf)?;

        let config_path = dev_dir.join("config");
        let config_space = File::open(&config_path)
            .map_err(|e| NativeError::from_io(&e, format!("open {}", config_path.display())))?;

        let trid = TransportId::pcie(&bdf).map_err(|e| NativeError::new(libc::EINVAL, e.to_string()))?;
        let attached = AttachedNamespace::attach(self.driver()?, &trid, nsid, opts.io_queue_size)?;

        debug!(bdf = %bdf, nsid, "Opened user-space controller");
        Ok(UpciResources {
            bdf,
            config_space: Some(config_space),
            attached: Some(attached),
        })
    }

    fn close(&self, mut resources: UpciResources) -> NativeResult<()> {
        let mut errors = FirstError::default();
        if let Some(attached) = resources.attached.take() {
            errors.record(attached.release());
        }
        drop(resources.config_space.take());
        errors.finish()
    }

    fn identify(&self, spec: &Specifier, resources: &UpciResources) -> NativeResult<NativeIdent> {
        let attached = resources.attached()?;
        let ns = attached.namespace_data()?;
        Ok(NativeIdent {
            nsid: ns.nsid,
            nst: ns.csi,
            dtype: DeviceType::Namespace,
            uri: spec.raw().to_string(),
            be_uri: attached.trid().to_string(),
        })
    }

    fn enumerate(&self, filter: &EnumerateFilter) -> NativeResult<BackendScan> {
        let mut scan = BackendScan::new();
        for bdf in self.controllers()? {
            let trid = match TransportId::pcie(&bdf) {
                Ok(trid) => trid,
                Err(e) => {
                    scan.fail(NativeError::new(libc::EINVAL, format!("{}: {}", bdf, e)));
                    continue;
                }
            };

            let Some(driver) = self.driver.as_deref() else {
                scan.push(NativeIdent {
                    nsid: 0,
                    nst: NamespaceType::Unknown,
                    dtype: DeviceType::Controller,
                    uri: Specifier::compose(SCHEME_PCI, &bdf, &[]),
                    be_uri: trid.to_string(),
                });
                continue;
            };

            match list_namespaces(driver, &trid) {
                Ok(namespaces) => {
                    for ns in namespaces {
                        scan.push(NativeIdent {
                            nsid: ns.nsid,
                            nst: ns.csi,
                            dtype: DeviceType::Namespace,
                            uri: Specifier::compose(SCHEME_PCI, &bdf, &[("nsid", ns.nsid.to_string())]),
                            be_uri: trid.to_string(),
                        });
                    }
                }
                Err(e) => {
                    warn!(bdf = %bdf, error = %e, "Failed to list namespaces");
                    scan.fail(NativeError::new(
                        e.code,
                        format!("list namespaces of {}: {}", bdf, e.message),
                    ));
                }
            }
        }
        scan.retain_matching(filter);
        debug!(
            count = scan.entries.len(),
            failures = scan.failures.len(),
            "Enumerated user-space controllers"
        );
        Ok(scan)
    }

    fn geometry(&self, resources: &UpciResources) -> NativeResult<NativeGeometry> {
        resources.attached()?.native_geometry()
    }
}

/// `dddd:bb:dd.f` or the short `bb:dd.f`, lowercased and with the domain filled in
pub fn normalize_bdf(s: &str) -> Option<String> {
    let parts: Vec<&str> = s.split(':').collect();
    let (domain, bus, devfn) = match parts.as_slice() {
        [domain, bus, devfn] => (*domain, *bus, *devfn),
        [bus, devfn] => ("0000", *bus, *devfn),
        _ => return None,
    };
    let (device, function) = devfn.split_once('.')?;

    let is_hex = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit());
    if !is_hex(domain, 4) || !is_hex(bus, 2) || !is_hex(device, 2) {
        return None;
    }
    if function.len() != 1 || !matches!(function.as_bytes()[0], b'0'..=b'7') {
        return None;
    }
    Some(format!("{}:{}:{}.{}", domain, bus, device, function).to_ascii_lowercase())
}


#[cfg(test)]
mod tests {
    use super::testing::FakePciTree;
    use super::*;
    use crate::driver::testing::{namespace, FakeDriver};

    fn spec(s: &str) -> Specifier {
        Specifier::parse(s).unwrap()
    }

    fn backend(tree: &FakePciTree, driver: &FakeDriver) -> UpciBackend {
        UpciBackend::new(tree.config(), Some(Arc::new(driver.clone())))
    }

    #[test]
    fn test_normalize_bdf() {
        assert_eq!(normalize_bdf("0000:03:00.0").as_deref(), Some("0000:03:00.0"));
        assert_eq!(normalize_bdf("03:00.0").as_deref(), Some("0000:03:00.0"));
        assert_eq!(normalize_bdf("0000:AF:00.1").as_deref(), Some("0000:af:00.1"));
        assert_eq!(normalize_bdf("0000:03:00.8"), None);
        assert_eq!(normalize_bdf("/dev/nvme0n1"), None);
        assert_eq!(normalize_bdf("0000:03:00"), None);
    }

    #[test]
    fn test_probe() {
        let backend = UpciBackend::new(UpciConfig::default(), None);
        assert!(backend.probe(&spec("pci://0000:03:00.0")));
        assert!(backend.probe(&spec("0000:03:00.0")));
        assert!(!backend.probe(&spec("/dev/nvme0n1")));
        assert!(!backend.probe(&spec("kblk:///dev/nvme0n1")));
    }

    #[test]
    fn test_open_identify_geometry_close() {
        let tree = FakePciTree::new();
        tree.add("0000:03:00.0", 0x010802, Some("vfio-pci"));
        let driver = FakeDriver::default()
            .with_controller("0000:03:00.0", vec![namespace(1, 1000), namespace(2, 2000)]);
        let backend = backend(&tree, &driver);
        let s = spec("pci://0000:03:00.0?nsid=2");

        let res = backend.open(&s, &OpenOptions::default()).unwrap();
        assert_eq!(res.bdf(), "0000:03:00.0");

        let ident = backend.identify(&s, &res).unwrap();
        assert_eq!(ident.nsid, 2);
        assert_eq!(ident.dtype, DeviceType::Namespace);
        assert_eq!(ident.be_uri, "trtype:PCIe traddr:0000:03:00.0");

        let geo = backend.geometry(&res).unwrap();
        assert_eq!(geo.nlbas, Some(2000));
        assert_eq!(geo.lba_nbytes, Some(4096));

        backend.close(res).unwrap();
        let c = driver.counters();
        assert_eq!((c.connects, c.detaches), (1, 1));
        assert_eq!(c.qpairs_freed, 1);
    }

    #[test]
    fn test_open_kernel_bound_controller_is_busy() {
        let tree = FakePciTree::new();
        tree.add("0000:04:00.0", 0x010802, Some("nvme"));
        let driver = FakeDriver::default().with_controller("0000:04:00.0", vec![namespace(1, 10)]);
        let err = backend(&tree, &driver)
            .open(&spec("pci://0000:04:00.0"), &OpenOptions::default())
            .unwrap_err();
        assert_eq!(err.code, libc::EBUSY);
        assert_eq!(driver.counters().connects, 0);
    }

    #[test]
    fn test_open_without_driver() {
        let tree = FakePciTree::new();
        tree.add("0000:03:00.0", 0x010802, Some("vfio-pci"));
        let backend = UpciBackend::new(tree.config(), None);
        let err = backend
            .open(&spec("pci://0000:03:00.0"), &OpenOptions::default())
            .unwrap_err();
        assert_eq!(err.code, libc::ENODEV);
    }

    #[test]
    fn test_open_inactive_namespace_releases_controller() {
        let tree = FakePciTree::new();
        tree.add("0000:03:00.0", 0x010802, Some("vfio-pci"));
        let driver = FakeDriver::default().with_controller("0000:03:00.0", vec![namespace(1, 10)]);
        let err = backend(&tree, &driver)
            .open(&spec("pci://0000:03:00.0?nsid=9"), &OpenOptions::default())
            .unwrap_err();
        assert_eq!(err.code, libc::ENODEV);
        let c = driver.counters();
        assert_eq!((c.connects, c.detaches), (1, 1));
    }

    #[test]
    fn test_drop_releases_controller() {
        let tree = FakePciTree::new();
        tree.add("0000:03:00.0", 0x010802, Some("vfio-pci"));
        let driver = FakeDriver::default().with_controller("0000:03:00.0", vec![namespace(1, 10)]);
        let res = backend(&tree, &driver)
            .open(&spec("0000:03:00.0"), &OpenOptions::default())
            .unwrap();
        drop(res);
        assert_eq!(driver.counters().detaches, 1);
    }

    #[test]
    fn test_enumerate() {
        let tree = FakePciTree::new();
        tree.add("0000:05:00.0", 0x010802, Some("vfio-pci"))
            .add("0000:03:00.0", 0x010802, Some("vfio-pci"))
            .add("0000:04:00.0", 0x010802, Some("nvme"))
            .add("0000:00:02.0", 0x030000, None);
        let driver = FakeDriver::default()
            .with_controller("0000:03:00.0", vec![namespace(1, 10), namespace(2, 20)])
            .with_controller("0000:05:00.0", vec![namespace(1, 30)]);

        let scan = backend(&tree, &driver)
            .enumerate(&EnumerateFilter::default())
            .unwrap();
        assert!(scan.failures.is_empty());
        let uris: Vec<_> = scan.entries.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec![
                "pci://0000:03:00.0?nsid=1",
                "pci://0000:03:00.0?nsid=2",
                "pci://0000:05:00.0?nsid=1",
            ]
        );
        assert_eq!(driver.counters().detaches, 2);
    }

    #[test]
    fn test_enumerate_without_driver_lists_controllers() {
        let tree = FakePciTree::new();
        tree.add("0000:03:00.0", 0x010802, Some("vfio-pci"));
        let entries = UpciBackend::new(tree.config(), None)
            .enumerate(&EnumerateFilter::default())
            .unwrap()
            .entries;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dtype, DeviceType::Controller);
        assert_eq!(entries[0].uri, "pci://0000:03:00.0");
    }

    #[test]
    fn test_enumerate_reports_unreachable_controller() {
        let tree = FakePciTree::new();
        tree.add("0000:03:00.0", 0x010802, Some("vfio-pci"))
            .add("0000:05:00.0", 0x010802, Some("vfio-pci"));
        // only the second controller answers
        let driver = FakeDriver::default().with_controller("0000:05:00.0", vec![namespace(1, 30)]);

        let scan = backend(&tree, &driver)
            .enumerate(&EnumerateFilter::default())
            .unwrap();
        let uris: Vec<_> = scan.entries.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(uris, vec!["pci://0000:05:00.0?nsid=1"]);
        assert!(scan.entries.iter().all(|e| e.dtype == DeviceType::Namespace));

        assert_eq!(scan.failures.len(), 1);
        assert_eq!(scan.failures[0].code, libc::ECONNREFUSED);
        assert!(scan.failures[0].message.contains("0000:03:00.0"));
    }
}
