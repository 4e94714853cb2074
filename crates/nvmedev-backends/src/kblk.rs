//! Kernel block backend
//!
//! Reaches namespaces through the operating system's block layer: the device
//! node is opened for access and the sysfs block attributes describe identity
//! and geometry. Identity and enumeration never issue commands to the device.

use nvmedev_core::specifier::SCHEME_KBLK;
use nvmedev_core::{DeviceType, NamespaceType, NativeError, NativeGeometry, NativeResult, Specifier};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::capability::{
    Access, Backend, BackendScan, EnumerateFilter, FirstError, NativeIdent, OpenOptions,
};
use crate::sysfs::{list_dir_names, read_attr, read_attr_u32, read_attr_u64};

/// sysfs reports sizes in 512-byte sectors regardless of the logical block size
const SECTOR_NBYTES: u64 = 512;

/// Kernel block backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KblkConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Root of the sysfs tree
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Directory holding device nodes
    #[serde(default = "default_dev_root")]
    pub dev_root: PathBuf,

    /// Also list block devices that are not NVMe namespaces
    #[serde(default)]
    pub include_non_nvme: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys")
}

fn default_dev_root() -> PathBuf {
    PathBuf::from("/dev")
}

impl Default for KblkConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            sysfs_root: default_sysfs_root(),
            dev_root: default_dev_root(),
            include_non_nvme: false,
        }
    }
}

/// An open kernel block device
#[derive(Debug)]
pub struct KblkResources {
    file: Option<File>,
    devnode: PathBuf,
    sysfs_dir: PathBuf,
    nsid: u32,
    access: Access,
}

impl KblkResources {
    pub fn devnode(&self) -> &Path {
        &self.devnode
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }
}

#[derive(Debug, Clone)]
pub struct KblkBackend {
    config: KblkConfig,
}

impl KblkBackend {
    pub fn new(config: KblkConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KblkConfig {
        &self.config
    }

    fn devnode(&self, spec: &Specifier) -> PathBuf {
        let path = Path::new(spec.path());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.dev_root.join(path)
        }
    }

    fn sysfs_dir(&self, name: &str) -> PathBuf {
        self.config.sysfs_root.join("block").join(name)
    }

    fn describe(&self, name: &str, sysfs_dir: &Path) -> NativeResult<NativeIdent> {
        let devnode = self.config.dev_root.join(name);
        let devnode = devnode.to_string_lossy();
        Ok(NativeIdent {
            nsid: read_nsid(sysfs_dir)?,
            nst: read_nst(sysfs_dir)?,
            dtype: device_type(name),
            uri: Specifier::compose(SCHEME_KBLK, &devnode, &[]),
            be_uri: devnode.into_owned(),
        })
    }
}

impl Backend for KblkBackend {
    type Resources = KblkResources;

    const NAME: &'static str = "kblk";
    const SCHEME: &'static str = SCHEME_KBLK;

    fn probe(&self, spec: &Specifier) -> bool {
        match spec.scheme() {
            Some(scheme) => scheme == SCHEME_KBLK,
            None => Path::new(spec.path()).starts_with(&self.config.dev_root),
        }
    }

    fn open(&self, spec: &Specifier, opts: &OpenOptions) -> NativeResult<KblkResources> {
        let devnode = self.devnode(spec);
        let name = devnode
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                NativeError::new(
                    libc::EINVAL,
                    format!("{} does not name a device", devnode.display()),
                )
            })?
            .to_string();

        let sysfs_dir = self.sysfs_dir(&name);
        if !sysfs_dir.is_dir() {
            return Err(NativeError::new(
                libc::ENODEV,
                format!("{} is not a block device known to sysfs", name),
            ));
        }

        let nsid = read_nsid(&sysfs_dir)?;
        if let Some(wanted) = opts.resolve_nsid(spec)? {
            if wanted != nsid {
                return Err(NativeError::new(
                    libc::EINVAL,
                    format!("{} is namespace {}, not {}", name, nsid, wanted),
                ));
            }
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(opts.access == Access::ReadWrite)
            .open(&devnode)
            .map_err(|e| NativeError::from_io(&e, format!("open {}", devnode.display())))?;

        debug!(device = %devnode.display(), nsid, access = ?opts.access, "Opened block device");
        Ok(KblkResources {
            file: Some(file),
            devnode,
            sysfs_dir,
            nsid,
            access: opts.access,
        })
    }

    fn close(&self, mut resources: KblkResources) -> NativeResult<()> {
        let mut errors = FirstError::default();
        if let Some(file) = resources.file.take() {
            if resources.access == Access::ReadWrite {
                errors.record(file.sync_all().map_err(|e| {
                    NativeError::from_io(&e, format!("sync {}", resources.devnode.display()))
                }));
            }
            drop(file);
        }
        errors.finish()
    }

    fn identify(&self, spec: &Specifier, resources: &KblkResources) -> NativeResult<NativeIdent> {
        let name = resources
            .sysfs_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        Ok(NativeIdent {
            nsid: resources.nsid,
            nst: read_nst(&resources.sysfs_dir)?,
            dtype: device_type(name),
            uri: spec.raw().to_string(),
            be_uri: resources.devnode.to_string_lossy().into_owned(),
        })
    }

    fn enumerate(&self, filter: &EnumerateFilter) -> NativeResult<BackendScan> {
        let block_dir = self.config.sysfs_root.join("block");
        let mut nvme = Vec::new();
        let mut other = Vec::new();
        for name in list_dir_names(&block_dir)? {
            match parse_namespace_name(&name) {
                Some(key) => nvme.push((key, name)),
                None if self.config.include_non_nvme => other.push(name),
                None => trace!(device = %name, "Skipping non-NVMe block device"),
            }
        }
        nvme.sort();

        let mut entries = Vec::new();
        for name in nvme.into_iter().map(|(_, name)| name).chain(other) {
            let ident = self.describe(&name, &block_dir.join(&name))?;
            if filter.matches_uri(&ident.uri) {
                entries.push(ident);
            }
        }
        debug!(count = entries.len(), "Enumerated block devices");
        Ok(entries.into())
    }

    fn geometry(&self, resources: &KblkResources) -> NativeResult<NativeGeometry> {
        let dir = &resources.sysfs_dir;
        let queue = dir.join("queue");

        let lba_nbytes = read_attr_u32(&queue.join("logical_block_size"))?;
        let pba_nbytes = read_attr_u32(&queue.join("physical_block_size"))?;
        let capacity_nbytes = read_attr_u64(&dir.join("size"))?
            .map(sectors_to_nbytes)
            .transpose()?;

        let (zone_nlbas, nzones) = if read_nst(dir)? == NamespaceType::Zoned {
            let chunk_sectors = read_attr_u64(&queue.join("chunk_sectors"))?;
            let zone_nlbas = match (chunk_sectors, lba_nbytes) {
                (Some(sectors), Some(lba)) if lba > 0 => Some(sectors_to_nbytes(sectors)? / lba as u64),
                _ => None,
            };
            (zone_nlbas, read_attr_u32(&dir.join("nr_zones"))?)
        } else {
            (None, None)
        };

        let mdts_nbytes = read_attr_u64(&queue.join("max_hw_sectors_kb"))?
            .map(|kb| {
                kb.checked_mul(1024)
                    .map(|nbytes| u32::try_from(nbytes).unwrap_or(u32::MAX))
                    .ok_or_else(|| {
                        NativeError::new(libc::ERANGE, format!("max_hw_sectors_kb {} overflows", kb))
                    })
            })
            .transpose()?;

        Ok(NativeGeometry {
            lba_nbytes,
            pba_nbytes,
            nlbas: None,
            capacity_nbytes,
            zone_nlbas,
            nzones,
            mdts_nbytes,
        })
    }
}

/// `nvme<ctrl>n<ns>` to its sort key. Partitions and hidden multipath paths do not match.
fn parse_namespace_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("nvme")?;
    let (ctrl, ns) = rest.split_once('n')?;
    if ctrl.is_empty() || ns.is_empty() {
        return None;
    }
    if !ctrl.bytes().all(|b| b.is_ascii_digit()) || !ns.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((ctrl.parse().ok()?, ns.parse().ok()?))
}

fn sectors_to_nbytes(sectors: u64) -> NativeResult<u64> {
    sectors
        .checked_mul(SECTOR_NBYTES)
        .ok_or_else(|| NativeError::new(libc::ERANGE, format!("{} sectors overflow", sectors)))
}

fn device_type(name: &str) -> DeviceType {
    if parse_namespace_name(name).is_some() {
        DeviceType::Namespace
    } else {
        DeviceType::BlockDevice
    }
}

fn read_nsid(sysfs_dir: &Path) -> NativeResult<u32> {
    Ok(read_attr_u32(&sysfs_dir.join("nsid"))?.unwrap_or(1))
}

fn read_nst(sysfs_dir: &Path) -> NativeResult<NamespaceType> {
    let zoned = read_attr(&sysfs_dir.join("queue").join("zoned"))?;
    Ok(match zoned.as_deref() {
        Some("host-managed") | Some("host-aware") => NamespaceType::Zoned,
        _ => NamespaceType::Nvm,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake sysfs and /dev trees

    use std::path::PathBuf;
    use tempfile::TempDir;

    use super::KblkConfig;

    pub struct FakeBlockTree {
        pub dir: TempDir,
    }

    impl FakeBlockTree {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("sys/block")).unwrap();
            std::fs::create_dir_all(dir.path().join("dev")).unwrap();
            Self { dir }
        }

        pub fn config(&self) -> KblkConfig {
            KblkConfig {
                sysfs_root: self.dir.path().join("sys"),
                dev_root: self.dir.path().join("dev"),
                ..KblkConfig::default()
            }
        }

        pub fn dev(&self, name: &str) -> PathBuf {
            self.dir.path().join("dev").join(name)
        }

        /// Add a device with `sectors` 512-byte sectors and the given block sizes
        pub fn add(&self, name: &str, nsid: Option<u32>, sectors: u64, lba: u32, pba: u32) -> &Self {
            let sys = self.sys(name);
            std::fs::create_dir_all(sys.join("queue")).unwrap();
            if let Some(nsid) = nsid {
                std::fs::write(sys.join("nsid"), format!("{}\n", nsid)).unwrap();
            }
            std::fs::write(sys.join("size"), format!("{}\n", sectors)).unwrap();
            std::fs::write(sys.join("queue/logical_block_size"), format!("{}\n", lba)).unwrap();
            std::fs::write(sys.join("queue/physical_block_size"), format!("{}\n", pba)).unwrap();
            std::fs::write(sys.join("queue/zoned"), "none\n").unwrap();
            std::fs::write(sys.join("queue/max_hw_sectors_kb"), "128\n").unwrap();
            std::fs::write(self.dev(name), b"").unwrap();
            self
        }

        pub fn make_zoned(&self, name: &str, chunk_sectors: u64, nr_zones: u32) {
            let sys = self.sys(name);
            std::fs::write(sys.join("queue/zoned"), "host-managed\n").unwrap();
            std::fs::write(sys.join("queue/chunk_sectors"), format!("{}\n", chunk_sectors)).unwrap();
            std::fs::write(sys.join("nr_zones"), format!("{}\n", nr_zones)).unwrap();
        }

        pub fn set_sectors(&self, name: &str, sectors: u64) {
            std::fs::write(self.sys(name).join("size"), format!("{}\n", sectors)).unwrap();
        }

        fn sys(&self, name: &str) -> PathBuf {
            self.dir.path().join("sys/block").join(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBlockTree;
    use super::*;

    fn spec(s: &str) -> Specifier {
        Specifier::parse(s).unwrap()
    }

    #[test]
    fn test_parse_namespace_name() {
        assert_eq!(parse_namespace_name("nvme0n1"), Some((0, 1)));
        assert_eq!(parse_namespace_name("nvme12n3"), Some((12, 3)));
        assert_eq!(parse_namespace_name("nvme0n1p1"), None);
        assert_eq!(parse_namespace_name("nvme0c0n1"), None);
        assert_eq!(parse_namespace_name("sda"), None);
        assert_eq!(parse_namespace_name("nvmen1"), None);
    }

    #[test]
    fn test_probe() {
        let tree = FakeBlockTree::new();
        let backend = KblkBackend::new(tree.config());

        assert!(backend.probe(&spec("kblk:///dev/nvme0n1")));
        assert!(backend.probe(&spec(&tree.dev("nvme0n1").to_string_lossy())));
        assert!(!backend.probe(&spec("pci://0000:03:00.0")));
        assert!(!backend.probe(&spec("/tmp/disk.img")));
    }

    #[test]
    fn test_open_identify_geometry_close() {
        let tree = FakeBlockTree::new();
        tree.add("nvme0n1", Some(1), 2_097_152, 4096, 4096);
        let backend = KblkBackend::new(tree.config());
        let s = spec(&format!("kblk://{}", tree.dev("nvme0n1").display()));

        let res = backend.open(&s, &OpenOptions::default()).unwrap();
        assert_eq!(res.nsid(), 1);

        let ident = backend.identify(&s, &res).unwrap();
        assert_eq!(ident.nsid, 1);
        assert_eq!(ident.nst, NamespaceType::Nvm);
        assert_eq!(ident.dtype, DeviceType::Namespace);
        assert_eq!(ident.uri, s.raw());
        assert_eq!(ident.be_uri, tree.dev("nvme0n1").to_string_lossy());

        let geo = backend.geometry(&res).unwrap();
        assert_eq!(geo.lba_nbytes, Some(4096));
        assert_eq!(geo.capacity_nbytes, Some(1 << 30));
        assert_eq!(geo.mdts_nbytes, Some(128 * 1024));
        assert_eq!(geo.zone_nlbas, None);

        backend.close(res).unwrap();
    }

    #[test]
    fn test_geometry_is_live() {
        let tree = FakeBlockTree::new();
        tree.add("nvme0n1", Some(1), 1024, 512, 512);
        let backend = KblkBackend::new(tree.config());
        let s = spec(&tree.dev("nvme0n1").to_string_lossy());

        let res = backend.open(&s, &OpenOptions::default()).unwrap();
        assert_eq!(backend.geometry(&res).unwrap().capacity_nbytes, Some(1024 * 512));
        tree.set_sectors("nvme0n1", 2048);
        assert_eq!(backend.geometry(&res).unwrap().capacity_nbytes, Some(2048 * 512));
    }

    #[test]
    fn test_zoned_geometry() {
        let tree = FakeBlockTree::new();
        tree.add("nvme0n2", Some(2), 1 << 20, 4096, 4096);
        tree.make_zoned("nvme0n2", 1 << 14, 64);
        let backend = KblkBackend::new(tree.config());
        let s = spec(&tree.dev("nvme0n2").to_string_lossy());

        let res = backend.open(&s, &OpenOptions::default()).unwrap();
        assert_eq!(backend.identify(&s, &res).unwrap().nst, NamespaceType::Zoned);
        let geo = backend.geometry(&res).unwrap();
        assert_eq!(geo.zone_nlbas, Some((1 << 14) * 512 / 4096));
        assert_eq!(geo.nzones, Some(64));
    }

    #[test]
    fn test_geometry_rejects_overflowing_attributes() {
        let tree = FakeBlockTree::new();
        tree.add("nvme0n2", Some(2), 1 << 20, 4096, 4096);
        tree.make_zoned("nvme0n2", u64::MAX / 2, 64);
        let backend = KblkBackend::new(tree.config());
        let s = spec(&tree.dev("nvme0n2").to_string_lossy());
        let res = backend.open(&s, &OpenOptions::default()).unwrap();
        assert_eq!(backend.geometry(&res).unwrap_err().code, libc::ERANGE);

        tree.make_zoned("nvme0n2", 1 << 14, 64);
        let queue = tree.dir.path().join("sys/block/nvme0n2/queue");
        std::fs::write(queue.join("max_hw_sectors_kb"), format!("{}\n", u64::MAX / 4)).unwrap();
        assert_eq!(backend.geometry(&res).unwrap_err().code, libc::ERANGE);

        std::fs::write(queue.join("max_hw_sectors_kb"), "128\n").unwrap();
        tree.set_sectors("nvme0n2", u64::MAX);
        assert_eq!(backend.geometry(&res).unwrap_err().code, libc::ERANGE);
    }

    #[test]
    fn test_open_missing_device() {
        let tree = FakeBlockTree::new();
        let backend = KblkBackend::new(tree.config());
        let err = backend
            .open(&spec("kblk:///dev/nvme9n1"), &OpenOptions::default())
            .unwrap_err();
        assert_eq!(err.code, libc::ENODEV);
    }

    #[test]
    fn test_open_rejects_wrong_nsid() {
        let tree = FakeBlockTree::new();
        tree.add("nvme0n1", Some(1), 1024, 512, 512);
        let backend = KblkBackend::new(tree.config());
        let s = spec(&format!("kblk://{}?nsid=2", tree.dev("nvme0n1").display()));
        let err = backend.open(&s, &OpenOptions::default()).unwrap_err();
        assert_eq!(err.code, libc::EINVAL);
    }

    #[test]
    fn test_enumerate_order_and_filter() {
        let tree = FakeBlockTree::new();
        tree.add("nvme1n1", Some(1), 1024, 512, 512)
            .add("nvme0n2", Some(2), 1024, 512, 512)
            .add("nvme0n1", Some(1), 1024, 512, 512)
            .add("nvme10n1", Some(1), 1024, 512, 512)
            .add("sda", None, 1024, 512, 512);
        let backend = KblkBackend::new(tree.config());

        let entries = backend.enumerate(&EnumerateFilter::default()).unwrap().entries;
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.be_uri.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["nvme0n1", "nvme0n2", "nvme1n1", "nvme10n1"]);
        assert!(entries[0].uri.starts_with("kblk://"));
        assert_eq!(entries[1].nsid, 2);

        let prefix = format!("kblk://{}", tree.dev("nvme0").display());
        let entries = backend.enumerate(&EnumerateFilter::uri_prefix(prefix)).unwrap().entries;
        assert_eq!(entries.len(), 2);

        let mut config = tree.config();
        config.include_non_nvme = true;
        let entries = KblkBackend::new(config)
            .enumerate(&EnumerateFilter::default())
            .unwrap()
            .entries;
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].dtype, DeviceType::BlockDevice);
    }

    #[test]
    fn test_enumerate_without_sysfs_fails() {
        let backend = KblkBackend::new(KblkConfig {
            sysfs_root: PathBuf::from("/nonexistent/sys"),
            ..KblkConfig::default()
        });
        assert_eq!(
            backend.enumerate(&EnumerateFilter::default()).unwrap_err().code,
            libc::ENOENT
        );
    }
}
