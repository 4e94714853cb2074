//! Fixtures shared by the integration tests: a fake sysfs and /dev tree, an
//! image directory, and an in-memory controller driver.

#![allow(dead_code)]

use nvmedev::{
    Config, ControllerDriver, ControllerSession, NamespaceData, NamespaceType, NativeError,
    NativeResult, QpairId, TransportId,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub struct FakeSystem {
    pub dir: TempDir,
}

impl FakeSystem {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        for sub in ["sys/block", "sys/bus/pci/devices", "sys/bus/pci/drivers/vfio-pci", "dev", "images"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    /// Configuration pointing every backend into this tree
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.kblk.sysfs_root = self.dir.path().join("sys");
        config.kblk.dev_root = self.dir.path().join("dev");
        config.upci.sysfs_root = self.dir.path().join("sys");
        config.file.search_dirs = vec![self.images()];
        config
    }

    pub fn dev(&self, name: &str) -> PathBuf {
        self.dir.path().join("dev").join(name)
    }

    pub fn images(&self) -> PathBuf {
        self.dir.path().join("images")
    }

    pub fn kblk_uri(&self, name: &str) -> String {
        format!("kblk://{}", self.dev(name).display())
    }

    /// Block device of `sectors` 512-byte sectors with 4 KiB blocks
    pub fn add_block(&self, name: &str, nsid: u32, sectors: u64) -> &Self {
        let sys = self.dir.path().join("sys/block").join(name);
        std::fs::create_dir_all(sys.join("queue")).unwrap();
        std::fs::write(sys.join("nsid"), format!("{}\n", nsid)).unwrap();
        std::fs::write(sys.join("size"), format!("{}\n", sectors)).unwrap();
        std::fs::write(sys.join("queue/logical_block_size"), "4096\n").unwrap();
        std::fs::write(sys.join("queue/physical_block_size"), "4096\n").unwrap();
        std::fs::write(sys.join("queue/zoned"), "none\n").unwrap();
        std::fs::write(sys.join("queue/chunk_sectors"), "0\n").unwrap();
        std::fs::write(sys.join("nr_zones"), "0\n").unwrap();
        std::fs::write(sys.join("queue/max_hw_sectors_kb"), "512\n").unwrap();
        std::fs::write(self.dev(name), b"").unwrap();
        self
    }

    pub fn add_pci(&self, bdf: &str) -> &Self {
        let dev = self.dir.path().join("sys/bus/pci/devices").join(bdf);
        std::fs::create_dir_all(&dev).unwrap();
        std::fs::write(dev.join("class"), "0x010802\n").unwrap();
        std::fs::write(dev.join("config"), vec![0u8; 256]).unwrap();
        std::os::unix::fs::symlink(
            self.dir.path().join("sys/bus/pci/drivers/vfio-pci"),
            dev.join("driver"),
        )
        .unwrap();
        self
    }

    pub fn add_image(&self, name: &str, nbytes: usize) -> PathBuf {
        let path = self.images().join(name);
        std::fs::write(&path, vec![0u8; nbytes]).unwrap();
        path
    }
}

pub fn namespace(nsid: u32, nsze: u64) -> NamespaceData {
    NamespaceData {
        nsid,
        csi: NamespaceType::Nvm,
        lba_nbytes: 512,
        pba_nbytes: Some(4096),
        nsze,
        ncap: nsze,
        zone_nlbas: None,
        nzones: None,
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub connects: usize,
    pub detaches: usize,
    pub qpairs_allocated: usize,
    pub qpairs_freed: usize,
}

/// In-memory controllers keyed by transport address
#[derive(Debug, Default, Clone)]
pub struct FakeDriver {
    controllers: BTreeMap<String, Vec<NamespaceData>>,
    fail_detach: bool,
    pub counters: Arc<Mutex<Counters>>,
}

impl FakeDriver {
    /// Sessions whose detach reports EBUSY, after counting it
    pub fn failing_detach(mut self) -> Self {
        self.fail_detach = true;
        self
    }

    pub fn with_controller(mut self, traddr: &str, namespaces: Vec<NamespaceData>) -> Self {
        self.controllers.insert(traddr.to_string(), namespaces);
        self
    }

    pub fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap()
    }
}

impl ControllerDriver for FakeDriver {
    fn connect(&self, trid: &TransportId) -> NativeResult<Box<dyn ControllerSession>> {
        let namespaces = self
            .controllers
            .get(trid.address().as_ref())
            .cloned()
            .ok_or_else(|| NativeError::new(libc::ECONNREFUSED, format!("connect {}", trid)))?;
        self.counters().connects += 1;
        Ok(Box::new(FakeSession {
            namespaces,
            fail_detach: self.fail_detach,
            next_qpair: 1,
            counters: Arc::clone(&self.counters),
        }))
    }
}

#[derive(Debug)]
struct FakeSession {
    namespaces: Vec<NamespaceData>,
    fail_detach: bool,
    next_qpair: QpairId,
    counters: Arc<Mutex<Counters>>,
}

impl ControllerSession for FakeSession {
    fn active_namespaces(&self) -> NativeResult<Vec<u32>> {
        Ok(self.namespaces.iter().map(|ns| ns.nsid).collect())
    }

    fn namespace(&self, nsid: u32) -> NativeResult<NamespaceData> {
        self.namespaces
            .iter()
            .find(|ns| ns.nsid == nsid)
            .copied()
            .ok_or_else(|| NativeError::new(libc::ENODEV, format!("no namespace {}", nsid)))
    }

    fn mdts_nbytes(&self) -> Option<u32> {
        Some(64 * 1024)
    }

    fn alloc_io_qpair(&mut self, _io_queue_size: Option<u32>) -> NativeResult<QpairId> {
        let id = self.next_qpair;
        self.next_qpair += 1;
        self.counters.lock().unwrap().qpairs_allocated += 1;
        Ok(id)
    }

    fn free_io_qpair(&mut self, _qpair: QpairId) -> NativeResult<()> {
        self.counters.lock().unwrap().qpairs_freed += 1;
        Ok(())
    }

    fn detach(self: Box<Self>) -> NativeResult<()> {
        self.counters.lock().unwrap().detaches += 1;
        if self.fail_detach {
            return Err(NativeError::new(libc::EBUSY, "controller busy"));
        }
        Ok(())
    }
}
