//! File-emulated backend
//!
//! Presents a regular file as a single-namespace device. Geometry is derived
//! from the file's current length, so it tracks growth and truncation.

use nvmedev_core::specifier::SCHEME_FILE;
use nvmedev_core::{DeviceType, NamespaceType, NativeError, NativeGeometry, NativeResult, Specifier};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::capability::{
    Access, Backend, BackendScan, EnumerateFilter, FirstError, NativeIdent, OpenOptions,
};

/// File backend configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Directories whose regular files are listed by enumeration
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,

    /// Logical block size presented for every file
    #[serde(default = "default_lba_nbytes")]
    pub lba_nbytes: u32,

    /// Present files as zoned namespaces with this many blocks per zone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_nlbas: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

fn default_lba_nbytes() -> u32 {
    512
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            search_dirs: Vec::new(),
            lba_nbytes: default_lba_nbytes(),
            zone_nlbas: None,
        }
    }
}

/// An open backing file
#[derive(Debug)]
pub struct FileResources {
    file: Option<File>,
    path: PathBuf,
    lba_nbytes: u32,
    access: Access,
}

impl FileResources {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lba_nbytes(&self) -> u32 {
        self.lba_nbytes
    }

    fn file(&self) -> NativeResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| NativeError::new(libc::EBADF, "backing file already closed"))
    }
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    config: FileConfig,
}

impl FileBackend {
    pub fn new(config: FileConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    /// Whole emulated zones in a file of `len` bytes. `None` when zone
    /// emulation is off or not even one zone fits.
    fn zone_count(&self, len: u64, lba_nbytes: u32) -> Option<u32> {
        let zone_nlbas = self.config.zone_nlbas.filter(|&zone| zone > 0)?;
        if lba_nbytes == 0 {
            return None;
        }
        let nzones = len / lba_nbytes as u64 / zone_nlbas;
        (nzones > 0).then(|| u32::try_from(nzones).unwrap_or(u32::MAX))
    }

    fn nst(&self, len: u64, lba_nbytes: u32) -> NamespaceType {
        match self.zone_count(len, lba_nbytes) {
            Some(_) => NamespaceType::Zoned,
            None => NamespaceType::Nvm,
        }
    }

    fn file_len(resources: &FileResources) -> NativeResult<u64> {
        Ok(resources
            .file()?
            .metadata()
            .map_err(|e| NativeError::from_io(&e, format!("stat {}", resources.path.display())))?
            .len())
    }

    fn open_file(&self, path: &Path, opts: &OpenOptions) -> NativeResult<File> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(opts.access == Access::ReadWrite || opts.create)
            .create(opts.create)
            .open(path)
            .map_err(|e| NativeError::from_io(&e, format!("open {}", path.display())))?;

        let metadata = file
            .metadata()
            .map_err(|e| NativeError::from_io(&e, format!("stat {}", path.display())))?;
        if !metadata.is_file() {
            return Err(NativeError::new(
                libc::EINVAL,
                format!("{} is not a regular file", path.display()),
            ));
        }

        if opts.create && metadata.len() == 0 {
            if let Some(nbytes) = opts.create_nbytes {
                file.set_len(nbytes)
                    .map_err(|e| NativeError::from_io(&e, format!("truncate {}", path.display())))?;
            }
        }
        Ok(file)
    }
}

impl Backend for FileBackend {
    type Resources = FileResources;

    const NAME: &'static str = "file";
    const SCHEME: &'static str = SCHEME_FILE;

    fn probe(&self, spec: &Specifier) -> bool {
        match spec.scheme() {
            Some(scheme) => scheme == SCHEME_FILE,
            None => Path::new(spec.path()).is_file(),
        }
    }

    fn open(&self, spec: &Specifier, opts: &OpenOptions) -> NativeResult<FileResources> {
        let path = PathBuf::from(spec.path());
        let lba_nbytes = opts.lba_nbytes.unwrap_or(self.config.lba_nbytes);
        if lba_nbytes == 0 || !lba_nbytes.is_power_of_two() {
            return Err(NativeError::new(
                libc::EINVAL,
                format!("logical block size {} is not a power of two", lba_nbytes),
            ));
        }
        if let Some(nsid) = opts.resolve_nsid(spec)? {
            if nsid != 1 {
                return Err(NativeError::new(
                    libc::EINVAL,
                    format!("file devices have a single namespace, not {}", nsid),
                ));
            }
        }

        let existed = path.exists();
        let file = match self.open_file(&path, opts) {
            Ok(file) => file,
            Err(e) => {
                if opts.create && !existed {
                    if let Err(rm) = std::fs::remove_file(&path) {
                        if rm.kind() != ErrorKind::NotFound {
                            warn!(path = %path.display(), error = %rm, "Failed to remove partially created file");
                        }
                    }
                }
                return Err(e);
            }
        };

        let path = path.canonicalize().unwrap_or(path);
        debug!(path = %path.display(), lba_nbytes, created = !existed, "Opened backing file");
        Ok(FileResources {
            file: Some(file),
            path,
            lba_nbytes,
            access: if opts.create { Access::ReadWrite } else { opts.access },
        })
    }

    fn close(&self, mut resources: FileResources) -> NativeResult<()> {
        let mut errors = FirstError::default();
        if let Some(file) = resources.file.take() {
            if resources.access == Access::ReadWrite {
                errors.record(file.sync_all().map_err(|e| {
                    NativeError::from_io(&e, format!("sync {}", resources.path.display()))
                }));
            }
        }
        errors.finish()
    }

    fn identify(&self, spec: &Specifier, resources: &FileResources) -> NativeResult<NativeIdent> {
        let len = Self::file_len(resources)?;
        Ok(NativeIdent {
            nsid: 1,
            nst: self.nst(len, resources.lba_nbytes),
            dtype: DeviceType::File,
            uri: spec.raw().to_string(),
            be_uri: resources.path.to_string_lossy().into_owned(),
        })
    }

    fn enumerate(&self, filter: &EnumerateFilter) -> NativeResult<BackendScan> {
        let mut paths = Vec::new();
        for dir in &self.config.search_dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(dir = %dir.display(), "Search directory does not exist");
                    continue;
                }
                Err(e) => {
                    return Err(NativeError::from_io(&e, format!("read_dir {}", dir.display())))
                }
            };
            for entry in entries {
                let entry = entry
                    .map_err(|e| NativeError::from_io(&e, format!("read_dir {}", dir.display())))?;
                let path = entry.path();
                match std::fs::metadata(&path) {
                    Ok(metadata) if metadata.is_file() => paths.push((path, metadata.len())),
                    _ => {}
                }
            }
        }
        paths.sort();

        let entries: Vec<NativeIdent> = paths
            .into_iter()
            .map(|(path, len)| {
                let path = path.to_string_lossy().into_owned();
                NativeIdent {
                    nsid: 1,
                    nst: self.nst(len, self.config.lba_nbytes),
                    dtype: DeviceType::File,
                    uri: Specifier::compose(SCHEME_FILE, &path, &[]),
                    be_uri: path,
                }
            })
            .filter(|ident| filter.matches_uri(&ident.uri))
            .collect();
        debug!(count = entries.len(), "Enumerated backing files");
        Ok(entries.into())
    }

    fn geometry(&self, resources: &FileResources) -> NativeResult<NativeGeometry> {
        let len = Self::file_len(resources)?;
        let nzones = self.zone_count(len, resources.lba_nbytes);

        Ok(NativeGeometry {
            lba_nbytes: Some(resources.lba_nbytes),
            pba_nbytes: None,
            nlbas: None,
            capacity_nbytes: Some(len),
            zone_nlbas: nzones.and(self.config.zone_nlbas),
            nzones,
            mdts_nbytes: None,
        })
    }
}
