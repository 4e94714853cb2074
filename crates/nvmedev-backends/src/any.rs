//! Closed set of backends, dispatched by match

use nvmedev_core::{NativeError, NativeGeometry, NativeResult, Specifier};
use tracing::warn;

use crate::capability::{Backend, BackendScan, EnumerateFilter, NativeIdent, OpenOptions};
use crate::fabric::{FabricBackend, FabricResources};
use crate::file::{FileBackend, FileResources};
use crate::kblk::{KblkBackend, KblkResources};
use crate::upci::{UpciBackend, UpciResources};

/// One of the built-in backends
#[derive(Debug, Clone)]
pub enum AnyBackend {
    KernelBlock(KblkBackend),
    UserPci(UpciBackend),
    Fabric(FabricBackend),
    File(FileBackend),
}

/// Resources of whichever backend opened the device
#[derive(Debug)]
pub enum AnyResources {
    KernelBlock(KblkResources),
    UserPci(UpciResources),
    Fabric(FabricResources),
    File(FileResources),
}

impl AnyResources {
    fn kind(&self) -> &'static str {
        match self {
            AnyResources::KernelBlock(_) => KblkBackend::NAME,
            AnyResources::UserPci(_) => UpciBackend::NAME,
            AnyResources::Fabric(_) => FabricBackend::NAME,
            AnyResources::File(_) => FileBackend::NAME,
        }
    }
}

fn mismatched(backend: &str, resources: &AnyResources) -> NativeError {
    NativeError::new(
        libc::EINVAL,
        format!(
            "{} backend handed resources opened by {}",
            backend,
            resources.kind()
        ),
    )
}

impl AnyBackend {
    pub fn name(&self) -> &'static str {
        match self {
            AnyBackend::KernelBlock(_) => KblkBackend::NAME,
            AnyBackend::UserPci(_) => UpciBackend::NAME,
            AnyBackend::Fabric(_) => FabricBackend::NAME,
            AnyBackend::File(_) => FileBackend::NAME,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            AnyBackend::KernelBlock(_) => KblkBackend::SCHEME,
            AnyBackend::UserPci(_) => UpciBackend::SCHEME,
            AnyBackend::Fabric(_) => FabricBackend::SCHEME,
            AnyBackend::File(_) => FileBackend::SCHEME,
        }
    }

    pub fn probe(&self, spec: &Specifier) -> bool {
        match self {
            AnyBackend::KernelBlock(b) => b.probe(spec),
            AnyBackend::UserPci(b) => b.probe(spec),
            AnyBackend::Fabric(b) => b.probe(spec),
            AnyBackend::File(b) => b.probe(spec),
        }
    }

    pub fn open(&self, spec: &Specifier, opts: &OpenOptions) -> NativeResult<AnyResources> {
        match self {
            AnyBackend::KernelBlock(b) => b.open(spec, opts).map(AnyResources::KernelBlock),
            AnyBackend::UserPci(b) => b.open(spec, opts).map(AnyResources::UserPci),
            AnyBackend::Fabric(b) => b.open(spec, opts).map(AnyResources::Fabric),
            AnyBackend::File(b) => b.open(spec, opts).map(AnyResources::File),
        }
    }

    /// Release resources. Resources from another backend are dropped and reported.
    pub fn close(&self, resources: AnyResources) -> NativeResult<()> {
        match (self, resources) {
            (AnyBackend::KernelBlock(b), AnyResources::KernelBlock(r)) => b.close(r),
            (AnyBackend::UserPci(b), AnyResources::UserPci(r)) => b.close(r),
            (AnyBackend::Fabric(b), AnyResources::Fabric(r)) => b.close(r),
            (AnyBackend::File(b), AnyResources::File(r)) => b.close(r),
            (b, r) => {
                let err = mismatched(b.name(), &r);
                warn!(error = %err, "Dropping mismatched resources");
                drop(r);
                Err(err)
            }
        }
    }

    pub fn identify(&self, spec: &Specifier, resources: &AnyResources) -> NativeResult<NativeIdent> {
        match (self, resources) {
            (AnyBackend::KernelBlock(b), AnyResources::KernelBlock(r)) => b.identify(spec, r),
            (AnyBackend::UserPci(b), AnyResources::UserPci(r)) => b.identify(spec, r),
            (AnyBackend::Fabric(b), AnyResources::Fabric(r)) => b.identify(spec, r),
            (AnyBackend::File(b), AnyResources::File(r)) => b.identify(spec, r),
            (b, r) => Err(mismatched(b.name(), r)),
        }
    }

    pub fn enumerate(&self, filter: &EnumerateFilter) -> NativeResult<BackendScan> {
        match self {
            AnyBackend::KernelBlock(b) => b.enumerate(filter),
            AnyBackend::UserPci(b) => b.enumerate(filter),
            AnyBackend::Fabric(b) => b.enumerate(filter),
            AnyBackend::File(b) => b.enumerate(filter),
        }
    }

    pub fn geometry(&self, resources: &AnyResources) -> NativeResult<NativeGeometry> {
        match (self, resources) {
            (AnyBackend::KernelBlock(b), AnyResources::KernelBlock(r)) => b.geometry(r),
            (AnyBackend::UserPci(b), AnyResources::UserPci(r)) => b.geometry(r),
            (AnyBackend::Fabric(b), AnyResources::Fabric(r)) => b.geometry(r),
            (AnyBackend::File(b), AnyResources::File(r)) => b.geometry(r),
            (b, r) => Err(mismatched(b.name(), r)),
        }
    }
}

impl From<KblkBackend> for AnyBackend {
    fn from(b: KblkBackend) -> Self {
        AnyBackend::KernelBlock(b)
    }
}

impl From<UpciBackend> for AnyBackend {
    fn from(b: UpciBackend) -> Self {
        AnyBackend::UserPci(b)
    }
}

impl From<FabricBackend> for AnyBackend {
    fn from(b: FabricBackend) -> Self {
        AnyBackend::Fabric(b)
    }
}

impl From<FileBackend> for AnyBackend {
    fn from(b: FileBackend) -> Self {
        AnyBackend::File(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileConfig;
    use crate::kblk::KblkConfig;
    use tempfile::TempDir;

    #[test]
    fn test_names_and_schemes() {
        let kblk = AnyBackend::from(KblkBackend::new(KblkConfig::default()));
        assert_eq!((kblk.name(), kblk.scheme()), ("kblk", "kblk"));
        let upci = AnyBackend::from(UpciBackend::new(Default::default(), None));
        assert_eq!((upci.name(), upci.scheme()), ("upci", "pci"));
        let fab = AnyBackend::from(FabricBackend::new(Default::default(), None));
        assert_eq!((fab.name(), fab.scheme()), ("fab", "fab"));
        let file = AnyBackend::from(FileBackend::new(FileConfig::default()));
        assert_eq!((file.name(), file.scheme()), ("file", "file"));
    }

    #[test]
    fn test_mismatched_resources_are_rejected() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("disk.img");
        std::fs::write(&img, vec![0u8; 4096]).unwrap();
        let spec = Specifier::parse(&format!("file://{}", img.display())).unwrap();

        let file = AnyBackend::from(FileBackend::new(FileConfig::default()));
        let kblk = AnyBackend::from(KblkBackend::new(KblkConfig::default()));
        let res = file.open(&spec, &OpenOptions::default()).unwrap();

        assert_eq!(kblk.geometry(&res).unwrap_err().code, libc::EINVAL);
        assert_eq!(kblk.identify(&spec, &res).unwrap_err().code, libc::EINVAL);
        assert_eq!(kblk.close(res).unwrap_err().code, libc::EINVAL);
    }
}
