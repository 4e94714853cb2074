//! The capability interface every backend implements

use nvmedev_core::{DeviceType, NamespaceType, NativeError, NativeGeometry, NativeResult, Specifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Access mode for an open device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Options for opening a device. Every field is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    /// Namespace to bind; backends fall back to the specifier's `?nsid=` and then to 1
    pub nsid: Option<u32>,
    pub access: Access,
    /// Create the backing file if missing (file backend only)
    pub create: bool,
    /// Size of a newly created backing file
    pub create_nbytes: Option<u64>,
    /// Logical block size override (file backend only)
    pub lba_nbytes: Option<u32>,
    /// I/O queue depth (user-space and fabric backends)
    pub io_queue_size: Option<u32>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nsid(mut self, nsid: u32) -> Self {
        self.nsid = Some(nsid);
        self
    }

    pub fn read_write(mut self) -> Self {
        self.access = Access::ReadWrite;
        self
    }

    pub fn create(mut self, nbytes: u64) -> Self {
        self.create = true;
        self.create_nbytes = Some(nbytes);
        self.access = Access::ReadWrite;
        self
    }

    pub fn lba_nbytes(mut self, lba_nbytes: u32) -> Self {
        self.lba_nbytes = Some(lba_nbytes);
        self
    }

    pub fn io_queue_size(mut self, depth: u32) -> Self {
        self.io_queue_size = Some(depth);
        self
    }

    /// Namespace from the options, else from the specifier's query
    pub fn resolve_nsid(&self, spec: &Specifier) -> NativeResult<Option<u32>> {
        match self.nsid {
            Some(nsid) => Ok(Some(nsid)),
            None => spec
                .query_nsid()
                .map_err(|e| NativeError::new(libc::EINVAL, e.to_string())),
        }
    }
}

/// Narrows an enumeration. The default filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerateFilter {
    pub scheme: Option<String>,
    pub uri_prefix: Option<String>,
}

impl EnumerateFilter {
    pub fn scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: Some(scheme.into()),
            uri_prefix: None,
        }
    }

    pub fn uri_prefix(prefix: impl Into<String>) -> Self {
        Self {
            scheme: None,
            uri_prefix: Some(prefix.into()),
        }
    }

    pub fn matches_scheme(&self, scheme: &str) -> bool {
        self.scheme
            .as_deref()
            .map_or(true, |s| s.eq_ignore_ascii_case(scheme))
    }

    pub fn matches_uri(&self, uri: &str) -> bool {
        self.uri_prefix
            .as_deref()
            .map_or(true, |prefix| uri.starts_with(prefix))
    }
}

/// Identity as a backend reports it, before it is packed into a flat record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeIdent {
    pub nsid: u32,
    pub nst: NamespaceType,
    pub dtype: DeviceType,
    /// Specifier that opens this device
    pub uri: String,
    /// The backend's own name for it (device node, transport id, path)
    pub be_uri: String,
}

/// Outcome of one backend's scan.
///
/// `failures` holds items the backend saw but could not describe (an
/// unreachable target, a controller that refused a connection). They do not
/// stop the scan; the dispatcher turns each into a warning.
#[derive(Debug, Default)]
pub struct BackendScan {
    pub entries: Vec<NativeIdent>,
    pub failures: Vec<NativeError>,
}

impl BackendScan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ident: NativeIdent) {
        self.entries.push(ident);
    }

    pub fn fail(&mut self, error: NativeError) {
        self.failures.push(error);
    }

    /// Drop entries the filter's URI prefix excludes. Failures are kept.
    pub fn retain_matching(&mut self, filter: &EnumerateFilter) {
        self.entries.retain(|ident| filter.matches_uri(&ident.uri));
    }
}

impl From<Vec<NativeIdent>> for BackendScan {
    fn from(entries: Vec<NativeIdent>) -> Self {
        Self {
            entries,
            failures: Vec::new(),
        }
    }
}

/// Contract between the dispatcher and one storage access method.
///
/// `open` is all-or-nothing: whatever it acquired before a failing step is
/// released before the error is returned. `close` releases everything it was
/// given, reporting the first failure after attempting every release.
pub trait Backend: fmt::Debug + Send + Sync {
    /// Backend-private resources bound to one open device
    type Resources: fmt::Debug + Send;

    const NAME: &'static str;
    const SCHEME: &'static str;

    /// Cheap, side-effect free recognition test. Never opens anything.
    fn probe(&self, spec: &Specifier) -> bool;

    fn open(&self, spec: &Specifier, opts: &OpenOptions) -> NativeResult<Self::Resources>;

    fn close(&self, resources: Self::Resources) -> NativeResult<()>;

    fn identify(&self, spec: &Specifier, resources: &Self::Resources) -> NativeResult<NativeIdent>;

    /// Devices reachable through this backend, in a stable discovery order.
    ///
    /// An `Err` means nothing could be scanned at all.
    fn enumerate(&self, filter: &EnumerateFilter) -> NativeResult<BackendScan>;

    fn geometry(&self, resources: &Self::Resources) -> NativeResult<NativeGeometry>;
}

/// Collects release results, keeping the first failure and logging the rest
#[derive(Debug, Default)]
pub(crate) struct FirstError {
    first: Option<NativeError>,
}

impl FirstError {
    pub(crate) fn record(&mut self, result: NativeResult<()>) {
        if let Err(e) = result {
            if self.first.is_none() {
                self.first = Some(e);
            } else {
                warn!(error = %e, "Additional failure while releasing resources");
            }
        }
    }

    pub(crate) fn finish(self) -> NativeResult<()> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
