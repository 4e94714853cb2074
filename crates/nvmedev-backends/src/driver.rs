//! Controller driver seam for the user-space PCIe and fabric backends
//!
//! Those backends talk to an NVMe controller through a driver that owns the
//! admin queue. The driver is injected at context construction; this module
//! defines the contract and the [`AttachedNamespace`] guard that turns a
//! connected controller plus an I/O queue pair into one releasable resource.

use nvmedev_core::{FixedStr, NamespaceType, NativeError, NativeGeometry, NativeResult, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use tracing::{debug, warn};

use crate::capability::FirstError;

/// Capacity of the transport address field, terminator included
pub const TRADDR_CAPACITY: usize = 257;
/// Capacity of the transport service id field
pub const TRSVCID_CAPACITY: usize = 33;
/// Capacity of the subsystem NQN field
pub const SUBNQN_CAPACITY: usize = 224;

/// Default NVMe-oF service id
pub const DEFAULT_TRSVCID: &str = "4420";

/// Transport a controller is reached over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Pcie,
    Tcp,
    Rdma,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Pcie => "PCIe",
            TransportType::Tcp => "TCP",
            TransportType::Rdma => "RDMA",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pcie" => Some(TransportType::Pcie),
            "tcp" => Some(TransportType::Tcp),
            "rdma" => Some(TransportType::Rdma),
            _ => None,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a controller lives, in fixed-capacity fields
#[derive(Clone, PartialEq, Eq)]
pub struct TransportId {
    trtype: TransportType,
    traddr: FixedStr<TRADDR_CAPACITY>,
    trsvcid: FixedStr<TRSVCID_CAPACITY>,
    subnqn: FixedStr<SUBNQN_CAPACITY>,
}

impl TransportId {
    /// Local PCIe controller, by bus/device/function address
    pub fn pcie(bdf: &str) -> Result<Self> {
        Ok(Self {
            trtype: TransportType::Pcie,
            traddr: FixedStr::new(bdf, "traddr")?,
            trsvcid: FixedStr::empty(),
            subnqn: FixedStr::empty(),
        })
    }

    /// Fabric-attached subsystem
    pub fn fabric(trtype: TransportType, traddr: &str, trsvcid: &str, subnqn: &str) -> Result<Self> {
        Ok(Self {
            trtype,
            traddr: FixedStr::new(traddr, "traddr")?,
            trsvcid: FixedStr::new(trsvcid, "trsvcid")?,
            subnqn: FixedStr::new(subnqn, "subnqn")?,
        })
    }

    pub fn trtype(&self) -> TransportType {
        self.trtype
    }

    pub fn address(&self) -> Cow<'_, str> {
        self.traddr.to_string_lossy()
    }

    pub fn service_id(&self) -> Cow<'_, str> {
        self.trsvcid.to_string_lossy()
    }

    pub fn subnqn(&self) -> Cow<'_, str> {
        self.subnqn.to_string_lossy()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{}", self.trtype)?;
        if self.trtype != TransportType::Pcie {
            let adrfam = if self.traddr.as_bytes().contains(&b':') {
                "IPv6"
            } else {
                "IPv4"
            };
            write!(f, " adrfam:{}", adrfam)?;
        }
        write!(f, " traddr:{}", self.traddr)?;
        if !self.trsvcid.is_empty() {
            write!(f, " trsvcid:{}", self.trsvcid)?;
        }
        if !self.subnqn.is_empty() {
            write!(f, " subnqn:{}", self.subnqn)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportId({})", self)
    }
}

/// Namespace data as reported by the controller's identify command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceData {
    pub nsid: u32,
    /// Command set the namespace speaks
    pub csi: NamespaceType,
    pub lba_nbytes: u32,
    pub pba_nbytes: Option<u32>,
    /// Namespace size in logical blocks
    pub nsze: u64,
    /// Namespace capacity in logical blocks
    pub ncap: u64,
    pub zone_nlbas: Option<u64>,
    pub nzones: Option<u32>,
}

impl NamespaceData {
    pub fn native_geometry(&self, mdts_nbytes: Option<u32>) -> NativeGeometry {
        NativeGeometry {
            lba_nbytes: Some(self.lba_nbytes),
            pba_nbytes: self.pba_nbytes,
            nlbas: Some(self.nsze),
            capacity_nbytes: self.ncap.checked_mul(self.lba_nbytes as u64),
            zone_nlbas: self.zone_nlbas,
            nzones: self.nzones,
            mdts_nbytes,
        }
    }
}

/// I/O queue pair handle issued by a session
pub type QpairId = u16;

/// Connects to controllers
pub trait ControllerDriver: fmt::Debug + Send + Sync {
    fn connect(&self, trid: &TransportId) -> NativeResult<Box<dyn ControllerSession>>;
}

/// One connected controller
pub trait ControllerSession: fmt::Debug + Send {
    /// Active namespace ids, ascending
    fn active_namespaces(&self) -> NativeResult<Vec<u32>>;

    fn namespace(&self, nsid: u32) -> NativeResult<NamespaceData>;

    /// Maximum data transfer size, if the controller limits it
    fn mdts_nbytes(&self) -> Option<u32>;

    fn alloc_io_qpair(&mut self, io_queue_size: Option<u32>) -> NativeResult<QpairId>;

    fn free_io_qpair(&mut self, qpair: QpairId) -> NativeResult<()>;

    fn detach(self: Box<Self>) -> NativeResult<()>;
}

/// A connected controller with one namespace bound and an I/O qpair allocated.
///
/// Dropping it without [`release`](Self::release) frees the qpair and detaches,
/// logging any failure.
#[derive(Debug)]
pub struct AttachedNamespace {
    trid: TransportId,
    nsid: u32,
    session: Option<Box<dyn ControllerSession>>,
    qpair: Option<QpairId>,
}

impl AttachedNamespace {
    /// Connect, check that `nsid` is active, then allocate a qpair.
    ///
    /// A failing step releases whatever the earlier steps acquired.
    pub fn attach(
        driver: &dyn ControllerDriver,
        trid: &TransportId,
        nsid: u32,
        io_queue_size: Option<u32>,
    ) -> NativeResult<Self> {
        let session = driver.connect(trid)?;
        let mut attached = Self {
            trid: trid.clone(),
            nsid,
            session: Some(session),
            qpair: None,
        };

        let session = attached.session_mut()?;
        if !session.active_namespaces()?.contains(&nsid) {
            return Err(NativeError::new(
                libc::ENODEV,
                format!("namespace {} is not active on {}", nsid, trid),
            ));
        }
        let qpair = session.alloc_io_qpair(io_queue_size)?;
        attached.qpair = Some(qpair);

        debug!(trid = %trid, nsid, qpair, "Attached namespace");
        Ok(attached)
    }

    pub fn trid(&self) -> &TransportId {
        &self.trid
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn qpair(&self) -> Option<QpairId> {
        self.qpair
    }

    pub fn namespace_data(&self) -> NativeResult<NamespaceData> {
        self.session()?.namespace(self.nsid)
    }

    pub fn native_geometry(&self) -> NativeResult<NativeGeometry> {
        let session = self.session()?;
        Ok(session
            .namespace(self.nsid)?
            .native_geometry(session.mdts_nbytes()))
    }

    /// Free the qpair and detach, attempting both even if the first fails
    pub fn release(mut self) -> NativeResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> NativeResult<()> {
        let mut errors = FirstError::default();
        if let Some(mut session) = self.session.take() {
            if let Some(qpair) = self.qpair.take() {
                errors.record(session.free_io_qpair(qpair));
            }
            errors.record(session.detach());
        }
        errors.finish()
    }

    fn session(&self) -> NativeResult<&dyn ControllerSession> {
        self.session
            .as_deref()
            .ok_or_else(|| NativeError::new(libc::EBADF, "controller already detached"))
    }

    fn session_mut(&mut self) -> NativeResult<&mut Box<dyn ControllerSession>> {
        self.session
            .as_mut()
            .ok_or_else(|| NativeError::new(libc::EBADF, "controller already detached"))
    }
}

impl Drop for AttachedNamespace {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.release_inner() {
                warn!(trid = %self.trid, error = %e, "Failed to release controller");
            }
        }
    }
}

/// Connect, read every active namespace, detach
pub fn list_namespaces(
    driver: &dyn ControllerDriver,
    trid: &TransportId,
) -> NativeResult<Vec<NamespaceData>> {
    let session = driver.connect(trid)?;
    let result = session.active_namespaces().and_then(|nsids| {
        nsids
            .into_iter()
            .map(|nsid| session.namespace(nsid))
            .collect::<NativeResult<Vec<_>>>()
    });
    if let Err(e) = session.detach() {
        warn!(trid = %trid, error = %e, "Failed to detach after listing namespaces");
    }
    result
}
