//! Geometry descriptor and the normalization of backend-native geometry
//!
//! Backends report whatever their native layer knows: sysfs attributes, a
//! file length, an Identify Namespace payload. [`Geometry::normalize`] folds
//! those into one model expressed in whole logical blocks.

use bytemuck::{Pod, Zeroable};
use serde::Serialize;
use static_assertions::const_assert_eq;
use std::fmt;
use std::mem::size_of;
use tracing::{debug, warn};

use crate::error::{NativeError, NativeResult};

/// Upper bound on logical blocks moved by one command
pub const MAX_TRANSFER_LBAS: u64 = 256;

/// Geometry as a backend reports it; any field may be missing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeGeometry {
    pub lba_nbytes: Option<u32>,
    pub pba_nbytes: Option<u32>,
    /// Namespace size in logical blocks
    pub nlbas: Option<u64>,
    /// Namespace capacity in bytes
    pub capacity_nbytes: Option<u64>,
    /// Zone size in logical blocks
    pub zone_nlbas: Option<u64>,
    pub nzones: Option<u32>,
    /// Maximum data transfer size in bytes
    pub mdts_nbytes: Option<u32>,
}

/// Zone layout of a zoned namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ZoneGeometry {
    pub zone_nlbas: u64,
    pub nzones: u32,
}

/// Information lost or assumed while normalizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryWarning {
    /// Byte capacity was not a multiple of the logical block size; the tail was dropped
    TruncatedCapacity {
        reported_nbytes: u64,
        dropped_nbytes: u64,
    },
}

impl fmt::Display for GeometryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryWarning::TruncatedCapacity {
                reported_nbytes,
                dropped_nbytes,
            } => write!(
                f,
                "capacity of {} bytes is not block aligned, dropped {} bytes",
                reported_nbytes, dropped_nbytes
            ),
        }
    }
}

/// Normalized geometry of an open device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Geometry {
    pub lba_nbytes: u32,
    pub pba_nbytes: u32,
    /// Total capacity in whole logical blocks
    pub nlbas: u64,
    /// `None` means the device is not zoned
    pub zones: Option<ZoneGeometry>,
    pub capacity_nbytes: Option<u64>,
    pub mdts_nbytes: Option<u32>,
    pub warnings: Vec<GeometryWarning>,
}

impl Geometry {
    /// Fold backend-native geometry into the normalized model.
    ///
    /// Logical block size is mandatory; physical block size falls back to it;
    /// zones are present only when both zone size and count are non-zero; a
    /// byte capacity is truncated to whole blocks, never rounded up.
    pub fn normalize(native: &NativeGeometry) -> NativeResult<Geometry> {
        let lba_nbytes = native.lba_nbytes.filter(|&n| n > 0).ok_or_else(|| {
            NativeError::new(libc::EINVAL, "backend reported no logical block size")
        })?;
        let pba_nbytes = native.pba_nbytes.filter(|&n| n > 0).unwrap_or(lba_nbytes);

        let mut warnings = Vec::new();
        let nlbas = match (native.nlbas, native.capacity_nbytes) {
            (Some(nlbas), _) => nlbas,
            (None, Some(nbytes)) => {
                let dropped = nbytes % lba_nbytes as u64;
                if dropped != 0 {
                    warn!(
                        reported_nbytes = nbytes,
                        dropped_nbytes = dropped,
                        lba_nbytes,
                        "Capacity not block aligned, truncating"
                    );
                    warnings.push(GeometryWarning::TruncatedCapacity {
                        reported_nbytes: nbytes,
                        dropped_nbytes: dropped,
                    });
                }
                nbytes / lba_nbytes as u64
            }
            (None, None) => {
                return Err(NativeError::new(
                    libc::EINVAL,
                    "backend reported neither block count nor capacity",
                ))
            }
        };

        let zones = match (native.zone_nlbas, native.nzones) {
            (Some(zone_nlbas), Some(nzones)) if zone_nlbas > 0 && nzones > 0 => {
                Some(ZoneGeometry { zone_nlbas, nzones })
            }
            (None, None) => None,
            (zone_nlbas, nzones) => {
                debug!(?zone_nlbas, ?nzones, "Incomplete zone report, treating as not zoned");
                None
            }
        };

        Ok(Geometry {
            lba_nbytes,
            pba_nbytes,
            nlbas,
            zones,
            capacity_nbytes: native.capacity_nbytes,
            mdts_nbytes: native.mdts_nbytes.filter(|&n| n > 0),
            warnings,
        })
    }

    pub fn is_zoned(&self) -> bool {
        self.zones.is_some()
    }

    /// Addressable bytes (`nlbas * lba_nbytes`), saturating
    pub fn nbytes(&self) -> u64 {
        self.nlbas.saturating_mul(self.lba_nbytes as u64)
    }

    /// Logical blocks one command may move: the transfer limit in blocks,
    /// capped at [`MAX_TRANSFER_LBAS`], and never below one
    pub fn max_transfer_lbas(&self) -> u64 {
        match self.mdts_nbytes {
            Some(mdts) => (mdts as u64 / self.lba_nbytes as u64).clamp(1, MAX_TRANSFER_LBAS),
            None => MAX_TRANSFER_LBAS,
        }
    }

    /// Flat view for foreign callers
    pub fn to_raw(&self) -> RawGeometry {
        let mut raw = RawGeometry {
            lba_nbytes: self.lba_nbytes,
            pba_nbytes: self.pba_nbytes,
            nlbas: self.nlbas,
            ..RawGeometry::zeroed()
        };
        if let Some(zones) = self.zones {
            raw.flags |= RawGeometry::FLAG_ZONED;
            raw.zone_nlbas = zones.zone_nlbas;
            raw.nzones = zones.nzones;
        }
        if let Some(capacity) = self.capacity_nbytes {
            raw.flags |= RawGeometry::FLAG_CAPACITY;
            raw.capacity_nbytes = capacity;
        }
        if let Some(mdts) = self.mdts_nbytes {
            raw.flags |= RawGeometry::FLAG_MDTS;
            raw.mdts_nbytes = mdts;
        }
        raw
    }

    /// Rebuild from the flat view; warnings do not survive the trip
    pub fn from_raw(raw: &RawGeometry) -> Geometry {
        Geometry {
            lba_nbytes: raw.lba_nbytes,
            pba_nbytes: raw.pba_nbytes,
            nlbas: raw.nlbas,
            zones: (raw.flags & RawGeometry::FLAG_ZONED != 0).then_some(ZoneGeometry {
                zone_nlbas: raw.zone_nlbas,
                nzones: raw.nzones,
            }),
            capacity_nbytes: (raw.flags & RawGeometry::FLAG_CAPACITY != 0)
                .then_some(raw.capacity_nbytes),
            mdts_nbytes: (raw.flags & RawGeometry::FLAG_MDTS != 0).then_some(raw.mdts_nbytes),
            warnings: Vec::new(),
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "geometry:")?;
        writeln!(f, "  type: {}", if self.is_zoned() { "zoned" } else { "conventional" })?;
        writeln!(f, "  lba_nbytes: {}", self.lba_nbytes)?;
        writeln!(f, "  pba_nbytes: {}", self.pba_nbytes)?;
        writeln!(f, "  nlbas: {}", self.nlbas)?;
        writeln!(f, "  nbytes: {}", self.nbytes())?;
        if let Some(zones) = self.zones {
            writeln!(f, "  zone_nlbas: {}", zones.zone_nlbas)?;
            writeln!(f, "  nzones: {}", zones.nzones)?;
        }
        if let Some(capacity) = self.capacity_nbytes {
            writeln!(f, "  capacity_nbytes: {}", capacity)?;
        }
        if let Some(mdts) = self.mdts_nbytes {
            writeln!(f, "  mdts_nbytes: {}", mdts)?;
        }
        for warning in &self.warnings {
            writeln!(f, "  # {}", warning)?;
        }
        Ok(())
    }
}

/// Flat geometry (48 bytes). Optional fields are valid only when their flag is set.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RawGeometry {
    pub lba_nbytes: u32,
    pub pba_nbytes: u32,
    pub nlbas: u64,
    pub zone_nlbas: u64,
    pub nzones: u32,
    pub flags: u32,
    pub capacity_nbytes: u64,
    pub mdts_nbytes: u32,
    pub _rsvd: u32,
}

const_assert_eq!(size_of::<RawGeometry>(), 48);

impl RawGeometry {
    pub const FLAG_ZONED: u32 = 1 << 0;
    pub const FLAG_CAPACITY: u32 = 1 << 1;
    pub const FLAG_MDTS: u32 = 1 << 2;
}
