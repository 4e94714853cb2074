//! Enumeration result: the owned collection of identity records a scan produces
//!
//! Entries keep scan order (registry order, then each backend's discovery
//! order), so two scans of unchanged hardware produce the same bytes and the
//! same [`Enumeration::digest`].

use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::ident::Ident;

/// Bytes in the flat header: `capacity: u32`, `nentries: u32`, little-endian
pub const FLAT_HEADER_NBYTES: usize = 8;

/// Capacity after one growth step: doubles, starting at one slot
pub(crate) fn grown_capacity(capacity: u32) -> u32 {
    capacity.saturating_mul(2).max(1)
}

/// Why a backend contributed nothing (or less than everything) to a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanWarningKind {
    /// The backend was not asked, e.g. because it is disabled
    Skipped(Error),
    /// The backend was asked and failed
    Failed(Error),
}

/// A non-fatal problem recorded during a multi-backend scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub backend: String,
    pub kind: ScanWarningKind,
}

impl ScanWarning {
    pub fn skipped(backend: impl Into<String>, reason: Error) -> Self {
        Self {
            backend: backend.into(),
            kind: ScanWarningKind::Skipped(reason),
        }
    }

    pub fn failed(backend: impl Into<String>, error: Error) -> Self {
        Self {
            backend: backend.into(),
            kind: ScanWarningKind::Failed(error),
        }
    }

    pub fn error(&self) -> &Error {
        match &self.kind {
            ScanWarningKind::Skipped(e) | ScanWarningKind::Failed(e) => e,
        }
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.kind, ScanWarningKind::Skipped(_))
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ScanWarningKind::Skipped(e) => write!(f, "{}: skipped: {}", self.backend, e),
            ScanWarningKind::Failed(e) => write!(f, "{}: failed: {}", self.backend, e),
        }
    }
}

impl Serialize for ScanWarning {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ScanWarning", 4)?;
        state.serialize_field("backend", &self.backend)?;
        state.serialize_field("kind", if self.is_skip() { "skipped" } else { "failed" })?;
        state.serialize_field("code", &self.error().code())?;
        state.serialize_field("message", &self.error().to_string())?;
        state.end()
    }
}

/// Owned enumeration result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enumeration {
    capacity: u32,
    entries: Vec<Ident>,
    warnings: Vec<ScanWarning>,
}

impl Enumeration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size for `capacity` entries
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity as usize),
            warnings: Vec::new(),
        }
    }

    /// Append an entry, doubling the capacity when full. Capacity never shrinks.
    pub fn push(&mut self, ident: Ident) {
        if self.entries.len() as u32 >= self.capacity {
            self.capacity = grown_capacity(self.capacity);
            self.entries
                .reserve_exact(self.capacity as usize - self.entries.len());
        }
        self.entries.push(ident);
    }

    /// Move every entry and warning of `other` onto the end of this result
    pub fn append(&mut self, other: Enumeration) {
        for ident in other.entries {
            self.push(ident);
        }
        self.warnings.extend(other.warnings);
    }

    pub fn warn(&mut self, warning: ScanWarning) {
        self.warnings.push(warning);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Ident] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&Ident> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ident> {
        self.entries.iter()
    }

    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    /// Borrowed view in the layout foreign callers bind to
    pub fn as_raw(&self) -> RawEnumeration<'_> {
        RawEnumeration {
            capacity: self.capacity,
            nentries: self.entries.len() as u32,
            entries: self.entries.as_ptr(),
            _enumeration: PhantomData,
        }
    }

    /// Serialize header and entries into the flat layout
    pub fn to_flat_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FLAT_HEADER_NBYTES + self.entries.len() * Ident::NBYTES);
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(bytemuck::cast_slice(&self.entries));
        out
    }

    /// Read a flat layout back, record by record. Warnings are not part of the layout.
    pub fn from_flat_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FLAT_HEADER_NBYTES {
            return Err(Error::InvalidArgument(format!(
                "enumeration header needs {} bytes, got {}",
                FLAT_HEADER_NBYTES,
                bytes.len()
            )));
        }

        let capacity = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let nentries = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if nentries > capacity {
            return Err(Error::InvalidArgument(format!(
                "enumeration count {} exceeds capacity {}",
                nentries, capacity
            )));
        }

        let body = &bytes[FLAT_HEADER_NBYTES..];
        let expected = nentries as usize * Ident::NBYTES;
        if body.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "enumeration body is {} bytes, expected {}",
                body.len(),
                expected
            )));
        }

        // capacity is only recorded; storage is sized by what was actually sent
        let entries = body
            .chunks_exact(Ident::NBYTES)
            .map(Ident::from_bytes)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            capacity,
            entries,
            warnings: Vec::new(),
        })
    }

    /// SHA256 over the flat entry bytes, as lowercase hex
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(bytemuck::cast_slice::<Ident, u8>(&self.entries));
        hex::encode(hasher.finalize())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl<'a> IntoIterator for &'a Enumeration {
    type Item = &'a Ident;
    type IntoIter = std::slice::Iter<'a, Ident>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl Serialize for Enumeration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Enumeration", 4)?;
        state.serialize_field("capacity", &self.capacity)?;
        state.serialize_field("nentries", &self.entries.len())?;
        state.serialize_field("entries", &self.entries)?;
        state.serialize_field("warnings", &self.warnings)?;
        state.end()
    }
}

impl fmt::Display for Enumeration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "enumeration:")?;
        writeln!(f, "  capacity: {}", self.capacity)?;
        writeln!(f, "  nentries: {}", self.entries.len())?;
        writeln!(f, "  entries:")?;
        for ident in &self.entries {
            writeln!(
                f,
                "    - {{ uri: '{}', nsid: {:#x}, dtype: {}, nst: {}, be: {} }}",
                ident.uri(),
                ident.nsid(),
                ident.dtype(),
                ident.nst(),
                ident.be_attr().name()
            )?;
        }
        if !self.warnings.is_empty() {
            writeln!(f, "  warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "    - '{}'", warning)?;
            }
        }
        Ok(())
    }
}

/// `{ capacity: u32, nentries: u32, entries: *const Ident }`, valid while the
/// enumeration it was taken from is borrowed
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawEnumeration<'a> {
    pub capacity: u32,
    pub nentries: u32,
    pub entries: *const Ident,
    _enumeration: PhantomData<&'a Enumeration>,
}
