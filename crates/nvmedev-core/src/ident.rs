//! Identity record: the flat description of one namespace or device

use bytemuck::{Pod, Zeroable};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use static_assertions::const_assert_eq;
use std::fmt;
use std::mem::{align_of, offset_of, size_of};

use crate::backend::BackendAttr;
use crate::error::{Error, Result};
use crate::fixed::FixedStr;

/// Capacity of the `uri` and `be_uri` fields, terminator included
pub const URI_CAPACITY: usize = 320;

/// Namespace type, encoded as the NVMe command set identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, FromPrimitive, IntoPrimitive)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum NamespaceType {
    Nvm = 0x00,
    KeyValue = 0x01,
    Zoned = 0x02,
    #[num_enum(default)]
    Unknown = 0xFF,
}

/// What kind of object an identity record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, FromPrimitive, IntoPrimitive)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DeviceType {
    #[num_enum(default)]
    Unknown = 0,
    Controller = 1,
    Namespace = 2,
    BlockDevice = 3,
    File = 4,
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NamespaceType::Nvm => "nvm",
            NamespaceType::KeyValue => "keyvalue",
            NamespaceType::Zoned => "zoned",
            NamespaceType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceType::Unknown => "unknown",
            DeviceType::Controller => "controller",
            DeviceType::Namespace => "namespace",
            DeviceType::BlockDevice => "blockdevice",
            DeviceType::File => "file",
        };
        f.write_str(s)
    }
}

/// Identity record.
///
/// Flat layout (704 bytes, alignment 4, every byte accounted for):
///
/// | offset | size | field     |
/// |-------:|-----:|-----------|
/// | 0      | 4    | `nsid`    |
/// | 4      | 1    | `nst`     |
/// | 5      | 1    | `dtype`   |
/// | 6      | 1    | reserved  |
/// | 7      | 16   | `be_attr` |
/// | 23     | 38   | reserved  |
/// | 61     | 320  | `uri`     |
/// | 381    | 320  | `be_uri`  |
/// | 701    | 3    | reserved  |
///
/// Reserved bytes are always zero.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct Ident {
    nsid: u32,
    nst: u8,
    dtype: u8,
    _pad0: u8,
    be_attr: BackendAttr,
    _pad1: [u8; 38],
    uri: FixedStr<URI_CAPACITY>,
    be_uri: FixedStr<URI_CAPACITY>,
    _pad2: [u8; 3],
}

const_assert_eq!(size_of::<Ident>(), 704);
const_assert_eq!(align_of::<Ident>(), 4);
const_assert_eq!(offset_of!(Ident, nst), 4);
const_assert_eq!(offset_of!(Ident, dtype), 5);
const_assert_eq!(offset_of!(Ident, be_attr), 7);
const_assert_eq!(offset_of!(Ident, uri), 61);
const_assert_eq!(offset_of!(Ident, be_uri), 381);

impl Ident {
    /// Size of one record in the flat layout
    pub const NBYTES: usize = size_of::<Ident>();

    pub fn new(
        nsid: u32,
        nst: NamespaceType,
        dtype: DeviceType,
        be_attr: BackendAttr,
        uri: &str,
        be_uri: &str,
    ) -> Result<Self> {
        Ok(Self {
            nsid,
            nst: nst.into(),
            dtype: dtype.into(),
            be_attr,
            uri: FixedStr::new(uri, "uri")?,
            be_uri: FixedStr::new(be_uri, "be_uri")?,
            ..Self::zeroed()
        })
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn nst(&self) -> NamespaceType {
        NamespaceType::from(self.nst)
    }

    pub fn dtype(&self) -> DeviceType {
        DeviceType::from(self.dtype)
    }

    pub fn be_attr(&self) -> &BackendAttr {
        &self.be_attr
    }

    pub fn uri(&self) -> &FixedStr<URI_CAPACITY> {
        &self.uri
    }

    pub fn be_uri(&self) -> &FixedStr<URI_CAPACITY> {
        &self.be_uri
    }

    /// Raw bytes in the flat layout
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Read a record back from its flat layout.
    ///
    /// Reserved bytes are ignored and come back zeroed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::NBYTES {
            return Err(Error::InvalidArgument(format!(
                "identity record must be {} bytes, got {}",
                Self::NBYTES,
                bytes.len()
            )));
        }

        let mut ident: Ident = bytemuck::pod_read_unaligned(bytes);
        if !ident.uri.is_well_formed() || !ident.be_uri.is_well_formed() {
            return Err(Error::InvalidArgument(
                "identity record URI is not NUL-terminated".to_string(),
            ));
        }

        ident._pad0 = 0;
        ident._pad1 = [0; 38];
        ident._pad2 = [0; 3];
        Ok(ident)
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ident")
            .field("nsid", &self.nsid)
            .field("nst", &self.nst())
            .field("dtype", &self.dtype())
            .field("be_attr", &self.be_attr)
            .field("uri", &self.uri)
            .field("be_uri", &self.be_uri)
            .finish()
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ident:")?;
        writeln!(f, "  uri: '{}'", self.uri)?;
        writeln!(f, "  be_uri: '{}'", self.be_uri)?;
        writeln!(f, "  nsid: {:#x}", self.nsid)?;
        writeln!(f, "  nst: {}", self.nst())?;
        writeln!(f, "  dtype: {}", self.dtype())?;
        writeln!(f, "  be_attr: {}", self.be_attr)
    }
}

impl Serialize for Ident {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Ident", 6)?;
        state.serialize_field("nsid", &self.nsid)?;
        state.serialize_field("nst", &self.nst())?;
        state.serialize_field("dtype", &self.dtype())?;
        state.serialize_field("be_attr", &self.be_attr)?;
        state.serialize_field("uri", &self.uri)?;
        state.serialize_field("be_uri", &self.be_uri)?;
        state.end()
    }
}
