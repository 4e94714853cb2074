//! Backend attributes and the registry listing

use bytemuck::{Pod, Zeroable};
use serde::ser::{SerializeStruct, Serializer};
use serde::Serialize;
use static_assertions::const_assert_eq;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, offset_of, size_of};

use crate::enumeration::grown_capacity;
use crate::error::Result;
use crate::fixed::FixedStr;

/// Capacity of [`BackendAttr::name`], terminator included
pub const BACKEND_NAME_CAPACITY: usize = 8;
/// Capacity of [`BackendAttr::scheme`], terminator included
pub const BACKEND_SCHEME_CAPACITY: usize = 7;

/// Static descriptor of one backend.
///
/// Flat layout (16 bytes, alignment 1):
///
/// | offset | size | field     |
/// |-------:|-----:|-----------|
/// | 0      | 8    | `name`    |
/// | 8      | 7    | `scheme`  |
/// | 15     | 1    | `enabled` |
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BackendAttr {
    name: FixedStr<BACKEND_NAME_CAPACITY>,
    scheme: FixedStr<BACKEND_SCHEME_CAPACITY>,
    enabled: u8,
}

const_assert_eq!(size_of::<BackendAttr>(), 16);
const_assert_eq!(align_of::<BackendAttr>(), 1);
const_assert_eq!(offset_of!(BackendAttr, scheme), 8);
const_assert_eq!(offset_of!(BackendAttr, enabled), 15);

impl BackendAttr {
    pub fn new(name: &str, scheme: &str, enabled: bool) -> Result<Self> {
        Ok(Self {
            name: FixedStr::new(name, "backend name")?,
            scheme: FixedStr::new(scheme, "backend scheme")?,
            enabled: enabled as u8,
        })
    }

    pub fn name(&self) -> &FixedStr<BACKEND_NAME_CAPACITY> {
        &self.name
    }

    pub fn scheme(&self) -> &FixedStr<BACKEND_SCHEME_CAPACITY> {
        &self.scheme
    }

    pub fn enabled(&self) -> bool {
        self.enabled != 0
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled as u8;
    }

    /// Match by backend name or by scheme
    pub fn matches(&self, name_or_scheme: &str) -> bool {
        self.name == name_or_scheme || self.scheme.as_bytes().eq_ignore_ascii_case(name_or_scheme.as_bytes())
    }
}

impl fmt::Debug for BackendAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendAttr")
            .field("name", &self.name)
            .field("scheme", &self.scheme)
            .field("enabled", &self.enabled())
            .finish()
    }
}

impl fmt::Display for BackendAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ name: '{}', scheme: '{}', enabled: {} }}",
            self.name,
            self.scheme,
            self.enabled()
        )
    }
}

impl Serialize for BackendAttr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("BackendAttr", 3)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("scheme", &self.scheme)?;
        state.serialize_field("enabled", &self.enabled())?;
        state.end()
    }
}

/// Owned listing of the registry's backends, in registry order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendListing {
    capacity: u32,
    items: Vec<BackendAttr>,
}

impl BackendListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            capacity,
            items: Vec::with_capacity(capacity as usize),
        }
    }

    /// Append, doubling the capacity when full
    pub fn push(&mut self, attr: BackendAttr) {
        if self.items.len() as u32 >= self.capacity {
            self.capacity = grown_capacity(self.capacity);
            self.items
                .reserve_exact(self.capacity as usize - self.items.len());
        }
        self.items.push(attr);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[BackendAttr] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BackendAttr> {
        self.items.iter()
    }

    /// Find a backend by name or scheme
    pub fn find(&self, name_or_scheme: &str) -> Option<&BackendAttr> {
        self.items.iter().find(|attr| attr.matches(name_or_scheme))
    }

    /// Borrowed view in the layout foreign callers bind to
    pub fn as_raw(&self) -> RawBackendListing<'_> {
        RawBackendListing {
            capacity: self.capacity,
            count: self.items.len() as i32,
            item: self.items.as_ptr(),
            _listing: PhantomData,
        }
    }
}

impl<'a> IntoIterator for &'a BackendListing {
    type Item = &'a BackendAttr;
    type IntoIter = std::slice::Iter<'a, BackendAttr>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl fmt::Display for BackendListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "backends:")?;
        writeln!(f, "  capacity: {}", self.capacity)?;
        writeln!(f, "  count: {}", self.items.len())?;
        writeln!(f, "  items:")?;
        for attr in &self.items {
            writeln!(f, "    - {}", attr)?;
        }
        Ok(())
    }
}

/// `{ capacity: u32, count: i32, item: *const BackendAttr }`, valid while the
/// listing it was taken from is borrowed
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBackendListing<'a> {
    pub capacity: u32,
    pub count: i32,
    pub item: *const BackendAttr,
    _listing: PhantomData<&'a BackendListing>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_attr_layout() {
        let attr = BackendAttr::new("kblk", "kblk", true).unwrap();
        let bytes = bytemuck::bytes_of(&attr);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..5], b"kblk\0");
        assert_eq!(&bytes[8..13], b"kblk\0");
        assert_eq!(bytes[15], 1);
    }

    #[test]
    fn test_backend_attr_name_limits() {
        assert!(BackendAttr::new("1234567", "123456", false).is_ok());
        assert!(BackendAttr::new("12345678", "fab", false).is_err());
        assert!(BackendAttr::new("fab", "1234567", false).is_err());
    }

    #[test]
    fn test_backend_attr_matches_name_or_scheme() {
        let attr = BackendAttr::new("upci", "pci", true).unwrap();
        assert!(attr.matches("upci"));
        assert!(attr.matches("pci"));
        assert!(attr.matches("PCI"));
        assert!(!attr.matches("fab"));
    }

    #[test]
    fn test_listing_growth() {
        let mut listing = BackendListing::new();
        assert_eq!(listing.capacity(), 0);
        for (i, name) in ["kblk", "upci", "fab"].iter().enumerate() {
            listing.push(BackendAttr::new(name, name, i % 2 == 0).unwrap());
            assert!(listing.len() as u32 <= listing.capacity());
        }
        assert_eq!(listing.capacity(), 4);

        let raw = listing.as_raw();
        assert_eq!(raw.count, 3);
        assert_eq!(raw.capacity, 4);
        assert!(listing.find("fab").is_some());
    }
}
