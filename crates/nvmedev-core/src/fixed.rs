//! Fixed-capacity, NUL-terminated byte strings
//!
//! Every string in a flat record lives in a `[u8; N]` so foreign callers can
//! bind to the raw layout without a length handshake. A string must leave room
//! for its terminator; anything longer is rejected instead of being cut.

use bytemuck::{Pod, Zeroable};
use serde::{Serialize, Serializer};
use static_assertions::const_assert_eq;
use std::borrow::Cow;
use std::fmt;
use std::mem::{align_of, size_of};

use crate::error::{Error, Result};

/// NUL-terminated string stored in exactly `N` bytes
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize>([u8; N]);

// SAFETY: `repr(transparent)` over `[u8; N]`; all zero bytes is the empty string.
unsafe impl<const N: usize> Zeroable for FixedStr<N> {}
// SAFETY: `repr(transparent)` over `[u8; N]`, which is `Copy`, has no padding
// and is valid for every bit pattern. The derive cannot express this for a
// const-generic wrapper.
unsafe impl<const N: usize> Pod for FixedStr<N> {}

const_assert_eq!(size_of::<FixedStr<7>>(), 7);
const_assert_eq!(align_of::<FixedStr<320>>(), 1);

impl<const N: usize> FixedStr<N> {
    /// Total bytes occupied by the field
    pub const CAPACITY: usize = N;
    /// Longest string that fits with its terminator
    pub const MAX_LEN: usize = N - 1;

    pub const fn empty() -> Self {
        Self([0; N])
    }

    /// Copy `value` into a new field named `field` (used in error messages)
    pub fn new(value: &str, field: &'static str) -> Result<Self> {
        Self::from_bytes(value.as_bytes(), field)
    }

    pub fn from_bytes(bytes: &[u8], field: &'static str) -> Result<Self> {
        if bytes.contains(&0) {
            return Err(Error::InvalidArgument(format!(
                "{} contains a NUL byte",
                field
            )));
        }
        if bytes.len() > Self::MAX_LEN {
            return Err(Error::CapacityExceeded {
                field,
                len: bytes.len(),
                max: Self::MAX_LEN,
            });
        }

        let mut buf = [0u8; N];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Length up to (not including) the terminator
    pub fn len(&self) -> usize {
        self.0.iter().position(|&b| b == 0).unwrap_or(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..self.len()]
    }

    pub fn to_str(&self) -> Result<&str> {
        std::str::from_utf8(self.as_bytes())
            .map_err(|e| Error::InvalidArgument(format!("field is not UTF-8: {}", e)))
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }

    /// The whole buffer, terminator and tail included
    pub fn raw(&self) -> &[u8; N] {
        &self.0
    }

    /// True when the buffer holds a terminator and only zeros follow it
    pub fn is_well_formed(&self) -> bool {
        match self.0.iter().position(|&b| b == 0) {
            Some(end) => self.0[end..].iter().all(|&b| b == 0),
            None => false,
        }
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> PartialEq<str> for FixedStr<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<const N: usize> PartialEq<&str> for FixedStr<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl<const N: usize> Serialize for FixedStr<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_lossy())
    }
}
