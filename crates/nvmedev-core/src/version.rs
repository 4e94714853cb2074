//! Library version triple, for bindings that must refuse an incompatible major

use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

const fn parse_component(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let mut value = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

/// Version of this build
pub const VERSION: Version = Version {
    major: parse_component(env!("CARGO_PKG_VERSION_MAJOR")),
    minor: parse_component(env!("CARGO_PKG_VERSION_MINOR")),
    patch: parse_component(env!("CARGO_PKG_VERSION_PATCH")),
};

impl Version {
    pub const fn current() -> Self {
        VERSION
    }

    /// Layouts are stable within a major release
    pub fn is_compatible(&self, major: u32) -> bool {
        self.major == major
    }

    /// Check against a semver requirement such as `"^0.1"` or `">=0.1, <0.3"`
    pub fn satisfies(&self, req: &str) -> Result<bool> {
        let req = semver::VersionReq::parse(req).map_err(|e| {
            Error::InvalidArgument(format!("invalid version requirement {:?}: {}", req, e))
        })?;
        Ok(req.matches(&semver::Version::new(
            self.major as u64,
            self.minor as u64,
            self.patch as u64,
        )))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Version of this build
pub fn version() -> Version {
    VERSION
}
