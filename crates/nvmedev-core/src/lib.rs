//! nvmedev Core - Flat records shared by every nvmedev backend
//!
//! This crate provides the binary-stable data model:
//! - Fixed-capacity, NUL-terminated string fields
//! - Identity records and the enumeration result that collects them
//! - Backend attributes and the registry listing
//! - Geometry descriptors and the normalization of backend-native geometry
//! - Device specifiers, the version triple and the error taxonomy

pub mod backend;
pub mod enumeration;
pub mod error;
pub mod fixed;
pub mod geometry;
pub mod ident;
pub mod specifier;
pub mod version;

pub use backend::{BackendAttr, BackendListing, RawBackendListing};
pub use enumeration::{Enumeration, RawEnumeration, ScanWarning, ScanWarningKind};
pub use error::{Error, ErrorCode, NativeError, NativeResult, Result};
pub use fixed::FixedStr;
pub use geometry::{Geometry, GeometryWarning, NativeGeometry, RawGeometry, ZoneGeometry};
pub use ident::{DeviceType, Ident, NamespaceType, URI_CAPACITY};
pub use specifier::Specifier;
pub use version::{version, Version};
