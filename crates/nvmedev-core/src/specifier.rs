//! Device specifiers
//!
//! A specifier is an opaque URI-like string such as `kblk:///dev/nvme0n1`,
//! `pci://0000:03:00.0?nsid=2` or a bare `/dev/nvme0n1`. Only the scheme and
//! the query are interpreted here; the path belongs to whichever backend
//! claims it.

use std::fmt;

use crate::error::{Error, Result};
use crate::ident::URI_CAPACITY;

/// Scheme of the kernel block backend
pub const SCHEME_KBLK: &str = "kblk";
/// Scheme of the user-space PCIe backend
pub const SCHEME_PCI: &str = "pci";
/// Scheme of the fabric backend
pub const SCHEME_FAB: &str = "fab";
/// Scheme of the file-emulated backend
pub const SCHEME_FILE: &str = "file";

/// Longest specifier that still fits an identity record's `uri` field
pub const MAX_SPECIFIER_LEN: usize = URI_CAPACITY - 1;

/// A parsed device specifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Specifier {
    raw: String,
    scheme: Option<String>,
    path: String,
    query: Vec<(String, String)>,
}

impl Specifier {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidSpecifier {
                specifier: raw.to_string(),
                reason: "empty".to_string(),
            });
        }
        if raw.contains('\0') {
            return Err(Error::InvalidSpecifier {
                specifier: raw.escape_debug().to_string(),
                reason: "contains a NUL byte".to_string(),
            });
        }
        if raw.len() > MAX_SPECIFIER_LEN {
            return Err(Error::CapacityExceeded {
                field: "specifier",
                len: raw.len(),
                max: MAX_SPECIFIER_LEN,
            });
        }

        let (scheme, rest) = match split_scheme(raw) {
            Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
            None => (None, raw),
        };
        let rest = if scheme.is_some() {
            rest.strip_prefix("//").unwrap_or(rest)
        } else {
            rest
        };

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (rest, Vec::new()),
        };

        if path.is_empty() {
            return Err(Error::InvalidSpecifier {
                specifier: raw.to_string(),
                reason: "missing path".to_string(),
            });
        }

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            path: path.to_string(),
            query,
        })
    }

    /// Build `scheme://path[?k=v&...]`
    pub fn compose(scheme: &str, path: &str, query: &[(&str, String)]) -> String {
        let mut s = format!("{}://{}", scheme, path);
        for (i, (key, value)) in query.iter().enumerate() {
            s.push(if i == 0 { '?' } else { '&' });
            s.push_str(key);
            s.push('=');
            s.push_str(value);
        }
        s
    }

    /// The string exactly as the caller supplied it
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Lowercased scheme, if one was given
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.scheme
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(scheme))
    }

    /// Backend-private remainder, without `//` and query
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// Parse the `nsid` query parameter, if present
    pub fn query_nsid(&self) -> Result<Option<u32>> {
        match self.query("nsid") {
            None => Ok(None),
            Some(v) => parse_u32(v).map(Some).ok_or_else(|| Error::InvalidSpecifier {
                specifier: self.raw.clone(),
                reason: format!("invalid nsid {:?}", v),
            }),
        }
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for Specifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Decimal or `0x`-prefixed hexadecimal
fn parse_u32(v: &str) -> Option<u32> {
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    }
}

/// `scheme ":" rest`, where scheme is `ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )`
fn split_scheme(raw: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = raw.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    Some((scheme, rest))
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kblk() {
        let spec = Specifier::parse("kblk:///dev/nvme0n1").unwrap();
        assert_eq!(spec.scheme(), Some("kblk"));
        assert_eq!(spec.path(), "/dev/nvme0n1");
        assert_eq!(spec.raw(), "kblk:///dev/nvme0n1");
    }

    #[test]
    fn test_parse_schemeless_path() {
        let spec = Specifier::parse("/dev/nvme0n1").unwrap();
        assert_eq!(spec.scheme(), None);
        assert_eq!(spec.path(), "/dev/nvme0n1");
    }

    #[test]
    fn test_bdf_is_not_a_scheme() {
        let spec = Specifier::parse("0000:03:00.0").unwrap();
        assert_eq!(spec.scheme(), None);
        assert_eq!(spec.path(), "0000:03:00.0");
    }

    #[test]
    fn test_parse_query() {
        let spec = Specifier::parse("PCI://0000:03:00.0?nsid=0x2&qd=64").unwrap();
        assert_eq!(spec.scheme(), Some("pci"));
        assert!(spec.has_scheme("pci"));
        assert_eq!(spec.path(), "0000:03:00.0");
        assert_eq!(spec.query("qd"), Some("64"));
        assert_eq!(spec.query_nsid().unwrap(), Some(2));
        assert_eq!(spec.raw(), "PCI://0000:03:00.0?nsid=0x2&qd=64");
    }

    #[test]
    fn test_bad_nsid() {
        let spec = Specifier::parse("pci://0000:03:00.0?nsid=two").unwrap();
        assert!(matches!(
            spec.query_nsid(),
            Err(Error::InvalidSpecifier { .. })
        ));
    }

    #[test]
    fn test_rejects_empty_nul_and_overlong() {
        assert!(matches!(
            Specifier::parse(""),
            Err(Error::InvalidSpecifier { .. })
        ));
        assert!(matches!(
            Specifier::parse("kblk:///dev/\0x"),
            Err(Error::InvalidSpecifier { .. })
        ));
        assert!(matches!(
            Specifier::parse("kblk://"),
            Err(Error::InvalidSpecifier { .. })
        ));

        let long = format!("file:///{}", "a".repeat(MAX_SPECIFIER_LEN));
        assert!(matches!(
            Specifier::parse(&long),
            Err(Error::CapacityExceeded { field: "specifier", .. })
        ));

        let fits = format!("/{}", "a".repeat(MAX_SPECIFIER_LEN - 1));
        assert!(Specifier::parse(&fits).is_ok());
    }

    #[test]
    fn test_compose() {
        assert_eq!(
            Specifier::compose("kblk", "/dev/nvme0n1", &[]),
            "kblk:///dev/nvme0n1"
        );
        assert_eq!(
            Specifier::compose("pci", "0000:03:00.0", &[("nsid", "1".to_string())]),
            "pci://0000:03:00.0?nsid=1"
        );
    }
}
