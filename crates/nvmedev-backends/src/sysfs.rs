//! Small helpers for reading sysfs-style attribute trees

use nvmedev_core::{NativeError, NativeResult};
use std::io::ErrorKind;
use std::path::Path;

/// Read a trimmed attribute; a missing attribute is `None`
pub(crate) fn read_attr(path: &Path) -> NativeResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(NativeError::from_io(&e, format!("read {}", path.display()))),
    }
}

/// Read a decimal or `0x`-prefixed attribute
pub(crate) fn read_attr_u64(path: &Path) -> NativeResult<Option<u64>> {
    let Some(value) = read_attr(path)? else {
        return Ok(None);
    };
    parse_u64(&value).map(Some).ok_or_else(|| {
        NativeError::new(
            libc::EINVAL,
            format!("{}: not a number: {:?}", path.display(), value),
        )
    })
}

/// Like [`read_attr_u64`], for attributes that must fit 32 bits
pub(crate) fn read_attr_u32(path: &Path) -> NativeResult<Option<u32>> {
    match read_attr_u64(path)? {
        None => Ok(None),
        Some(v) => u32::try_from(v).map(Some).map_err(|_| {
            NativeError::new(
                libc::ERANGE,
                format!("{}: value {} out of range", path.display(), v),
            )
        }),
    }
}

/// Entry names of a directory, sorted
pub(crate) fn list_dir_names(dir: &Path) -> NativeResult<Vec<String>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| NativeError::from_io(&e, format!("read_dir {}", dir.display())))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| NativeError::from_io(&e, format!("read_dir {}", dir.display())))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Final path component of a symlink target, e.g. the bound driver's name
pub(crate) fn link_name(path: &Path) -> NativeResult<Option<String>> {
    match std::fs::read_link(path) {
        Ok(target) => Ok(target
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(NativeError::from_io(&e, format!("readlink {}", path.display()))),
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
