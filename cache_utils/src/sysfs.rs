use crate::error::{Error, IoKind, Result};
use std::fs;
use std::path::Path;

fn read_trimmed(path: &Path, kind: IoKind) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_owned())
        .map_err(|source| Error::Io {
            kind,
            path: path.to_owned(),
            source,
        })
}

/// Reads one unsigned integer from a sysfs/procfs style file.
///
/// Trailing unit suffixes are ignored (`"32K"` reads as 32), as the kernel
/// appends them to some cache properties. Failures are tagged with `kind`.
pub fn read_uint(path: impl AsRef<Path>, kind: IoKind) -> Result<u64> {
    let path = path.as_ref();
    let content = read_trimmed(path, kind)?;
    let digits: &str = content
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    digits.parse().map_err(|_| Error::Format {
        kind,
        path: path.to_owned(),
        content,
    })
}

/// Reads a whole file as text, failures tagged with `kind`.
pub fn read_string(path: impl AsRef<Path>, kind: IoKind) -> Result<String> {
    read_trimmed(path.as_ref(), kind)
}
