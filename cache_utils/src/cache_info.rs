//! Cache geometry discovery.
//!
//! The geometry comes from the kernel's per-cpu cache description under
//! `/sys/devices/system/cpu/cpu<N>/cache/index<M>/`. Index numbering is
//! assigned by the OS, starts at 0 and is not ordered by level.

use crate::error::{Error, IoKind, Result};
use crate::sysfs::{read_string, read_uint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheType {
    Data,
    Instruction,
    Unified,
    Unknown,
}

impl CacheType {
    fn from_sysfs(s: &str) -> CacheType {
        if s.starts_with('D') {
            CacheType::Data
        } else if s.starts_with('I') {
            CacheType::Instruction
        } else if s.starts_with("Uni") {
            CacheType::Unified
        } else {
            CacheType::Unknown
        }
    }

    pub fn holds_data(self) -> bool {
        matches!(self, CacheType::Data | CacheType::Unified)
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CacheType::Data => "DATA",
            CacheType::Instruction => "INSTRUCTION",
            CacheType::Unified => "UNIFIED",
            CacheType::Unknown => "UNKNOWN",
        })
    }
}

/// Geometry of one cache, all sizes in bytes.
///
/// `total_size == set_count * ways * line_size` holds for every value
/// produced by [`CacheGeometry::new`] and [`discover`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    pub line_size: usize,
    pub total_size: usize,
    pub set_count: usize,
    pub ways: usize,
    pub level: u32,
    pub cache_type: CacheType,
    pub cpu_id: usize,
    pub cache_id: usize,
}

impl CacheGeometry {
    /// Builds a geometry, rejecting inconsistent sizes.
    pub fn new(
        line_size: usize,
        set_count: usize,
        ways: usize,
        level: u32,
        cache_type: CacheType,
    ) -> Option<CacheGeometry> {
        let total_size = line_size.checked_mul(set_count)?.checked_mul(ways)?;
        if total_size == 0 {
            return None;
        }
        Some(CacheGeometry {
            line_size,
            total_size,
            set_count,
            ways,
            level,
            cache_type,
            cpu_id: 0,
            cache_id: 0,
        })
    }

    /// Number of lines, i.e. `set_count * ways`.
    pub fn line_count(&self) -> usize {
        self.total_size / self.line_size
    }

    /// Byte offset of the line that lands in `(set, way)` of a cache-aligned buffer.
    #[inline(always)]
    pub fn offset(&self, set: usize, way: usize) -> usize {
        (way * self.set_count + set) * self.line_size
    }
}

impl fmt::Display for CacheGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "L{} CACHE (has index {}) on CPU {}: ",
            self.level, self.cache_id, self.cpu_id
        )?;
        writeln!(f, "  LINE SIZE: {}", self.line_size)?;
        writeln!(f, "  TOTAL SIZE: {}", self.total_size)?;
        writeln!(f, "  SET COUNT: {}", self.set_count)?;
        writeln!(f, "  ASSOCIATIVITY COUNT: {}", self.ways)?;
        write!(f, "  TYPE: {}", self.cache_type)
    }
}

fn cache_dir(root: &Path, cpu: usize) -> PathBuf {
    root.join(format!("cpu{}", cpu)).join("cache")
}

/// Number of `index*` entries advertised for `cpu`.
pub fn cache_count(root: &Path, cpu: usize) -> Result<usize> {
    let dir = cache_dir(root, cpu);
    let io_err = |source| Error::Io {
        kind: IoKind::SysCpu,
        path: dir.clone(),
        source,
    };
    let mut count = 0;
    for entry in fs::read_dir(&dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_name().to_string_lossy().starts_with("index") {
            count += 1;
        }
    }
    Ok(count)
}

/// Reads the properties of cache `index` of `cpu`.
pub fn read_index(root: &Path, cpu: usize, index: usize) -> Result<CacheGeometry> {
    let dir = cache_dir(root, cpu).join(format!("index{}", index));
    let prop = |name: &str, kind| read_uint(dir.join(name), kind).map(|v| v as usize);

    let line_size = prop("coherency_line_size", IoKind::LineSize)?;
    let total_size = prop("size", IoKind::TotalSize)? * 1024;
    let set_count = prop("number_of_sets", IoKind::SetNumber)?;
    let level = prop("level", IoKind::Levels)? as u32;
    let ways = prop("ways_of_associativity", IoKind::Associativity)?;
    let cache_type = CacheType::from_sysfs(&read_string(dir.join("type"), IoKind::CacheType)?);

    debug!(
        cpu,
        index, line_size, total_size, set_count, ways, level, ?cache_type, "read cache index"
    );

    match CacheGeometry::new(line_size, set_count, ways, level, cache_type) {
        Some(g) if g.total_size == total_size => Ok(CacheGeometry {
            cpu_id: cpu,
            cache_id: index,
            ..g
        }),
        _ => Err(Error::Format {
            kind: IoKind::TotalSize,
            path: dir.join("size"),
            content: format!(
                "{} bytes for {} sets x {} ways x {} bytes",
                total_size, set_count, ways, line_size
            ),
        }),
    }
}

/// Finds the first data or unified cache of `level` on `cpu` below `root`.
pub fn discover_in(root: impl AsRef<Path>, cpu: usize, level: u32) -> Result<CacheGeometry> {
    let root = root.as_ref();
    let count = cache_count(root, cpu)?;

    let mut last = None;
    for index in 0..count {
        let geometry = read_index(root, cpu, index)?;
        last = Some(geometry);
        if geometry.cache_type.holds_data() && geometry.level == level {
            break;
        }
    }

    match last {
        Some(g) if g.level == level => Ok(g),
        _ => Err(Error::CacheNotFound { cpu, level }),
    }
}

/// Finds the first data or unified cache of `level` on `cpu`.
pub fn discover(cpu: usize, level: u32) -> Result<CacheGeometry> {
    discover_in(SYSFS_CPU_ROOT, cpu, level)
}
