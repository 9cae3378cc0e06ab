//! Hugepage backed buffers whose virtual cache line index matches the
//! physical one.
//!
//! Linux gives userspace no say in which physical hugepage backs a mapping,
//! so a mapping is taken, checked through the pagemap, and retried until one
//! lands where it should. Rejected candidates stay mapped until the search
//! ends.

use crate::cache_info::CacheGeometry;
use crate::error::{Error, IoKind, Result};
use crate::pagemap::{AddressTranslator, Pagemap};
use crate::sysfs::{read_string, read_uint};
use core::ffi::c_void;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::slice::from_raw_parts;
use nix::sys::mman;
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::{debug, error, info, warn};

pub const NR_HUGEPAGES_PATH: &str = "/proc/sys/vm/nr_hugepages";
pub const MEMINFO_PATH: &str = "/proc/meminfo";

/// Source of hugepage mappings.
pub trait HugepageMapper: Clone {
    fn map(&self, len: usize) -> Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `p` must come from `map` on this mapper and must not be used afterwards.
    unsafe fn unmap(&self, p: NonNull<u8>, len: usize) -> Result<()>;
}

/// Anonymous private `MAP_HUGETLB` mappings of the default hugepage size.
#[derive(Debug, Clone, Copy, Default)]
pub struct HugetlbMapper;

impl HugepageMapper for HugetlbMapper {
    fn map(&self, len: usize) -> Result<NonNull<u8>> {
        let len = NonZeroUsize::new(len).ok_or(Error::Allocation)?;
        let p = unsafe {
            mman::mmap_anonymous(
                None,
                len,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_PRIVATE | mman::MapFlags::MAP_HUGETLB,
            )
        }
        .map_err(Error::Mmap)?;
        Ok(p.cast())
    }

    unsafe fn unmap(&self, p: NonNull<u8>, len: usize) -> Result<()> {
        unsafe { mman::munmap(p.cast::<c_void>(), len) }.map_err(Error::Munmap)
    }
}

/// The hugepage budget of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugepageConfig {
    /// Configured number of hugepages, also the allocation attempt budget.
    pub max_pages: usize,
    pub page_size: usize,
}

impl HugepageConfig {
    pub fn from_system() -> Result<HugepageConfig> {
        HugepageConfig::from_paths(NR_HUGEPAGES_PATH, MEMINFO_PATH)
    }

    pub fn from_paths(
        nr_hugepages: impl AsRef<Path>,
        meminfo: impl AsRef<Path>,
    ) -> Result<HugepageConfig> {
        let max_pages = read_uint(nr_hugepages, IoKind::HugepageNumber)? as usize;
        if max_pages < 1 {
            return Err(Error::NoHugepages);
        }
        let page_size = hugepage_size(meminfo.as_ref())?;
        Ok(HugepageConfig {
            max_pages,
            page_size,
        })
    }

    /// `len` rounded up to whole hugepages, never less than one page.
    pub fn rounded_len(&self, len: usize) -> usize {
        let pages = len.div_ceil(self.page_size).max(1);
        pages * self.page_size
    }
}

fn hugepage_size(meminfo: &Path) -> Result<usize> {
    let content = read_string(meminfo, IoKind::ProcMeminfo)?;
    let line = content
        .lines()
        .find(|l| l.starts_with("Hugepagesize:"))
        .ok_or_else(|| Error::Format {
            kind: IoKind::ProcMeminfo,
            path: meminfo.to_owned(),
            content: String::from("no Hugepagesize entry"),
        })?;
    let digits: String = line.chars().filter(char::is_ascii_digit).collect();
    match digits.parse::<usize>() {
        Ok(kib) if kib > 0 => Ok(kib * 1024),
        _ => Err(Error::Format {
            kind: IoKind::ProcMeminfo,
            path: meminfo.to_owned(),
            content: line.to_owned(),
        }),
    }
}

/// A hugepage backed buffer of `geometry.total_size` bytes, validated against
/// `geometry`.
pub struct AlignedBuffer<M: HugepageMapper = HugetlbMapper> {
    pointer: Option<NonNull<u8>>,
    geometry: CacheGeometry,
    mapped_len: usize,
    mapper: M,
}

impl<M: HugepageMapper> AlignedBuffer<M> {
    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    /// Length handed to `munmap`: whole hugepages covering the buffer.
    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.pointer.map_or(ptr::null(), |p| p.as_ptr() as *const u8)
    }

    pub fn slice(&self) -> &[u8] {
        match self.pointer {
            Some(p) => unsafe { from_raw_parts(p.as_ptr(), self.geometry.total_size) },
            None => &[],
        }
    }

    fn release(&mut self) -> Result<()> {
        match self.pointer.take() {
            Some(p) => unsafe { self.mapper.unmap(p, self.mapped_len) },
            None => Ok(()),
        }
    }

    /// Unmaps the buffer, reporting failures that `Drop` can only log.
    pub fn free(mut self) -> Result<()> {
        self.release()
    }
}

impl<M: HugepageMapper> Drop for AlignedBuffer<M> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!("Error while freeing buffer: {}", e);
        }
    }
}

impl<M: HugepageMapper> Deref for AlignedBuffer<M> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl<M: HugepageMapper> AsRef<[u8]> for AlignedBuffer<M> {
    fn as_ref(&self) -> &[u8] {
        self.slice()
    }
}

/// Rejected candidate mappings, unmapped when the search ends.
struct PendingMappings<'a, M: HugepageMapper> {
    mapper: &'a M,
    len: usize,
    mappings: Vec<NonNull<u8>>,
}

impl<'a, M: HugepageMapper> PendingMappings<'a, M> {
    fn new(mapper: &'a M, len: usize, capacity: usize) -> Self {
        PendingMappings {
            mapper,
            len,
            mappings: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, p: NonNull<u8>) {
        self.mappings.push(p);
    }

    /// Unmaps everything, returning the first failure.
    fn release_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for p in self.mappings.drain(..) {
            let r = unsafe { self.mapper.unmap(p, self.len) };
            if result.is_ok() {
                result = r;
            }
        }
        result
    }
}

impl<'a, M: HugepageMapper> Drop for PendingMappings<'a, M> {
    fn drop(&mut self) {
        if let Err(e) = self.release_all() {
            error!("Error while freeing rejected buffers: {}", e);
        }
    }
}

/// Allocator of cache aligned buffers.
#[derive(Debug, Clone)]
pub struct AlignedAllocator<M = HugetlbMapper, T = Pagemap> {
    mapper: M,
    translator: T,
    hugepages: HugepageConfig,
}

impl AlignedAllocator<HugetlbMapper, Pagemap> {
    pub fn from_system() -> Result<Self> {
        Ok(AlignedAllocator::new(
            HugetlbMapper,
            Pagemap::default(),
            HugepageConfig::from_system()?,
        ))
    }
}

impl<M: HugepageMapper, T: AddressTranslator> AlignedAllocator<M, T> {
    pub fn new(mapper: M, translator: T, hugepages: HugepageConfig) -> Self {
        AlignedAllocator {
            mapper,
            translator,
            hugepages,
        }
    }

    pub fn hugepages(&self) -> &HugepageConfig {
        &self.hugepages
    }

    /// Checks one hugepage sized stride after the other. Touching the first
    /// line of a stride faults the page in before it gets translated.
    fn is_aligned(&self, base: NonNull<u8>, geometry: &CacheGeometry) -> Result<bool> {
        let stride = (self.hugepages.page_size / geometry.line_size).max(1);
        for line in (0..geometry.line_count()).step_by(stride) {
            let p = unsafe { base.as_ptr().add(line * geometry.line_size) };
            unsafe { ptr::write_volatile(p as *mut u32, 0) };
            let physical = self.translator.translate(p)?;
            let line_id = (physical % geometry.total_size) / geometry.line_size;
            if line_id != line {
                debug!(line, line_id, "physical line mismatch");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Maps hugepages until one is cache aligned, at most `max_pages` times.
    pub fn allocate(&self, geometry: &CacheGeometry) -> Result<AlignedBuffer<M>> {
        let max_tries = self.hugepages.max_pages;
        if max_tries < 1 {
            return Err(Error::NoHugepages);
        }
        let mapped_len = self.hugepages.rounded_len(geometry.total_size);
        let mut rejected = PendingMappings::new(&self.mapper, mapped_len, max_tries);

        for tries in 0..max_tries {
            let p = self.mapper.map(geometry.total_size)?;
            let aligned = match self.is_aligned(p, geometry) {
                Ok(aligned) => aligned,
                Err(e) => {
                    rejected.push(p);
                    return Err(e);
                }
            };
            if aligned {
                let buffer = AlignedBuffer {
                    pointer: Some(p),
                    geometry: *geometry,
                    mapped_len,
                    mapper: self.mapper.clone(),
                };
                rejected.release_all()?;
                info!("Found buffer after {} tries.", tries);
                return Ok(buffer);
            }
            warn!(attempt = tries + 1, "mapping is not cache aligned, retrying");
            rejected.push(p);
        }

        rejected.release_all()?;
        error!("Did not find buffer after {} tries.", max_tries);
        Err(Error::NotAligned {
            attempts: max_tries,
        })
    }
}

/// Allocates a cache aligned buffer using the system hugepage pool.
pub fn alloc_aligned(geometry: &CacheGeometry) -> Result<AlignedBuffer> {
    AlignedAllocator::from_system()?.allocate(geometry)
}
