use crate::error::{Error, IoKind, Result};
use nix::unistd::{sysconf, SysconfVar};
use static_assertions::const_assert_eq;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub const PAGEMAP_PATH: &str = "/proc/self/pagemap";

/// Every pagemap entry is one 64 bit word.
pub const PAGEMAP_ENTRY_SIZE: usize = 8;
const_assert_eq!(PAGEMAP_ENTRY_SIZE, core::mem::size_of::<u64>());

const PFN_MASK: u64 = (1 << 54) - 1;

/// One decoded pagemap entry (see Documentation/admin-guide/mm/pagemap.rst).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapEntry {
    pub page_frame_number: u64,
    pub soft_dirty: bool,
    pub file_or_shared_anon: bool,
    pub swapped: bool,
    pub present: bool,
}

impl From<u64> for PageMapEntry {
    fn from(data: u64) -> Self {
        PageMapEntry {
            page_frame_number: data & PFN_MASK,
            soft_dirty: (data >> 54) & 1 != 0,
            file_or_shared_anon: (data >> 61) & 1 != 0,
            swapped: (data >> 62) & 1 != 0,
            present: (data >> 63) & 1 != 0,
        }
    }
}

/// Resolves virtual addresses to physical ones.
pub trait AddressTranslator {
    fn translate(&self, addr: *const u8) -> Result<usize>;
}

pub fn page_size() -> Result<usize> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Ok(size as usize),
        Ok(_) => Err(Error::Sysconf(None)),
        Err(e) => Err(Error::Sysconf(Some(e))),
    }
}

pub fn page_shift(page_size: usize) -> u32 {
    let mut shift = 0;
    let mut counter = page_size;
    while counter > 1 {
        counter >>= 1;
        shift += 1;
    }
    shift
}

/// Translation through the pagemap file of the current process.
///
/// Nothing is cached across calls: the kernel may move a page between two
/// translations. Without CAP_SYS_ADMIN the kernel reports a zero frame number.
#[derive(Debug, Clone)]
pub struct Pagemap {
    path: PathBuf,
}

impl Default for Pagemap {
    fn default() -> Self {
        Pagemap {
            path: PathBuf::from(PAGEMAP_PATH),
        }
    }
}

impl Pagemap {
    pub fn with_path(path: impl AsRef<Path>) -> Pagemap {
        Pagemap {
            path: path.as_ref().to_owned(),
        }
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::Io {
            kind: IoKind::ProcSelfPagemap,
            path: self.path.clone(),
            source,
        }
    }

    pub fn entry_at(&self, offset: u64) -> Result<PageMapEntry> {
        let file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        let mut data = [0u8; PAGEMAP_ENTRY_SIZE];
        file.read_exact_at(&mut data, offset)
            .map_err(|e| self.io_error(e))?;
        Ok(PageMapEntry::from(u64::from_ne_bytes(data)))
    }

    fn translate_with_page_size(&self, addr: usize, page_size: usize) -> Result<usize> {
        let offset = (addr / page_size * PAGEMAP_ENTRY_SIZE) as u64;
        let entry = self.entry_at(offset)?;
        if !entry.present {
            return Err(Error::PageNotResident(addr));
        }
        Ok(((entry.page_frame_number as usize) << page_shift(page_size)) + addr % page_size)
    }
}

impl AddressTranslator for Pagemap {
    fn translate(&self, addr: *const u8) -> Result<usize> {
        self.translate_with_page_size(addr as usize, page_size()?)
    }
}

/// Physical address of `addr`, the page must already be faulted in.
pub fn get_physical_address(addr: *const u8) -> Result<usize> {
    Pagemap::default().translate(addr)
}
