use std::fmt;
use std::io;
use std::path::PathBuf;

/// The filesystem collaborator an I/O or format failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    SysCpu,
    LineSize,
    TotalSize,
    SetNumber,
    Levels,
    Associativity,
    CacheType,
    ProcSelfPagemap,
    ProcMeminfo,
    HugepageNumber,
    Rdpmc,
}

impl IoKind {
    pub fn tag(self) -> &'static str {
        match self {
            IoKind::SysCpu => "ERROR_IO_SYS_CPU",
            IoKind::LineSize => "ERROR_IO_LINE_SIZE",
            IoKind::TotalSize => "ERROR_IO_TOTAL_SIZE",
            IoKind::SetNumber => "ERROR_IO_SET_NUMBER",
            IoKind::Levels => "ERROR_IO_LEVELS",
            IoKind::Associativity => "ERROR_IO_ASSOCIATIVITY",
            IoKind::CacheType => "ERROR_IO_CACHE_TYPE",
            IoKind::ProcSelfPagemap => "ERROR_IO_PROC_SELF_PAGEMAP",
            IoKind::ProcMeminfo => "ERROR_IO_PROC_MEMINFO",
            IoKind::HugepageNumber => "ERROR_IO_HUGEPAGE_NUMBER",
            IoKind::Rdpmc => "ERROR_IO_RDPMC",
        }
    }
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            IoKind::SysCpu => "the per-cpu cache directory",
            IoKind::LineSize => "coherency_line_size",
            IoKind::TotalSize => "size",
            IoKind::SetNumber => "number_of_sets",
            IoKind::Levels => "level",
            IoKind::Associativity => "ways_of_associativity",
            IoKind::CacheType => "type",
            IoKind::ProcSelfPagemap => "/proc/self/pagemap",
            IoKind::ProcMeminfo => "/proc/meminfo",
            IoKind::HugepageNumber => "nr_hugepages",
            IoKind::Rdpmc => "the rdpmc capability file",
        };
        f.write_str(what)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("allocating memory")]
    Allocation,
    #[error("during IO interaction with {kind} ({})", path.display())]
    Io {
        kind: IoKind,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unexpected content {content:?} in {kind} ({})", path.display())]
    Format {
        kind: IoKind,
        path: PathBuf,
        content: String,
    },
    #[error("getting value from sysconf")]
    Sysconf(#[source] Option<nix::Error>),
    #[error("setting the CPU affinity")]
    SetAffinity(#[source] nix::Error),
    #[error("retrieving the CPU core on which the program currently runs on")]
    GetCpuCore(#[source] io::Error),
    #[error("using mmap")]
    Mmap(#[source] nix::Error),
    #[error("failed to remove memory mappings")]
    Munmap(#[source] nix::Error),
    #[error("opening a file descriptor to the cycle event")]
    CounterCreate(#[source] io::Error),
    #[error("resetting the cycle event")]
    CounterReset(#[source] io::Error),
    #[error("enabling the cycle event")]
    CounterEnable(#[source] io::Error),
    #[error("closing the cycle event")]
    CounterClose(#[source] io::Error),
    #[error("the page at {0:#x} is not resident in physical memory")]
    PageNotResident(usize),
    #[error("the buffer is not aligned to the cache after {attempts} tries")]
    NotAligned { attempts: usize },
    #[error("cache L{level} does not exist on CPU {cpu}")]
    CacheNotFound { cpu: usize, level: u32 },
    #[error("no hugepages are available")]
    NoHugepages,
    #[error("the rdpmc instruction is not available in userspace (rdpmc = {0})")]
    RdpmcUnavailable(u64),
}

impl Error {
    /// Stable diagnostic tag, printed next to the message by front ends.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Allocation => "ERROR_ALLOCATION",
            Error::Io { kind, .. } => kind.tag(),
            Error::Format { .. } => "ERROR_FMT",
            Error::Sysconf(_) => "ERROR_SYSCONF",
            Error::SetAffinity(_) => "ERROR_SET_AFFINITY",
            Error::GetCpuCore(_) => "ERROR_GET_CPU_CORE",
            Error::Mmap(_) => "ERROR_MMAP",
            Error::Munmap(_) => "ERROR_MUNMAP",
            Error::CounterCreate(_) => "ERROR_FD_CYCLE",
            Error::CounterReset(_) => "ERROR_FD_CYCLE_RESET",
            Error::CounterEnable(_) => "ERROR_FD_CYCLE_ENABLE",
            Error::CounterClose(_) => "ERROR_FD_CYCLE_CLOSE",
            Error::PageNotResident(_) => "ERROR_PAGE_ENTRY",
            Error::NotAligned { .. } => "ERROR_NOT_ALIGNED",
            Error::CacheNotFound { .. } => "ERROR_CACHE_NOT_EXISTS",
            Error::NoHugepages => "ERROR_NO_HUGEPAGES",
            Error::RdpmcUnavailable(_) => "ERROR_RDPMC",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_collaborator() {
        let e = Error::Io {
            kind: IoKind::ProcSelfPagemap,
            path: PathBuf::from("/proc/self/pagemap"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(e.kind_name(), "ERROR_IO_PROC_SELF_PAGEMAP");
        assert!(e.to_string().contains("/proc/self/pagemap"));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn domain_errors_have_tags() {
        assert_eq!(Error::NoHugepages.kind_name(), "ERROR_NO_HUGEPAGES");
        assert_eq!(
            Error::NotAligned { attempts: 3 }.to_string(),
            "the buffer is not aligned to the cache after 3 tries"
        );
    }
}
