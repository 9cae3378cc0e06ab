//! Cycle counter backing `rdpmc` in userspace.
//!
//! Opening a hardware cycle event on a core is what makes the fixed function
//! counter readable with `rdpmc` there, provided the kernel allows userspace
//! access (`/sys/bus/event_source/devices/cpu/rdpmc` set to 2).

use crate::error::{Error, IoKind, Result};
use crate::sysfs::read_uint;
use perf_event::events::Hardware;
use perf_event::{Builder, Counter};
use std::fmt;
use std::path::Path;
use tracing::debug;

pub const RDPMC_PATH: &str = "/sys/bus/event_source/devices/cpu/rdpmc";

/// `rdpmc` value meaning "always allowed in userspace".
const RDPMC_ALWAYS: u64 = 2;

pub fn can_use_rdpmc() -> Result<()> {
    can_use_rdpmc_at(RDPMC_PATH)
}

pub fn can_use_rdpmc_at(path: impl AsRef<Path>) -> Result<()> {
    let value = read_uint(path, IoKind::Rdpmc)?;
    if value != RDPMC_ALWAYS {
        return Err(Error::RdpmcUnavailable(value));
    }
    Ok(())
}

/// A started cycle counter. Stopping it consumes it: a new counter has to be
/// enabled for the next measurement.
pub trait CycleCounter {
    fn disable(self) -> Result<()>;
}

/// Hardware cycle event of this process on one core, user mode only.
pub struct PerformanceCounter {
    counter: Counter,
    cpu: usize,
}

impl PerformanceCounter {
    pub fn enable(cpu: usize) -> Result<PerformanceCounter> {
        // Built disabled.
        let mut counter = Builder::new(Hardware::CPU_CYCLES)
            .observe_self()
            .one_cpu(cpu)
            .exclude_kernel(true)
            .exclude_hv(true)
            .build()
            .map_err(Error::CounterCreate)?;
        counter.reset().map_err(Error::CounterReset)?;
        counter.enable().map_err(Error::CounterEnable)?;
        debug!(cpu, "cycle counter enabled");
        Ok(PerformanceCounter { counter, cpu })
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}

impl CycleCounter for PerformanceCounter {
    fn disable(mut self) -> Result<()> {
        self.counter.disable().map_err(Error::CounterClose)?;
        debug!(cpu = self.cpu, "cycle counter disabled");
        Ok(())
    }
}

impl fmt::Debug for PerformanceCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceCounter")
            .field("cpu", &self.cpu)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rdpmc_must_be_always_on() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rdpmc");

        std::fs::write(&path, "2\n").unwrap();
        assert!(can_use_rdpmc_at(&path).is_ok());

        std::fs::write(&path, "1\n").unwrap();
        assert!(matches!(
            can_use_rdpmc_at(&path),
            Err(Error::RdpmcUnavailable(1))
        ));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            can_use_rdpmc_at(&path),
            Err(Error::Io {
                kind: IoKind::Rdpmc,
                ..
            })
        ));
    }

    #[test]
    fn counter_lifecycle_or_permission_error() {
        match PerformanceCounter::enable(0) {
            Ok(counter) => {
                assert_eq!(counter.cpu(), 0);
                counter.disable().unwrap();
            }
            Err(Error::CounterCreate(e)) => {
                eprintln!("cycle counter unavailable (expected without perf access): {}", e);
            }
            Err(e) => panic!("unexpected {:?}", e),
        }
    }
}
