use crate::error::{Error, Result};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::io;

/// Core the calling thread is running on right now.
pub fn current_cpu() -> Result<usize> {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        return Err(Error::GetCpuCore(io::Error::last_os_error()));
    }
    Ok(cpu as usize)
}

/// Restricts `pid` (0 for the caller) to the single core `cpu`.
pub fn focus_cpu_core(pid: Pid, cpu: usize) -> Result<()> {
    let mut core = CpuSet::new();
    core.set(cpu).map_err(Error::SetAffinity)?;
    sched_setaffinity(pid, &core).map_err(Error::SetAffinity)
}
