use cache_utils::affinity::focus_cpu_core;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::Path;
use std::process::{Child, Command};
use tracing::warn;

/// The workload sharing the measured core.
#[derive(Debug)]
pub enum Companion {
    None,
    /// Already running, left alone after profiling.
    Existing(Pid),
    /// Started by us, killed after profiling.
    Spawned(Child),
}

/// Splits `args` on whitespace, no quoting.
pub fn split_args(args: Option<&str>) -> Vec<&str> {
    args.map(|a| a.split_whitespace().collect())
        .unwrap_or_default()
}

pub fn spawn(program: &Path, args: Option<&str>) -> io::Result<Child> {
    Command::new(program).args(split_args(args)).spawn()
}

impl Companion {
    pub fn pid(&self) -> Option<Pid> {
        match self {
            Companion::None => None,
            Companion::Existing(pid) => Some(*pid),
            Companion::Spawned(child) => Some(Pid::from_raw(child.id() as i32)),
        }
    }

    pub fn bind(&self, cpu: usize) -> cache_utils::Result<()> {
        match self.pid() {
            Some(pid) => focus_cpu_core(pid, cpu),
            None => Ok(()),
        }
    }

    /// SIGKILLs a spawned companion. One that already exited is not an error.
    pub fn finish(self) -> nix::Result<()> {
        if let Companion::Spawned(child) = &self {
            let pid = Pid::from_raw(child.id() as i32);
            println!("Sending SIGKILL to external process with PID {}.", pid);
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// [`Companion::finish`] on an error path, where a failed kill is only logged.
    pub fn abandon(self) {
        if let Err(e) = self.finish() {
            warn!("Error while stopping external program: {}", e);
        }
    }
}
