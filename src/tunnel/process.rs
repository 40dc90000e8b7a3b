//! Launching, inspecting and signalling the tunnel core process.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::tunnel::types::Liveness;

/// Process operations the lifecycle manager needs.
pub trait ProcessControl {
    /// Start the core with `config_path` and return its pid without waiting.
    fn launch(&self, config_path: &Path) -> io::Result<u32>;

    fn liveness(&self, pid: u32) -> Liveness;

    /// Ask the process to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Runs the real tunnel core binary.
#[derive(Debug, Clone)]
pub struct SystemProcessControl {
    core_path: PathBuf,
}

impl SystemProcessControl {
    pub fn new(core_path: impl Into<PathBuf>) -> Self {
        SystemProcessControl {
            core_path: core_path.into(),
        }
    }

    pub fn core_path(&self) -> &Path {
        &self.core_path
    }
}

/// pid 0 and values past `i32::MAX` would address process groups.
fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

impl ProcessControl for SystemProcessControl {
    fn launch(&self, config_path: &Path) -> io::Result<u32> {
        let child = Command::new(&self.core_path)
            .arg("run")
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", self.core_path.display())))?;

        let pid = child.id();
        info!(pid, core = %self.core_path.display(), "tunnel core started");
        Ok(pid)
    }

    fn liveness(&self, pid: u32) -> Liveness {
        let Some(pid) = to_pid(pid) else {
            return Liveness::Dead;
        };
        match kill(pid, None) {
            Ok(()) => Liveness::Alive,
            Err(Errno::ESRCH) => Liveness::Dead,
            Err(errno) => {
                debug!(%pid, %errno, "cannot probe process liveness");
                Liveness::Indeterminate
            }
        }
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let target = to_pid(pid).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}"))
        })?;
        kill(target, Signal::SIGTERM)?;
        debug!(pid, "sent SIGTERM");
        Ok(())
    }
}
