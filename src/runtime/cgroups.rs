//! Cgroup interface of the process drivers.
//!
//! The cgroup subsystem manager itself lives outside this crate; the
//! drivers drive it through [`CgroupManager`]. What is implemented here
//! is the direct membership write used when an additional process joins
//! a running container, and the kill sweep over a container cgroup used
//! when the container shares the host pid namespace.

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd,
};
use std::{collections::HashMap, fs, path::Path};

use crate::runtime::{config::Config, Pid};

/// Cgroup subsystem manager of one container.
pub trait CgroupManager {
    /// Create the container cgroups and move `pid` into them. Must
    /// happen before the process is allowed to fork, so no descendant
    /// can escape the cgroup.
    fn apply(&mut self, pid: Pid) -> Result<()>;
    /// Apply limits and values from the configuration.
    fn set(&mut self, config: &Config) -> Result<()>;
    /// Remove the container cgroups. Called by the drivers on error
    /// paths after a successful apply.
    fn destroy(&mut self) -> Result<()>;
    /// Pids currently in the container cgroups.
    fn procs(&self) -> Result<Vec<Pid>>;
}

/// Write `pid` into the procs file of each controller path.
pub fn enter_pid(paths: &HashMap<String, String>, pid: Pid) -> Result<()> {
    for (controller, path) in paths {
        let procs = Path::new(path).join("cgroup.procs");
        debug!("Adding pid {} to {} cgroup {}", pid, controller, path);
        fs::write(&procs, format!("{pid}\n"))
            .with_context(|| format!("adding pid {} to cgroup {}", pid, procs.display()))?;
    }
    Ok(())
}

/// Send `signal` to every process in the container cgroups. Processes
/// that exit during the sweep are skipped.
pub fn signal_all(manager: &dyn CgroupManager, signal: Signal) -> Result<()> {
    for pid in manager.procs().context("listing cgroup processes")? {
        debug!("Sending {} to pid {}", signal, pid);
        match kill(unistd::Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => (),
            Err(e) => warn!("Failed to signal pid {}: {}", pid, e),
        }
    }
    Ok(())
}
