//! Processes confined to their own cgroup, killed as a whole when their time is up.

#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

use anyhow::Context;

/// Time given to a killed process (and its cgroup) to disappear.
pub const CLEANUP_DURATION: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Ceilings of a cgroup. Non-positive values and empty strings mean "no restriction".
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CgroupLimits {
    /// Bytes.
    pub max_memory: i64,
    pub max_pids: i64,
    /// Comma separated cpu ranges ("1-5,7", "1,3,4", ...).
    pub cpus: String,
}

fn create_process(command: &mut Command) -> anyhow::Result<Child> {
    command
        .spawn()
        .with_context(|| format!("command '{}' not found", command.get_program().to_string_lossy()))
}

impl LimitedProcess {
    /// Waits for the process to exit, killing it once `deadline` has passed.
    ///
    /// Returns `None` if the process had to be killed.
    pub fn wait_until(&mut self, deadline: Instant) -> anyhow::Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = self.child.try_wait().context("could not poll process")? {
                self.release();
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                self.try_kill(CLEANUP_DURATION)?;
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}
