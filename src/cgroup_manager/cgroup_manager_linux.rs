use std::{
    process::{Child, Command},
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use cgroups_rs::Cgroup;
use tracing::warn;

use super::{create_process, CgroupLimits, CLEANUP_DURATION};

pub fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

pub fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path` with the provided limitations.
///
/// # Errors
///
/// This function will return an error if the cgroup could not be created. This can happen if the
/// parameters are incorrect or if cgroup is not available.
pub fn create_cgroup(path: &str, limits: &CgroupLimits) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if limits.max_memory > 0 {
        builder = builder.memory().memory_hard_limit(limits.max_memory).done();
    }
    if limits.max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(limits.max_pids))
            .done();
    }
    if !limits.cpus.is_empty() {
        builder = builder.cpu().cpus(limits.cpus.clone()).done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

/// Checks that cgroups v2 are mounted and that a child cgroup can be created and removed.
pub fn check_cgroups() -> anyhow::Result<()> {
    if !cgroups_rs::hierarchies::is_cgroup2_unified_mode() {
        anyhow::bail!("cgroup v2 hierarchy is not mounted");
    }
    let user_id = get_current_user_id()?;
    let path = get_cgroup_path(&user_id, &format!("DUEL_CHECK_{}", std::process::id()));
    let group = create_cgroup(&path, &CgroupLimits::default())?;
    group.delete().context("could not delete test cgroup")
}

#[derive(Debug)]
pub struct TimeoutError {}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timeout Error")
    }
}

impl std::error::Error for TimeoutError {}

pub fn wait_for_process_cleanup(
    cgroup: &Cgroup,
    pid: u64,
    max_duration: Duration,
) -> Result<(), TimeoutError> {
    let deadline = Instant::now() + max_duration;
    while cgroup.tasks().iter().any(|cpid| cpid.pid == pid) {
        if Instant::now() > deadline {
            return Err(TimeoutError {});
        }

        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

fn create_process_in_cgroup(command: &mut Command, group: &Cgroup) -> anyhow::Result<Child> {
    let mut child = create_process(command)?;

    let pid = child.id() as u64;
    let addition = group.add_task_by_tgid(cgroups_rs::CgroupPid { pid });
    if addition.is_err() {
        let kill = child.kill();
        // reap it, the error below is what matters
        let _ = child.wait();

        addition.with_context(|| {
            if let Err(err) = kill {
                format!(
                    "could not add process to cgroup, and process could not be killed either ({err})"
                )
            } else {
                "could not add process to cgroup".to_string()
            }
        })?;
    }
    Ok(child)
}

#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cgroup: Option<Cgroup>,
    cleaned_up: bool,
}

impl LimitedProcess {
    /// Spawns `command` inside a fresh cgroup carrying `limits`.
    pub fn launch(command: &mut Command, limits: &CgroupLimits) -> anyhow::Result<LimitedProcess> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        // one cgroup per process, unique across concurrent verifications
        let group_name = format!(
            "DUEL_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group = create_cgroup(&path, limits).context("could not create cgroup")?;
        let child = create_process_in_cgroup(command, &group).with_context(|| {
            let _ = group.delete();
            "could not create process in cgroup"
        })?;

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    pub fn launch_without_container(command: &mut Command) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cgroup: None,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        self.cgroup.is_some()
    }

    /// Kills the process, and every descendant when contained.
    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        match &mut self.cgroup {
            Some(cgroup) => {
                cgroup.kill().context("could not kill process")?;
                wait_for_process_cleanup(cgroup, self.child.id() as u64, max_duration)
                    .context("process cleanup timed out")?;
                let _ = self.child.try_wait();
                self.cleaned_up = true;
                if let Err(e) = cgroup.delete() {
                    warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
                }
                Ok(())
            }
            None => {
                self.child.kill().context("could not kill process")?;
                let _ = self.child.wait();
                self.cleaned_up = true;
                Ok(())
            }
        }
    }

    /// Called once the main process exited: leftovers in the cgroup are killed and the cgroup
    /// removed.
    pub(super) fn release(&mut self) {
        if self.cgroup.is_some() {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("could not clean up cgroup of exited process: {e:#}");
            }
        }
        self.cleaned_up = true;
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("could not kill process/cgroup on LimitedProcess::drop: {e:#}");
            }
        }
    }
}
