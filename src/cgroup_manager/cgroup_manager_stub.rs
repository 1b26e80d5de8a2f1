use std::{
    process::{Child, Command},
    time::Duration,
};

use anyhow::{self, bail, Context};
use tracing::warn;

use super::{create_process, CgroupLimits, CLEANUP_DURATION};

pub fn check_cgroups() -> anyhow::Result<()> {
    bail!("cgroups only available on linux")
}

#[derive(Debug)]
pub struct LimitedProcess {
    pub child: Child,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(_command: &mut Command, _limits: &CgroupLimits) -> anyhow::Result<LimitedProcess> {
        bail!("cgroups only available on linux")
    }

    pub fn launch_without_container(command: &mut Command) -> anyhow::Result<LimitedProcess> {
        let child = create_process(command).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cleaned_up: false,
        })
    }

    pub fn is_contained(&self) -> bool {
        false
    }

    pub fn try_kill(&mut self, _max_duration: Duration) -> anyhow::Result<()> {
        self.child.kill().context("could not kill process")?;
        let _ = self.child.wait();
        self.cleaned_up = true;
        Ok(())
    }

    pub(super) fn release(&mut self) {
        self.cleaned_up = true;
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                warn!("could not kill process on LimitedProcess::drop: {e:#}");
            }
        }
    }
}
