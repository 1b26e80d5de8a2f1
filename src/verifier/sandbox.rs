//! Confinement of the compiler and of submitted programs.
//!
//! Every stage runs in its own cgroup (memory, pids, cpuset, killed as a whole), under `prlimit`
//! rlimits (address space, cpu time, file size, no core dumps). The run stage also gets fresh
//! network and mount namespaces: every mount is read-only except the workspace, and `/tmp`,
//! `/var/tmp` and `/dev/shm` are replaced by empty private tmpfs. The environment is emptied,
//! stdin and stdout are discarded and stderr goes to a file of the workspace.

use std::fs::File;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Instant;

use anyhow::Context;
use tracing::{debug, warn};

use crate::cgroup_manager::{check_cgroups, CgroupLimits, LimitedProcess};
use crate::configuration::Configuration;
use crate::constraints::{Constraints, StageLimits};

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const SIGXCPU: i32 = 24;

/// Shell run inside a fresh mount namespace, in the workspace, before exec'ing its arguments.
///
/// The workspace becomes its own bind mount so that it stays writable once every other mount
/// is remounted read-only. Per-mount flags (`nosuid`, `nodev`, ...) are carried over, a remount
/// dropping them is refused by the kernel. The process keeps the workspace as its working
/// directory after the tmpfs is mounted over `/tmp`, even when the workspace lives there.
const READ_ONLY_MOUNTS: &str = r#"set -e
workdir=$(pwd -P)
mount --bind "$workdir" "$workdir"
cd "$workdir"
while read -r _ target _ options _; do
    [ "$target" = "$workdir" ] && continue
    case "$options" in rw,*) ;; *) continue ;; esac
    flags=ro
    for option in $(echo "$options" | tr , ' '); do
        case "$option" in
            nosuid|nodev|noexec|noatime|nodiratime|relatime|strictatime) flags="$flags,$option" ;;
        esac
    done
    mount -o "remount,bind,$flags" "$target" 2>/dev/null || true
done < /proc/self/mounts
touch /.duel-writable 2>/dev/null && exit 125
for scratch in /tmp /var/tmp /dev/shm; do
    if [ -d "$scratch" ]; then
        mount -t tmpfs -o size=4m,mode=1777,nosuid,nodev duel "$scratch"
    fi
done
export TMPDIR=/tmp
exec "$@""#;

/// `$0` of the mount script, shown by `ps`.
const MOUNT_SCRIPT_NAME: &str = "duel-sandbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Exited(ExitStatus),
    /// Killed at the wall-clock deadline.
    TimedOut,
}

/// The isolation facilities available on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    cgroups: bool,
    prlimit: bool,
    isolate_network: bool,
    isolate_filesystem: bool,
    cpus: String,
}

impl Sandbox {
    /// Checks which facilities work here.
    ///
    /// # Errors
    ///
    /// Fails when one of them is missing, unless `config.allow_uncontained` is set, in which
    /// case the gap is logged and submissions are bounded by wall-clock budgets only.
    pub fn detect(config: &Configuration, constraints: &Constraints) -> anyhow::Result<Sandbox> {
        let mut missing = Vec::new();

        let cgroups = match check_cgroups() {
            Ok(()) => true,
            Err(e) => {
                missing.push(format!("cgroups v2 ({e:#})"));
                false
            }
        };
        let prlimit = command_succeeds("prlimit", &["--version"]);
        if !prlimit {
            missing.push("prlimit".to_string());
        }
        let isolate_network = config.isolate_network
            && command_succeeds("unshare", &["--net", "--map-root-user", "--", "true"]);
        if config.isolate_network && !isolate_network {
            missing.push("unshare --net --map-root-user".to_string());
        }
        let isolate_filesystem = config.isolate_filesystem
            && command_succeeds(
                "unshare",
                &[
                    "--mount",
                    "--map-root-user",
                    "--",
                    "sh",
                    "-c",
                    READ_ONLY_MOUNTS,
                    MOUNT_SCRIPT_NAME,
                    "true",
                ],
            );
        if config.isolate_filesystem && !isolate_filesystem {
            missing.push("read-only mounts (unshare --mount --map-root-user)".to_string());
        }

        if !missing.is_empty() {
            let missing = missing.join(", ");
            if !config.allow_uncontained {
                anyhow::bail!(
                    "isolation facilities unavailable: {missing}. Set DUEL_ALLOW_UNCONTAINED=true to run without them"
                );
            }
            warn!("running submissions without: {missing}. Only wall-clock budgets apply");
        }

        Ok(Sandbox {
            cgroups,
            prlimit,
            isolate_network,
            isolate_filesystem,
            cpus: constraints.cpus.clone(),
        })
    }

    /// No confinement beyond the wall-clock deadline and the scrubbed environment.
    pub fn uncontained() -> Sandbox {
        Sandbox {
            cgroups: false,
            prlimit: false,
            isolate_network: false,
            isolate_filesystem: false,
            cpus: String::new(),
        }
    }

    pub fn is_contained(&self) -> bool {
        self.cgroups && self.prlimit
    }

    /// Whether submitted programs can only write to their workspace.
    pub fn isolates_filesystem(&self) -> bool {
        self.isolate_filesystem
    }

    /// Runs `program args` in `workdir` and waits for it, at most `limits.wall_time`.
    pub fn execute(
        &self,
        stage: Stage,
        program: &str,
        args: &[&str],
        workdir: &Path,
        stderr_path: &Path,
        limits: &StageLimits,
    ) -> anyhow::Result<StageOutcome> {
        let mut command = self.wrap(stage, program, args, limits);
        let stderr = File::create(stderr_path)
            .with_context(|| format!("could not create {}", stderr_path.display()))?;
        command
            .current_dir(workdir)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("TMPDIR", workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr);

        let deadline = Instant::now() + limits.wall_time;
        let mut process = if self.cgroups {
            let cgroup = CgroupLimits {
                max_memory: i64::try_from(limits.memory).unwrap_or(i64::MAX),
                max_pids: limits.max_pids,
                cpus: self.cpus.clone(),
            };
            LimitedProcess::launch(&mut command, &cgroup)?
        } else {
            LimitedProcess::launch_without_container(&mut command)?
        };

        let contained = process.is_contained();
        let outcome = match process.wait_until(deadline)? {
            Some(status) => StageOutcome::Exited(status),
            None => StageOutcome::TimedOut,
        };
        debug!(?stage, ?outcome, contained, "{program} finished");
        Ok(outcome)
    }

    fn wrap(&self, stage: Stage, program: &str, args: &[&str], limits: &StageLimits) -> Command {
        let mut argv: Vec<String> = Vec::new();
        if stage == Stage::Run && (self.isolate_network || self.isolate_filesystem) {
            argv.push("unshare".to_string());
            if self.isolate_filesystem {
                argv.push("--mount".to_string());
            }
            if self.isolate_network {
                argv.push("--net".to_string());
            }
            argv.extend(["--map-root-user", "--"].map(String::from));
            if self.isolate_filesystem {
                argv.extend(["sh", "-c", READ_ONLY_MOUNTS, MOUNT_SCRIPT_NAME].map(String::from));
            }
        }
        if self.prlimit {
            argv.push("prlimit".to_string());
            argv.push(format!("--as={}", limits.memory));
            if let Some(cpu) = limits.cpu_time {
                // SIGXCPU at the soft limit, SIGKILL one second later
                let soft = cpu.as_secs().max(1);
                argv.push(format!("--cpu={soft}:{}", soft + 1));
            }
            argv.push(format!("--fsize={}", limits.file_size));
            argv.push("--core=0".to_string());
        }
        argv.push(program.to_string());
        argv.extend(args.iter().map(|a| a.to_string()));

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command
    }
}

fn command_succeeds(program: &str, args: &[&str]) -> bool {
    match Command::new(program)
        .args(args)
        .current_dir(std::env::temp_dir())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("could not run {program}: {e}");
            false
        }
    }
}

/// Signal that terminated the process, if any.
#[cfg(unix)]
pub fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
pub fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Whether the process was stopped by its cpu time rlimit.
pub fn exceeded_cpu_time(status: &ExitStatus) -> bool {
    termination_signal(status) == Some(SIGXCPU)
}
