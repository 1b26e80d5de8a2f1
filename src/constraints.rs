//! Resource limits applied to every verification.
//!
//! A submission goes through two stages, each with its own envelope:
//!
//! - **compile**: wall-clock budget, memory ceiling, pid ceiling
//! - **run**: wall-clock budget, CPU-time ceiling, memory ceiling, pid ceiling
//!
//! Limits are enforced by the [`Sandbox`](crate::verifier::sandbox::Sandbox) through Linux
//! cgroups v2 and `prlimit`. The wall-clock budget is kept by the verification worker itself,
//! which polls the process and kills it, or its whole cgroup, at the deadline.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use code_duel::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_run_timeout(Duration::from_secs(2))
//!     .with_run_ram(128)
//!     .with_workers(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(constraints.workers(), 4);
//! ```
//!
//! [`ConstraintsBuilder::from_env()`] reads the same values from `DUEL_*` environment variables.

use std::{collections::BTreeSet, env, time::Duration};

use anyhow::{bail, ensure, Context};
use tracing::warn;

const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_COMPILE_RAM_MB: usize = 1024;
const DEFAULT_RUN_RAM_MB: usize = 256;
const DEFAULT_DIAGNOSTIC_LIMIT: usize = 200;
const COMPILE_MAX_PIDS: i64 = 64;
const RUN_MAX_PIDS: i64 = 8;
const MAX_OUTPUT_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Builder for [`Constraints`]. Unset budgets default to 10 s to compile and 5 s to run.
#[derive(Debug, Default)]
pub struct ConstraintsBuilder {
    compile_timeout: Option<Duration>,
    run_timeout: Option<Duration>,
    compile_ram: Option<usize>,
    run_ram: Option<usize>,
    run_cpu_time: Option<Duration>,
    cpu_list: Option<String>,
    workers: Option<usize>,
    diagnostic_limit: Option<usize>,
}

impl ConstraintsBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads:
    /// - `DUEL_COMPILE_TIMEOUT_MS` (u64)
    /// - `DUEL_RUN_TIMEOUT_MS` (u64)
    /// - `DUEL_COMPILE_RAM` (MB)
    /// - `DUEL_RUN_RAM` (MB)
    /// - `DUEL_RUN_CPU_SECS` (u64)
    /// - `DUEL_CPU_LIST` ("0-3,6")
    /// - `DUEL_WORKERS` (usize)
    /// - `DUEL_DIAGNOSTIC_LIMIT` (characters)
    ///
    /// Unparsable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            let raw = env::var(var).ok()?;
            let parsed = raw.trim().parse().ok();
            if parsed.is_none() {
                warn!("ignoring {var}={raw:?}: not a valid value");
            }
            parsed
        }

        ConstraintsBuilder {
            compile_timeout: parse("DUEL_COMPILE_TIMEOUT_MS").map(Duration::from_millis),
            run_timeout: parse("DUEL_RUN_TIMEOUT_MS").map(Duration::from_millis),
            compile_ram: parse("DUEL_COMPILE_RAM"),
            run_ram: parse("DUEL_RUN_RAM"),
            run_cpu_time: parse("DUEL_RUN_CPU_SECS").map(Duration::from_secs),
            cpu_list: env::var("DUEL_CPU_LIST").ok(),
            workers: parse("DUEL_WORKERS"),
            diagnostic_limit: parse("DUEL_DIAGNOSTIC_LIMIT"),
        }
    }

    /// Wall-clock budget of the compiler.
    #[must_use]
    pub fn with_compile_timeout(self, duration: Duration) -> Self {
        Self {
            compile_timeout: Some(duration),
            ..self
        }
    }

    /// Wall-clock budget of the compiled program.
    #[must_use]
    pub fn with_run_timeout(self, duration: Duration) -> Self {
        Self {
            run_timeout: Some(duration),
            ..self
        }
    }

    /// Memory ceiling of the compiler (in MB).
    #[must_use]
    pub fn with_compile_ram(self, max: usize) -> Self {
        Self {
            compile_ram: Some(max),
            ..self
        }
    }

    /// Memory ceiling of the compiled program (in MB).
    #[must_use]
    pub fn with_run_ram(self, max: usize) -> Self {
        Self {
            run_ram: Some(max),
            ..self
        }
    }

    /// CPU-time ceiling of the compiled program. Defaults to one second above the run timeout.
    #[must_use]
    pub fn with_run_cpu_time(self, duration: Duration) -> Self {
        Self {
            run_cpu_time: Some(duration),
            ..self
        }
    }

    /// CPUs verifications may use, e.g. `"0-3,6"`.
    #[must_use]
    pub fn with_cpu_list(self, cpus: &str) -> Self {
        Self {
            cpu_list: Some(cpus.to_string()),
            ..self
        }
    }

    /// Number of verifications running in parallel. Defaults to the physical CPU count.
    #[must_use]
    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..self
        }
    }

    /// Maximum length (in characters) of compiler and program diagnostics shown to players.
    #[must_use]
    pub fn with_diagnostic_limit(self, limit: usize) -> Self {
        Self {
            diagnostic_limit: Some(limit),
            ..self
        }
    }

    /// # Errors
    ///
    /// Fails on impossible constraints: zero budgets, a memory ceiling above the available
    /// memory, a malformed CPU list, zero workers.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let compile_timeout = self.compile_timeout.unwrap_or(DEFAULT_COMPILE_TIMEOUT);
        let run_timeout = self.run_timeout.unwrap_or(DEFAULT_RUN_TIMEOUT);
        ensure!(!compile_timeout.is_zero(), "compile timeout must be positive");
        ensure!(!run_timeout.is_zero(), "run timeout must be positive");

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        // 0 means sysinfo could not tell
        let available_mb = (sys.available_memory() / 1_000_000) as usize;
        let compile_ram = memory_ceiling(self.compile_ram, DEFAULT_COMPILE_RAM_MB, available_mb)
            .context("invalid compile memory ceiling")?;
        let run_ram = memory_ceiling(self.run_ram, DEFAULT_RUN_RAM_MB, available_mb)
            .context("invalid run memory ceiling")?;

        let run_cpu_time = self
            .run_cpu_time
            .unwrap_or_else(|| Duration::from_secs(run_timeout.as_secs() + 1));
        ensure!(
            run_cpu_time.as_secs() > 0,
            "run CPU time must be at least one second"
        );

        let cpus = match self.cpu_list {
            Some(list) => cpu_list_to_set(&list)
                .map_err(|e| e.context("error parsing cpu list"))?
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(","),
            None => String::new(),
        };

        let workers = self.workers.unwrap_or_else(num_cpus::get_physical);
        ensure!(workers > 0, "at least one verification worker is required");
        let diagnostic_limit = self.diagnostic_limit.unwrap_or(DEFAULT_DIAGNOSTIC_LIMIT);
        ensure!(diagnostic_limit > 0, "diagnostic limit must be positive");

        Ok(Constraints {
            compile: StageLimits {
                wall_time: compile_timeout,
                cpu_time: None,
                memory: (compile_ram as u64).saturating_mul(1_000_000),
                max_pids: COMPILE_MAX_PIDS,
                file_size: MAX_OUTPUT_FILE_SIZE,
            },
            run: StageLimits {
                wall_time: run_timeout,
                cpu_time: Some(run_cpu_time),
                memory: (run_ram as u64).saturating_mul(1_000_000),
                max_pids: RUN_MAX_PIDS,
                file_size: MAX_OUTPUT_FILE_SIZE,
            },
            cpus,
            workers,
            diagnostic_limit,
        })
    }
}

/// Explicit ceilings above the available memory are an error, defaults are clamped to it.
fn memory_ceiling(requested: Option<usize>, default: usize, available_mb: usize) -> anyhow::Result<usize> {
    match requested {
        Some(0) => bail!("memory ceiling must be positive"),
        Some(mb) if available_mb > 0 && mb > available_mb => {
            bail!("memory ceiling ({mb}MB) is greater than available memory ({available_mb}MB)")
        }
        Some(mb) => Ok(mb),
        None if available_mb > 0 => Ok(default.min(available_mb)),
        None => Ok(default),
    }
}

fn cpu_list_to_set(s: &str) -> anyhow::Result<BTreeSet<u8>> {
    if s.trim().is_empty() {
        bail!("Empty string");
    }
    let mut set = BTreeSet::new();
    for item in s.split(',') {
        let item = item.trim();
        match item.split('-').collect::<Vec<_>>().as_slice() {
            [value] => {
                let value: u8 = value
                    .parse()
                    .with_context(|| format!("could not parse {value}"))?;
                set.insert(value);
            }
            [start, end] => {
                let start: u8 = start
                    .parse()
                    .with_context(|| format!("could not parse {start}"))?;
                let end: u8 = end
                    .parse()
                    .with_context(|| format!("could not parse {end}"))?;
                let range = if start <= end {
                    start..=end
                } else {
                    end..=start
                };
                set.extend(range);
            }
            _ => bail!(
                "each comma-separated item must be a number or a range (e.g. '0-3'), got '{item}'"
            ),
        }
    }
    Ok(set)
}

/// Envelope of one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageLimits {
    pub wall_time: Duration,
    pub cpu_time: Option<Duration>,
    /// Bytes.
    pub memory: u64,
    pub max_pids: i64,
    /// Largest file the process may write, in bytes.
    pub file_size: u64,
}

/// Obtained using [`ConstraintsBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) compile: StageLimits,
    pub(crate) run: StageLimits,
    /// Normalized cpuset, empty for no restriction.
    pub(crate) cpus: String,
    pub(crate) workers: usize,
    pub(crate) diagnostic_limit: usize,
}

impl Constraints {
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    pub fn compile_limits(&self) -> &StageLimits {
        &self.compile
    }

    pub fn run_limits(&self) -> &StageLimits {
        &self.run
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn diagnostic_limit(&self) -> usize {
        self.diagnostic_limit
    }
}
