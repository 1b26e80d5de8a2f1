//! Verification of submitted solutions.
//!
//! A submission is embedded into a generated C program (see [`harness`]), compiled and run in a
//! disposable [`workspace::Workspace`], each stage under the limits of
//! [`Constraints`](crate::constraints::Constraints) and the confinement of a
//! [`sandbox::Sandbox`]. Verifications are executed off the session lock by a
//! [`pool::VerificationPool`].

pub mod harness;
pub mod pool;
pub mod sandbox;
pub mod workspace;

use std::fmt::Display;
use std::path::PathBuf;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::configuration::Configuration;
use crate::constraints::Constraints;
use crate::task_catalog::Task;

use sandbox::{exceeded_cpu_time, termination_signal, Sandbox, Stage, StageOutcome};
use workspace::{Workspace, BINARY_FILE, COMPILE_LOG, COMPLETION_RECORD, RUN_LOG, SOURCE_FILE};

/// Outcome of checking one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Correct,
    /// Compiler diagnostics, truncated.
    CompileError(String),
    /// First failing test vector or crash description, truncated.
    IncorrectSolution(String),
    TimedOut,
}

impl Verdict {
    pub fn is_correct(&self) -> bool {
        matches!(self, Verdict::Correct)
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Correct => write!(f, "correct"),
            Verdict::CompileError(_) => write!(f, "compile error"),
            Verdict::IncorrectSolution(_) => write!(f, "incorrect solution"),
            Verdict::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Something able to decide whether `source` solves `task`.
///
/// Implemented by [`Verifier`]; tests substitute scripted judges.
pub trait Judge: Send + Sync {
    fn judge(&self, source: &str, task: &Task) -> anyhow::Result<Verdict>;
}

/// Compiles and runs submissions with a C compiler.
#[derive(Debug, Clone)]
pub struct Verifier {
    compiler: String,
    constraints: Constraints,
    sandbox: Sandbox,
    workspace_root: Option<PathBuf>,
}

impl Verifier {
    /// Detects the isolation facilities of the host, see [`Sandbox::detect`].
    pub fn new(config: &Configuration, constraints: Constraints) -> anyhow::Result<Verifier> {
        let sandbox = Sandbox::detect(config, &constraints)?;
        info!(contained = sandbox.is_contained(), compiler = %config.compiler, "verifier ready");
        Ok(Self::with_sandbox(config, constraints, sandbox))
    }

    pub fn with_sandbox(config: &Configuration, constraints: Constraints, sandbox: Sandbox) -> Verifier {
        Verifier {
            compiler: config.compiler.clone(),
            constraints,
            sandbox,
            workspace_root: config.workspace_dir.clone(),
        }
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Builds `source` against the test vectors of `task` and runs it.
    ///
    /// The workspace is removed before returning, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Failures of the verifier itself (workspace, missing compiler, cgroups). Anything the
    /// submission does wrong is a [`Verdict`].
    #[instrument(skip_all, fields(task = %task.function_name))]
    pub fn verify(&self, source: &str, task: &Task) -> anyhow::Result<Verdict> {
        let workspace = Workspace::create(self.workspace_root.as_deref())?;
        let verdict = self.verify_in(&workspace, source, task);
        workspace.close();
        verdict
    }

    fn verify_in(&self, workspace: &Workspace, source: &str, task: &Task) -> anyhow::Result<Verdict> {
        let limit = self.constraints.diagnostic_limit;
        workspace.write(SOURCE_FILE, &harness::generate(source, task))?;

        let compile_args = [
            "-std=gnu11",
            "-O1",
            "-pipe",
            "-fdiagnostics-color=never",
            "-o",
            BINARY_FILE,
            SOURCE_FILE,
            "-lm",
        ];
        let compiled = self.sandbox.execute(
            Stage::Compile,
            &self.compiler,
            &compile_args,
            workspace.path(),
            &workspace.file(COMPILE_LOG),
            self.constraints.compile_limits(),
        )?;
        match compiled {
            StageOutcome::TimedOut => {
                return Ok(Verdict::CompileError("Compilation timed out".to_string()))
            }
            StageOutcome::Exited(status) if !status.success() => {
                let mut diagnostic = workspace.read_truncated(COMPILE_LOG, limit)?;
                if diagnostic.is_empty() {
                    diagnostic = format!("Compiler exited with {status}");
                }
                return Ok(Verdict::CompileError(diagnostic));
            }
            StageOutcome::Exited(_) => debug!("compiled {}", task.function_name),
        }

        let binary = format!("./{BINARY_FILE}");
        let token = Uuid::new_v4().simple().to_string();
        let ran = self.sandbox.execute(
            Stage::Run,
            &binary,
            &[&token],
            workspace.path(),
            &workspace.file(RUN_LOG),
            self.constraints.run_limits(),
        )?;
        let status = match ran {
            StageOutcome::TimedOut => return Ok(Verdict::TimedOut),
            StageOutcome::Exited(status) => status,
        };
        if status.success() {
            // the harness only writes the token after the last vector
            if workspace.read_truncated(COMPLETION_RECORD, token.len())? == token {
                return Ok(Verdict::Correct);
            }
            return Ok(Verdict::IncorrectSolution(
                "Program exited before checking every test".to_string(),
            ));
        }
        if exceeded_cpu_time(&status) {
            return Ok(Verdict::TimedOut);
        }

        let output = workspace.read_truncated(RUN_LOG, limit)?;
        let detail = match (termination_signal(&status), status.code()) {
            (_, Some(_)) if !output.is_empty() => output,
            (Some(signal), _) => {
                let crash = format!("Program terminated by signal {signal}");
                if output.is_empty() {
                    crash
                } else {
                    workspace::truncate_chars(&format!("{crash}: {output}"), limit)
                }
            }
            (None, Some(code)) => format!("Program exited with code {code}"),
            (None, None) => format!("Program exited with {status}"),
        };
        Ok(Verdict::IncorrectSolution(detail))
    }
}

impl Judge for Verifier {
    fn judge(&self, source: &str, task: &Task) -> anyhow::Result<Verdict> {
        self.verify(source, task)
    }
}
