//! Config for the server behaviors
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive: set them to `"true"` to enable.
//!
//! - `DUEL_BIND` — Address to listen on (default: `0.0.0.0:8765`)
//! - `DUEL_LOG` — Log to a timestamped file instead of stderr (default: `false`)
//! - `DUEL_LOG_LEVEL` — Maximum log level: `error`, `warn`, `info`, `debug`, `trace` (default: `info`)
//! - `DUEL_ALLOW_UNCONTAINED` — Run even if cgroups v2, `prlimit` or `unshare` are unavailable (default: `false`)
//! - `DUEL_ISOLATE_NETWORK` — Run submissions without network access (default: `true`)
//! - `DUEL_ISOLATE_FILESYSTEM` — Run submissions with a read-only filesystem outside their workspace (default: `true`)
//! - `DUEL_CC` — C compiler used to build submissions (default: `gcc`)
//! - `DUEL_WORKSPACE_DIR` — Where disposable workspaces are created (default: system temp dir)

use std::path::PathBuf;
use std::str::FromStr;

use tracing::{warn, Level};

const DEFAULT_BIND: &str = "0.0.0.0:8765";
const DEFAULT_COMPILER: &str = "gcc";

/// Configuration for server behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) bind: String,
    pub(crate) log: bool,
    pub(crate) log_level: Level,
    pub(crate) allow_uncontained: bool,
    pub(crate) isolate_network: bool,
    pub(crate) isolate_filesystem: bool,
    pub(crate) compiler: String,
    pub(crate) workspace_dir: Option<PathBuf>,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - The server listens on `0.0.0.0:8765`.
    /// - Logs go to stderr at `info` level.
    /// - Missing isolation facilities are fatal.
    /// - Submissions run without network access and can only write to their workspace.
    /// - Submissions are compiled with `gcc` in the system temp dir.
    pub fn new() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            log: false,
            log_level: Level::INFO,
            allow_uncontained: false,
            isolate_network: true,
            isolate_filesystem: true,
            compiler: DEFAULT_COMPILER.to_string(),
            workspace_dir: None,
        }
    }

    /// Create configuration from environment variables (see module documentation).
    ///
    /// Any unset or unparsable value results in the default value for that field.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_string(var: &str) -> Option<String> {
            std::env::var(var).ok().filter(|v| !v.trim().is_empty())
        }

        let defaults = Self::new();
        let log_level = match get_env_string("DUEL_LOG_LEVEL") {
            Some(level) => Level::from_str(level.trim()).unwrap_or_else(|_| {
                warn!("unknown DUEL_LOG_LEVEL '{level}', using {}", defaults.log_level);
                defaults.log_level
            }),
            None => defaults.log_level,
        };

        Self {
            bind: get_env_string("DUEL_BIND").unwrap_or(defaults.bind),
            log: get_env_flag("DUEL_LOG", defaults.log),
            log_level,
            allow_uncontained: get_env_flag("DUEL_ALLOW_UNCONTAINED", defaults.allow_uncontained),
            isolate_network: get_env_flag("DUEL_ISOLATE_NETWORK", defaults.isolate_network),
            isolate_filesystem: get_env_flag("DUEL_ISOLATE_FILESYSTEM", defaults.isolate_filesystem),
            compiler: get_env_string("DUEL_CC").unwrap_or(defaults.compiler),
            workspace_dir: get_env_string("DUEL_WORKSPACE_DIR").map(PathBuf::from),
        }
    }

    /// Set the listening address.
    pub fn with_bind(mut self, address: impl Into<String>) -> Self {
        self.bind = address.into();
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Set the maximum log level.
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Enable or disable unsafe fallbacks.
    ///
    /// When enabled, missing isolation facilities only produce a warning and submissions are
    /// bounded by wall-clock budgets alone.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable the network namespace around submissions.
    pub fn with_isolate_network(mut self, value: bool) -> Self {
        self.isolate_network = value;
        self
    }

    /// Enable or disable the mount namespace that leaves only the workspace writable.
    pub fn with_isolate_filesystem(mut self, value: bool) -> Self {
        self.isolate_filesystem = value;
        self
    }

    /// Set the C compiler executable.
    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = compiler.into();
        self
    }

    /// Set the parent directory of disposable workspaces.
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(dir.into());
        self
    }

    pub fn bind(&self) -> &str {
        &self.bind
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}
