//! Disposable directory holding everything one verification produces.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;
use tracing::warn;

pub const SOURCE_FILE: &str = "solution.c";
pub const BINARY_FILE: &str = "solution";
pub const COMPILE_LOG: &str = "compile.stderr";
pub const RUN_LOG: &str = "run.stderr";
/// Written by the harness once every test vector has been checked.
pub const COMPLETION_RECORD: &str = "duel.done";

/// A fresh directory removed when dropped, on every exit path including unwinding.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates a workspace under `root`, or under the system temp dir.
    pub fn create(root: Option<&Path>) -> anyhow::Result<Workspace> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("duel-");
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)
                    .with_context(|| format!("could not create {}", root.display()))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .context("could not create workspace directory")?;
        Ok(Workspace { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn write(&self, name: &str, content: &str) -> anyhow::Result<PathBuf> {
        let path = self.file(name);
        fs::write(&path, content).with_context(|| format!("could not write {}", path.display()))?;
        Ok(path)
    }

    /// Reads at most `limit` characters of a text file. A missing file reads as empty.
    pub fn read_truncated(&self, name: &str, limit: usize) -> anyhow::Result<String> {
        let path = self.file(name);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e).with_context(|| format!("could not open {}", path.display())),
        };
        // a char is at most 4 bytes, one more byte tells whether something was cut
        let mut bytes = Vec::new();
        file.take((limit as u64).saturating_mul(4) + 1)
            .read_to_end(&mut bytes)
            .with_context(|| format!("could not read {}", path.display()))?;
        Ok(truncate_chars(&String::from_utf8_lossy(&bytes), limit))
    }

    /// Removes the directory now, reporting failures instead of ignoring them.
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!("could not remove workspace {}: {e}", path.display());
        }
    }
}

/// Cuts `text` to `limit` characters, marking the cut with `...`.
pub fn truncate_chars(text: &str, limit: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
