//! Per-action log sinks.
//!
//! Every leaf execution writes to an isolated log file named after the
//! project/version/action tuple; on completion the file is renamed with the
//! outcome kind prefixed so triage can glob by result. In verbose mode the
//! sink passes everything through to stderr and no file exists.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::core::outcome::OutcomeKind;
use crate::core::types::{Action, ProjectEntry};

/// Sink for one action's command echo and build output.
#[derive(Debug)]
pub enum ActionLog {
    File { path: PathBuf, file: File },
    Passthrough,
}

impl ActionLog {
    /// Create `<dir>/<name>`, truncating any leftover from a previous run.
    pub fn create(dir: &Path, name: &str) -> Result<ActionLog> {
        let path = dir.join(name);
        let file =
            File::create(&path).with_context(|| format!("create log {}", path.display()))?;
        Ok(ActionLog::File { path, file })
    }

    /// Verbose-mode sink: everything goes to stderr, nothing is renamed.
    pub fn passthrough() -> ActionLog {
        ActionLog::Passthrough
    }

    /// Write one line and flush immediately so tailing consumers see it
    /// before the command it announces starts.
    pub fn line(&mut self, text: &str) -> Result<()> {
        match self {
            ActionLog::File { path, file } => {
                writeln!(file, "{text}").with_context(|| format!("write {}", path.display()))?;
                file.flush().with_context(|| format!("flush {}", path.display()))
            }
            ActionLog::Passthrough => {
                eprintln!("{text}");
                Ok(())
            }
        }
    }

    /// A stdio handle for child process redirection. Call once per stream.
    pub fn stdio(&self) -> Result<Stdio> {
        match self {
            ActionLog::File { path, file } => {
                let clone = file
                    .try_clone()
                    .with_context(|| format!("clone log handle {}", path.display()))?;
                Ok(Stdio::from(clone))
            }
            ActionLog::Passthrough => Ok(Stdio::inherit()),
        }
    }

    /// Rename the log to `<KIND>_<name>` once the outcome is known. Returns
    /// the final path for file-backed sinks.
    pub fn finalize(self, kind: OutcomeKind) -> Result<Option<PathBuf>> {
        match self {
            ActionLog::File { path, file } => {
                drop(file);
                let name = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or_default();
                let renamed = path.with_file_name(format!("{kind}_{name}"));
                fs::rename(&path, &renamed).with_context(|| {
                    format!("rename {} -> {}", path.display(), renamed.display())
                })?;
                debug!(log = %renamed.display(), "finalized action log");
                Ok(Some(renamed))
            }
            ActionLog::Passthrough => Ok(None),
        }
    }
}

static UNSAFE_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w_.]+").unwrap());

/// Log file name for one leaf: project path (with the action's project-file
/// prefix when present), optional version label, action kind, then scheme or
/// target and destination when the action carries them. Runs of characters
/// outside `[\w_.]` collapse to `-`.
pub fn action_log_name(
    project: &ProjectEntry,
    version: Option<&str>,
    action: &Action,
) -> String {
    let project_file_prefix = action
        .project
        .as_deref()
        .and_then(|name| name.split('-').next())
        .unwrap_or_default();
    let project_identifier = format!("{} {}", project.path, project_file_prefix);

    let mut parts = vec![project_identifier.trim().to_string()];
    if let Some(version) = version {
        parts.push(version.trim().to_string());
    }
    parts.push(action.action.trim().to_string());
    if let Some(scheme_or_target) = action.scheme_or_target() {
        parts.push(scheme_or_target.to_string());
    }
    if let Some(destination) = &action.destination {
        parts.push(destination.clone());
    }

    let identifier = parts.join("_");
    let sanitized = UNSAFE_RUNS.replace_all(&identifier, "-");
    format!(
        "{}.log",
        sanitized.trim_matches('-').trim_matches('_')
    )
}
