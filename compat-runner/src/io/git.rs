//! Git checkout plumbing.
//!
//! Projects are pinned to exact revisions; this module brings a working
//! copy to the configured revision, falling back to a fresh clone when the
//! existing checkout cannot be updated in place.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::types::{ConfigError, ProjectEntry, current_platform};
use crate::io::action_log::ActionLog;
use crate::io::process::{CommandFailure, CommandSpec, Executor, check_capture, check_run};

/// Git operations bound to one executor and deadline.
pub struct Git<'a> {
    executor: &'a dyn Executor,
    timeout: Duration,
}

impl<'a> Git<'a> {
    pub fn new(executor: &'a dyn Executor, timeout: Duration) -> Git<'a> {
        Git { executor, timeout }
    }

    fn git(path: &Path, args: &[&str]) -> CommandSpec {
        let mut all = vec!["-C".to_string(), path.display().to_string()];
        all.extend(args.iter().map(|arg| (*arg).to_string()));
        CommandSpec::new("git", all)
    }

    fn run(&self, spec: &CommandSpec, log: &mut ActionLog) -> Result<()> {
        check_run(self.executor, spec, self.timeout, 1, log)
    }

    /// Remove untracked and ignored files. Clears user-immutable flags
    /// first on Darwin, where stray uchg bits make clean fail.
    pub fn clean(&self, path: &Path, log: &mut ActionLog) -> Result<()> {
        if current_platform() == "Darwin" {
            let target = path.display().to_string();
            let chflags = CommandSpec::new("chflags", ["-R", "nouchg", target.as_str()]);
            self.run(&chflags, log)?;
        }
        self.run(&Self::git(path, &["clean", "-ffdx"]), log)
    }

    pub fn fetch(&self, path: &Path, log: &mut ActionLog) -> Result<()> {
        self.run(&Self::git(path, &["fetch"]), log)
    }

    pub fn pull(&self, path: &Path, log: &mut ActionLog) -> Result<()> {
        self.run(&Self::git(path, &["pull"]), log)
    }

    pub fn checkout(
        &self,
        path: &Path,
        revision: &str,
        force: bool,
        log: &mut ActionLog,
    ) -> Result<()> {
        let spec = if force {
            Self::git(path, &["checkout", "-f", revision])
        } else {
            Self::git(path, &["checkout", revision])
        };
        self.run(&spec, log)
    }

    pub fn submodule_update(&self, path: &Path, log: &mut ActionLog) -> Result<()> {
        self.run(
            &Self::git(path, &["submodule", "update", "--init", "--recursive"]),
            log,
        )
    }

    /// The revision the working copy currently sits on.
    pub fn head_revision(&self, path: &Path, log: &mut ActionLog) -> Result<String> {
        check_capture(
            self.executor,
            &Self::git(path, &["rev-parse", "HEAD"]),
            self.timeout,
            log,
        )
    }

    /// Clone `url` into `path`, then check out `revision` and initialize
    /// submodules.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn clone_at(
        &self,
        url: &str,
        path: &Path,
        revision: Option<&str>,
        log: &mut ActionLog,
    ) -> Result<()> {
        let target = path.display().to_string();
        let clone = CommandSpec::new("git", ["clone", url, target.as_str()]);
        self.run(&clone, log)?;
        if let Some(revision) = revision {
            self.checkout(path, revision, true, log)?;
        }
        self.submodule_update(path, log)
    }

    /// Bring an existing checkout to `revision`: clean (unless
    /// `skip_clean`), compare HEAD, fetch plus forced checkout plus
    /// submodule update on mismatch, forced checkout alone on match. Any
    /// command failure along the way discards the checkout and clones
    /// fresh at the revision.
    #[instrument(skip_all, fields(path = %path.display(), revision))]
    pub fn update(
        &self,
        url: &str,
        revision: &str,
        path: &Path,
        skip_clean: bool,
        log: &mut ActionLog,
    ) -> Result<()> {
        let attempt = (|log: &mut ActionLog| -> Result<()> {
            if !skip_clean {
                self.clean(path, log)?;
            }
            let current = self.head_revision(path, log)?;
            debug!(current = %current, configured = %revision, path = %path.display(), "comparing revisions");
            if current != revision {
                self.fetch(path, log)?;
                self.checkout(path, revision, true, log)?;
                self.submodule_update(path, log)?;
            } else {
                self.checkout(path, revision, true, log)?;
            }
            Ok(())
        })(log);

        match attempt {
            Ok(()) => Ok(()),
            Err(err) if err.downcast_ref::<CommandFailure>().is_some() => {
                warn!(path = %path.display(), "unable to update, falling back to a clone");
                log.line("warning: Unable to update. Falling back to a clone.")?;
                remove_tree(path)?;
                self.clone_at(url, path, Some(revision), log)
            }
            Err(err) => Err(err),
        }
    }

    /// Check a project out at `revision` under `root`, cloning on first
    /// contact. Only Git repositories are supported.
    pub fn checkout_project(
        &self,
        root: &Path,
        project: &ProjectEntry,
        revision: &str,
        skip_clean: bool,
        log: &mut ActionLog,
    ) -> Result<PathBuf> {
        if project.repository != "Git" {
            return Err(ConfigError::UnsupportedRepository {
                project: project.path.clone(),
                kind: project.repository.clone(),
            }
            .into());
        }
        fs::create_dir_all(root).with_context(|| format!("create {}", root.display()))?;
        let path = root.join(&project.path);
        if path.exists() {
            self.update(&project.url, revision, &path, skip_clean, log)?;
        } else {
            self.clone_at(&project.url, &path, Some(revision), log)?;
        }
        Ok(path)
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
