//! Scripted doubles and fixtures for tests.
//!
//! Compiled only with the `test-support` feature, which the crate's own
//! dev-dependency enables. The fake executor replaces [`ProcessExecutor`]
//! so engine tests can script exit codes and captured output per command
//! without spawning anything; the test cache stands in for the on-disk
//! project cache.
//!
//! [`ProcessExecutor`]: crate::io::process::ProcessExecutor

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::io::action_log::ActionLog;
use crate::io::process::{Captured, CommandSpec, Executor, RunStatus, TIMEOUT_EXIT_CODE};

struct Rule {
    pattern: String,
    codes: VecDeque<i32>,
    stdout: String,
}

/// Executor that records every rendered command and replays scripted
/// responses. A command matches the first rule whose pattern occurs as a
/// substring of its rendered form; rules with exhausted exit codes report
/// success. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakeExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> FakeExecutor {
        FakeExecutor::default()
    }

    /// Queue exit codes for commands matching `pattern`, consumed one per
    /// call. Once drained the command succeeds again.
    pub fn queue_failures(&self, pattern: &str, codes: &[i32]) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|rule| rule.pattern == pattern) {
            rule.codes.extend(codes);
            return;
        }
        rules.push(Rule {
            pattern: pattern.to_string(),
            codes: codes.iter().copied().collect(),
            stdout: String::new(),
        });
    }

    /// Fixed stdout for captures matching `pattern`.
    pub fn set_stdout(&self, pattern: &str, stdout: &str) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|rule| rule.pattern == pattern) {
            rule.stdout = stdout.to_string();
            return;
        }
        rules.push(Rule {
            pattern: pattern.to_string(),
            codes: VecDeque::new(),
            stdout: stdout.to_string(),
        });
    }

    /// Every command executed so far, rendered as logged.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of executed commands containing `pattern`.
    pub fn calls_matching(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.contains(pattern))
            .count()
    }

    fn respond(&self, spec: &CommandSpec) -> (RunStatus, String) {
        let rendered = spec.rendered();
        self.calls.lock().unwrap().push(rendered.clone());
        let mut rules = self.rules.lock().unwrap();
        let Some(rule) = rules.iter_mut().find(|rule| rendered.contains(&rule.pattern)) else {
            return (
                RunStatus {
                    code: 0,
                    timed_out: false,
                },
                String::new(),
            );
        };
        let code = rule.codes.pop_front().unwrap_or(0);
        (
            RunStatus {
                code,
                timed_out: code == TIMEOUT_EXIT_CODE,
            },
            rule.stdout.clone(),
        )
    }
}

impl Executor for FakeExecutor {
    fn execute(
        &self,
        spec: &CommandSpec,
        _timeout: Duration,
        log: &mut ActionLog,
    ) -> Result<RunStatus> {
        log.line(&format!("$ {}", spec.rendered()))?;
        Ok(self.respond(spec).0)
    }

    fn capture(
        &self,
        spec: &CommandSpec,
        _timeout: Duration,
        log: &mut ActionLog,
    ) -> Result<Captured> {
        log.line(&format!("$ {}", spec.rendered()))?;
        let (status, stdout) = self.respond(spec);
        Ok(Captured { status, stdout })
    }
}

/// Disposable workspace for engine tests: a temp directory holding the
/// project cache with an index file beside it.
pub struct TestCache {
    dir: tempfile::TempDir,
}

impl TestCache {
    pub fn new() -> Result<TestCache> {
        Ok(TestCache {
            dir: tempfile::tempdir().context("create test cache")?,
        })
    }

    /// Root handed to `project_cache_path`.
    pub fn cache(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Write `index` as the projects file and return its path.
    pub fn write_index(&self, index: &Value) -> Result<PathBuf> {
        let path = self.dir.path().join("projects.json");
        let raw = serde_json::to_string_pretty(index).context("serialize test index")?;
        fs::write(&path, raw).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Pre-create a project working tree so checkouts take the update path
    /// instead of cloning.
    pub fn seed_work_tree(&self, project: &str) -> Result<PathBuf> {
        let tree = self.cache().join(project);
        fs::create_dir_all(&tree).with_context(|| format!("create {}", tree.display()))?;
        Ok(tree)
    }

    /// Pre-populate a package build directory with one object file, standing
    /// in for build output the scripted executor never produces.
    pub fn seed_build_state(&self, project: &str) -> Result<PathBuf> {
        let build = self.seed_work_tree(project)?.join(".build");
        fs::create_dir_all(&build).with_context(|| format!("create {}", build.display()))?;
        fs::write(build.join("app.o"), "object").context("write object file")?;
        Ok(build)
    }
}
