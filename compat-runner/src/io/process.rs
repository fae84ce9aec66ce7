//! Command execution with deadlines and retries.
//!
//! All external commands flow through the [`Executor`] trait so the engine
//! never spawns directly; tests substitute a scripted implementation. The
//! real executor echoes each command to the action log before spawning,
//! redirects child output to the same log, and converts a blown deadline
//! into the conventional exit code 124 after killing the child.

use std::borrow::Cow;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::io::action_log::ActionLog;

/// Exit code reported when a command is killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Deadline applied when the configuration does not override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// One external command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> CommandSpec {
        self.cwd = Some(dir.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> CommandSpec
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// The command as it is echoed to logs, shell-quoted.
    pub fn rendered(&self) -> String {
        shell_join(
            std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)),
        )
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus {
    pub code: i32,
    pub timed_out: bool,
}

impl RunStatus {
    pub fn success(self) -> bool {
        self.code == 0
    }
}

/// Captured stdout of a query command.
#[derive(Debug, Clone)]
pub struct Captured {
    pub status: RunStatus,
    pub stdout: String,
}

/// A failing command after all retries, carrying the rendered command line
/// and the final exit code. Timeouts surface here with code 124.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub command: String,
    pub code: i32,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command exited with code {}: {}", self.code, self.command)
    }
}

impl std::error::Error for CommandFailure {}

/// Spawns external commands. The single seam between the engine and the
/// operating system.
pub trait Executor: Sync {
    /// Run `spec` to completion under `timeout`, child output redirected to
    /// `log`. Spawn failures are errors; non-zero exits are not.
    fn execute(&self, spec: &CommandSpec, timeout: Duration, log: &mut ActionLog)
    -> Result<RunStatus>;

    /// Run `spec` and capture its stdout. Stderr still goes to `log`.
    fn capture(&self, spec: &CommandSpec, timeout: Duration, log: &mut ActionLog)
    -> Result<Captured>;
}

/// Executor backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn command(spec: &CommandSpec) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    fn wait_with_deadline(
        spec: &CommandSpec,
        child: &mut std::process::Child,
        timeout: Duration,
        log: &mut ActionLog,
    ) -> Result<RunStatus> {
        let status = child
            .wait_timeout(timeout)
            .with_context(|| format!("wait for {}", spec.program))?;
        match status {
            Some(status) => Ok(RunStatus {
                // A signal-terminated child has no exit code.
                code: status.code().unwrap_or(-1),
                timed_out: false,
            }),
            None => {
                warn!(program = %spec.program, ?timeout, "command timed out, killing");
                child
                    .kill()
                    .with_context(|| format!("kill {}", spec.program))?;
                child
                    .wait()
                    .with_context(|| format!("reap {}", spec.program))?;
                log.line(&format!("{}: Timed out", spec.program))?;
                Ok(RunStatus {
                    code: TIMEOUT_EXIT_CODE,
                    timed_out: true,
                })
            }
        }
    }
}

impl Executor for ProcessExecutor {
    fn execute(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        log: &mut ActionLog,
    ) -> Result<RunStatus> {
        log.line(&format!("$ {}", spec.rendered()))?;
        let mut child = Self::command(spec)
            .stdin(Stdio::null())
            .stdout(log.stdio()?)
            .stderr(log.stdio()?)
            .spawn()
            .with_context(|| format!("spawn {}", spec.rendered()))?;
        Self::wait_with_deadline(spec, &mut child, timeout, log)
    }

    fn capture(
        &self,
        spec: &CommandSpec,
        timeout: Duration,
        log: &mut ActionLog,
    ) -> Result<Captured> {
        log.line(&format!("$ {}", spec.rendered()))?;
        let mut child = Self::command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(log.stdio()?)
            .spawn()
            .with_context(|| format!("spawn {}", spec.rendered()))?;

        // Drain stdout on a separate thread so a chatty child cannot fill
        // the pipe and deadlock against wait().
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout not piped for {}", spec.program))?;
        let reader = thread::spawn(move || -> Result<Vec<u8>> {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).context("read child stdout")?;
            Ok(buf)
        });

        let status = Self::wait_with_deadline(spec, &mut child, timeout, log)?;
        let bytes = reader
            .join()
            .map_err(|_| anyhow!("stdout reader panicked for {}", spec.program))??;
        Ok(Captured {
            status,
            stdout: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

/// Run `spec`, retrying on non-zero exit up to `max_retries` attempts in
/// total. The first zero exit wins; exhausting every attempt yields a
/// [`CommandFailure`] carrying the last exit code.
pub fn check_run(
    executor: &dyn Executor,
    spec: &CommandSpec,
    timeout: Duration,
    max_retries: u32,
    log: &mut ActionLog,
) -> Result<()> {
    let attempts = max_retries.max(1);
    let mut last = RunStatus {
        code: -1,
        timed_out: false,
    };
    for attempt in 1..=attempts {
        let status = executor.execute(spec, timeout, log)?;
        if status.success() {
            debug!(attempt, command = %spec.rendered(), "command succeeded");
            return Ok(());
        }
        warn!(attempt, attempts, code = status.code, command = %spec.rendered(), "command failed");
        last = status;
    }
    Err(CommandFailure {
        command: spec.rendered(),
        code: last.code,
    }
    .into())
}

/// Run `spec` and return trimmed stdout, failing on non-zero exit.
pub fn check_capture(
    executor: &dyn Executor,
    spec: &CommandSpec,
    timeout: Duration,
    log: &mut ActionLog,
) -> Result<String> {
    let captured = executor.capture(spec, timeout, log)?;
    if !captured.status.success() {
        return Err(CommandFailure {
            command: spec.rendered(),
            code: captured.status.code,
        }
        .into());
    }
    Ok(captured.stdout.trim().to_string())
}

const SHELL_SAFE: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789@%_-+=:,./";

fn shell_quote(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && arg.chars().all(|c| SHELL_SAFE.contains(c)) {
        return Cow::Borrowed(arg);
    }
    Cow::Owned(format!("'{}'", arg.replace('\'', r#"'"'"'"#)))
}

/// Join command parts for display, quoting anything a shell would mangle.
pub fn shell_join<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}
