//! Shared run configuration.
//!
//! Assembled once from the CLI before any worker starts and passed to every
//! component explicitly; nothing in the engine consults ambient global
//! state.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::io::commands::Toolchain;
use crate::io::process::DEFAULT_TIMEOUT;

/// Everything one run needs: toolchain, selection, build flavor, limits.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub swiftc: PathBuf,
    pub projects: PathBuf,
    pub swift_version: Option<String>,
    /// Toolchain branch tag; part of the xfail context.
    pub swift_branch: String,
    /// Run-kind tag distinguishing xfail expectation sets.
    pub job_type: String,
    pub include_repos: Vec<String>,
    pub exclude_repos: Vec<String>,
    pub include_versions: Vec<String>,
    pub exclude_versions: Vec<String>,
    pub include_actions: Vec<String>,
    pub exclude_actions: Vec<String>,
    pub sandbox_profile_xcodebuild: Option<PathBuf>,
    pub sandbox_profile_package: Option<PathBuf>,
    pub added_swift_flags: Option<String>,
    pub added_xcodebuild_flags: Option<String>,
    /// Incremental mode: skip git cleans and build-tool cleans.
    pub skip_clean: bool,
    pub build_config: Option<String>,
    pub strip_resource_phases: bool,
    /// Root directory holding one working tree per project.
    pub project_cache_path: PathBuf,
    pub override_swift_exec: Option<PathBuf>,
    pub only_latest_versions: bool,
    pub default_timeout: Duration,
    /// Worker count; `None` means one per host CPU.
    pub workers: Option<usize>,
    /// Leaf output to stderr instead of per-action log files.
    pub verbose: bool,
    /// Determinism checks: produce and diff full-build snapshots.
    pub verify_determinism: bool,
    /// Determinism checks: escalate snapshot mismatches to FAIL.
    pub expect_determinism: bool,
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig {
            swiftc: PathBuf::new(),
            projects: PathBuf::new(),
            swift_version: None,
            swift_branch: "main".to_string(),
            job_type: "source-compat".to_string(),
            include_repos: Vec::new(),
            exclude_repos: Vec::new(),
            include_versions: Vec::new(),
            exclude_versions: Vec::new(),
            include_actions: Vec::new(),
            exclude_actions: Vec::new(),
            sandbox_profile_xcodebuild: None,
            sandbox_profile_package: None,
            added_swift_flags: None,
            added_xcodebuild_flags: None,
            skip_clean: false,
            build_config: None,
            strip_resource_phases: true,
            project_cache_path: PathBuf::from("project_cache"),
            override_swift_exec: None,
            only_latest_versions: false,
            default_timeout: DEFAULT_TIMEOUT,
            workers: None,
            verbose: false,
            verify_determinism: false,
            expect_determinism: false,
        }
    }
}

impl RunConfig {
    /// The command-assembly view of this configuration.
    pub fn toolchain(&self) -> Toolchain {
        Toolchain {
            swiftc: self.swiftc.clone(),
            override_swift_exec: self.override_swift_exec.clone(),
            build_config: self.build_config.clone(),
            added_swift_flags: self.added_swift_flags.clone(),
            added_xcodebuild_flags: self.added_xcodebuild_flags.clone(),
            sandbox_profile_package: self.sandbox_profile_package.clone(),
            sandbox_profile_xcodebuild: self.sandbox_profile_xcodebuild.clone(),
            default_timeout: self.default_timeout,
        }
    }

    /// Configured worker count, defaulting to one per host CPU.
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            })
            .max(1)
    }
}
