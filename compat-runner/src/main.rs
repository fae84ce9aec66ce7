//! Command-line entry points: the build matrix, the incremental
//! determinism checks, and the index formatter.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};

use compat_runner::config::RunConfig;
use compat_runner::core::outcome::OutcomeKind;
use compat_runner::dispatch::Engine;
use compat_runner::incremental::Checker;
use compat_runner::io::index;
use compat_runner::io::process::{DEFAULT_TIMEOUT, ProcessExecutor};
use compat_runner::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "compat-runner",
    version,
    about = "Swift source-compatibility build and test runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build and test every selected project version against a toolchain.
    Run {
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        versions: VersionArgs,
    },
    /// Walk pinned commit sequences with incremental builds and check the
    /// build state they leave behind.
    Incremental {
        #[command(flatten)]
        build: BuildArgs,
        /// Also rebuild every commit from scratch and diff the two states.
        #[arg(long)]
        verify_determinism: bool,
        /// Escalate determinism mismatches from advisory to FAIL.
        #[arg(long)]
        expect_determinism: bool,
    },
    /// Rewrite the project index in canonical order.
    FormatIndex {
        /// Project index JSON, rewritten in place.
        #[arg(long, value_name = "PATH")]
        projects: PathBuf,
    },
}

/// Flags shared by both build subcommands.
#[derive(Args)]
struct BuildArgs {
    /// Compiler of the toolchain under test.
    #[arg(long, value_name = "PATH")]
    swiftc: PathBuf,
    /// Project index JSON.
    #[arg(long, value_name = "PATH")]
    projects: PathBuf,
    /// Language mode override; defaults to each version's label.
    #[arg(long, value_name = "VERS")]
    swift_version: Option<String>,
    /// Project selection predicate, repeatable.
    #[arg(long, value_name = "PRED")]
    include_repos: Vec<String>,
    /// Project exclusion predicate, repeatable; exclusion wins.
    #[arg(long, value_name = "PRED")]
    exclude_repos: Vec<String>,
    /// Action selection predicate, repeatable.
    #[arg(long, value_name = "PRED")]
    include_actions: Vec<String>,
    /// Action exclusion predicate, repeatable; exclusion wins.
    #[arg(long, value_name = "PRED")]
    exclude_actions: Vec<String>,
    /// Toolchain branch tag; part of the xfail context.
    #[arg(long, value_name = "BRANCH", default_value = "main")]
    swift_branch: String,
    /// Sandbox profile wrapping xcodebuild invocations.
    #[arg(long, value_name = "FILE")]
    sandbox_profile_xcodebuild: Option<PathBuf>,
    /// Sandbox profile wrapping package-manager invocations.
    #[arg(long, value_name = "FILE")]
    sandbox_profile_package: Option<PathBuf>,
    /// Extra compiler flags for package builds; `{field}` expands to the
    /// project entry's field.
    #[arg(long, value_name = "FLAGS")]
    add_swift_flags: Option<String>,
    /// Extra xcodebuild arguments; `{field}` expands as above.
    #[arg(long, value_name = "FLAGS")]
    add_xcodebuild_flags: Option<String>,
    /// Incremental mode: skip git cleans and build-tool cleans.
    #[arg(long)]
    skip_clean: bool,
    /// Build configuration override for every action.
    #[arg(long, value_name = "CONF", value_parser = ["debug", "release"])]
    build_config: Option<String>,
    /// Strip Xcode resource build phases before building.
    #[arg(long, value_name = "BOOL", default_value_t = true, action = ArgAction::Set)]
    strip_resource_phases: bool,
    /// Root directory holding one working tree per project.
    #[arg(long, value_name = "PATH", default_value = "project_cache")]
    project_cache_path: PathBuf,
    /// SWIFT_EXEC override handed to the build tools.
    #[arg(long, value_name = "PATH")]
    override_swift_exec: Option<PathBuf>,
    /// Run-kind tag distinguishing xfail expectation sets.
    #[arg(long, value_name = "NAME", default_value = "source-compat")]
    job_type: String,
    /// Per-command deadline in seconds.
    #[arg(long, value_name = "SECONDS")]
    default_timeout: Option<u64>,
    /// Concurrent projects; defaults to one per host CPU.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    /// Leaf output to stderr instead of per-action log files.
    #[arg(long)]
    verbose: bool,
}

impl BuildArgs {
    fn into_config(self) -> RunConfig {
        RunConfig {
            swiftc: self.swiftc,
            projects: self.projects,
            swift_version: self.swift_version,
            swift_branch: self.swift_branch,
            job_type: self.job_type,
            include_repos: self.include_repos,
            exclude_repos: self.exclude_repos,
            include_actions: self.include_actions,
            exclude_actions: self.exclude_actions,
            sandbox_profile_xcodebuild: self.sandbox_profile_xcodebuild,
            sandbox_profile_package: self.sandbox_profile_package,
            added_swift_flags: self.add_swift_flags,
            added_xcodebuild_flags: self.add_xcodebuild_flags,
            skip_clean: self.skip_clean,
            build_config: self.build_config,
            strip_resource_phases: self.strip_resource_phases,
            project_cache_path: self.project_cache_path,
            override_swift_exec: self.override_swift_exec,
            default_timeout: self
                .default_timeout
                .map_or(DEFAULT_TIMEOUT, Duration::from_secs),
            workers: self.workers,
            verbose: self.verbose,
            ..RunConfig::default()
        }
    }
}

/// Version-level selection, meaningful only for the full matrix.
#[derive(Args)]
struct VersionArgs {
    /// Version selection predicate, repeatable.
    #[arg(long, value_name = "PRED")]
    include_versions: Vec<String>,
    /// Version exclusion predicate, repeatable; exclusion wins.
    #[arg(long, value_name = "PRED")]
    exclude_versions: Vec<String>,
    /// Keep only the numerically highest version label per project.
    #[arg(long)]
    only_latest_versions: bool,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { build, versions } => {
            let mut config = build.into_config();
            config.include_versions = versions.include_versions;
            config.exclude_versions = versions.exclude_versions;
            config.only_latest_versions = versions.only_latest_versions;
            cmd_run(config)
        }
        Command::Incremental {
            build,
            verify_determinism,
            expect_determinism,
        } => {
            let mut config = build.into_config();
            config.verify_determinism = verify_determinism;
            config.expect_determinism = expect_determinism;
            cmd_incremental(config)
        }
        Command::FormatIndex { projects } => {
            index::format_index(&projects)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(config: RunConfig) -> Result<i32> {
    let projects = index::load_index(&config.projects)?;
    let executor = ProcessExecutor;
    let outcomes = Engine::new(&config, &executor).run_matrix(&projects)?;
    println!("{}", outcomes.summary());
    Ok(exit_code(outcomes.kind()))
}

fn cmd_incremental(config: RunConfig) -> Result<i32> {
    let projects = index::load_index(&config.projects)?;
    let executor = ProcessExecutor;
    let outcomes = Checker::new(&config, &executor).run_checks(&projects)?;
    println!("{}", outcomes.summary());
    Ok(exit_code(outcomes.kind()))
}

/// Exit 0 only when every leaf landed where the expectations put it.
fn exit_code(kind: OutcomeKind) -> i32 {
    match kind {
        OutcomeKind::Pass | OutcomeKind::XFail => exit_codes::OK,
        OutcomeKind::Fail | OutcomeKind::UPass => exit_codes::FAILED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse")
    }

    #[test]
    fn run_defaults_mirror_the_documented_cli() {
        let cli = parse(&[
            "compat-runner",
            "run",
            "--swiftc",
            "/tc/usr/bin/swiftc",
            "--projects",
            "projects.json",
        ]);
        let Command::Run { build, versions } = cli.command else {
            panic!("expected run");
        };
        assert!(!versions.only_latest_versions);
        let config = build.into_config();
        assert_eq!(config.swift_branch, "main");
        assert_eq!(config.job_type, "source-compat");
        assert!(config.strip_resource_phases);
        assert_eq!(config.project_cache_path, PathBuf::from("project_cache"));
        assert_eq!(config.default_timeout, Duration::from_secs(600));
        assert!(!config.skip_clean);
        assert!(!config.verbose);
    }

    #[test]
    fn predicates_accumulate_per_occurrence() {
        let cli = parse(&[
            "compat-runner",
            "run",
            "--swiftc",
            "swiftc",
            "--projects",
            "p.json",
            "--include-repos",
            r#"path == "Foo""#,
            "--include-repos",
            r#"path == "Bar""#,
            "--exclude-versions",
            r#"version == "3.0""#,
        ]);
        let Command::Run { build, versions } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(build.include_repos.len(), 2);
        assert_eq!(versions.exclude_versions, [r#"version == "3.0""#]);
    }

    #[test]
    fn strip_resource_phases_takes_an_explicit_bool() {
        let cli = parse(&[
            "compat-runner",
            "run",
            "--swiftc",
            "swiftc",
            "--projects",
            "p.json",
            "--strip-resource-phases",
            "false",
        ]);
        let Command::Run { build, .. } = cli.command else {
            panic!("expected run");
        };
        assert!(!build.strip_resource_phases);
    }

    #[test]
    fn build_config_rejects_unknown_values() {
        let args = [
            "compat-runner",
            "run",
            "--swiftc",
            "swiftc",
            "--projects",
            "p.json",
            "--build-config",
            "profile",
        ];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn default_timeout_is_given_in_seconds() {
        let cli = parse(&[
            "compat-runner",
            "run",
            "--swiftc",
            "swiftc",
            "--projects",
            "p.json",
            "--default-timeout",
            "30",
        ]);
        let Command::Run { build, .. } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(build.into_config().default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn incremental_takes_determinism_flags_but_no_version_predicates() {
        let cli = parse(&[
            "compat-runner",
            "incremental",
            "--swiftc",
            "swiftc",
            "--projects",
            "p.json",
            "--verify-determinism",
        ]);
        let Command::Incremental {
            verify_determinism,
            expect_determinism,
            ..
        } = cli.command
        else {
            panic!("expected incremental");
        };
        assert!(verify_determinism);
        assert!(!expect_determinism);

        let rejected = [
            "compat-runner",
            "incremental",
            "--swiftc",
            "swiftc",
            "--projects",
            "p.json",
            "--only-latest-versions",
        ];
        assert!(Cli::try_parse_from(rejected).is_err());
    }

    #[test]
    fn format_index_takes_only_the_index_path() {
        let cli = parse(&["compat-runner", "format-index", "--projects", "p.json"]);
        assert!(matches!(cli.command, Command::FormatIndex { .. }));
    }

    #[test]
    fn exit_codes_follow_the_merged_kind() {
        assert_eq!(exit_code(OutcomeKind::Pass), exit_codes::OK);
        assert_eq!(exit_code(OutcomeKind::XFail), exit_codes::OK);
        assert_eq!(exit_code(OutcomeKind::Fail), exit_codes::FAILED);
        assert_eq!(exit_code(OutcomeKind::UPass), exit_codes::FAILED);
    }
}
