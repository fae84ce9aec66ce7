//! Incremental-build determinism checks over pinned commit sequences.
//!
//! For each selected project, action, and labeled commit sequence: build the
//! first commit from scratch, then advance commit by commit with incremental
//! builds, snapshotting the build-state directory after every step. The
//! first result outside PASS/XFAIL ends the sequence and becomes its
//! result. With `--verify-determinism` each incremental snapshot is also
//! diffed against an independent full build of the same commit.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::config::RunConfig;
use crate::core::outcome::{ActionOutcome, OutcomeKind, OutcomeSet};
use crate::core::predicate::SelectionFilter;
use crate::core::types::{Action, ActionKind, IncrementalSpec, ProjectEntry};
use crate::dispatch::{classify_dispatch, eligible_projects, leaf_log};
use crate::io::action_log::{ActionLog, action_log_name};
use crate::io::commands::{build_state_dir, plan_action};
use crate::io::git::Git;
use crate::io::process::{Executor, check_run};
use crate::io::snapshot::{self, SnapshotFlavor, ignored_names, snapshot_name};
use crate::pool;

/// Quiescence window after a dispatch, before the build state is copied.
/// Build tools keep touching bookkeeping files briefly after exiting.
const SETTLE: Duration = Duration::from_secs(2);

/// Drives the determinism checks for one run.
pub struct Checker<'a> {
    config: &'a RunConfig,
    executor: &'a dyn Executor,
}

impl<'a> Checker<'a> {
    pub fn new(config: &'a RunConfig, executor: &'a dyn Executor) -> Checker<'a> {
        Checker { config, executor }
    }

    /// Run every commit sequence of every selected project and merge the
    /// results, ordered as the index orders the projects.
    pub fn run_checks(&self, index: &[ProjectEntry]) -> Result<OutcomeSet> {
        let projects = SelectionFilter::new(&self.config.include_repos, &self.config.exclude_repos)?;
        let actions = SelectionFilter::new(&self.config.include_actions, &self.config.exclude_actions)?;
        let selected = eligible_projects(index, &projects);
        debug!(
            selected = selected.len(),
            indexed = index.len(),
            "dispatching determinism checks"
        );
        let outcomes = pool::run_projects(&selected, self.config.worker_count(), |project| {
            self.check_project(project, &actions)
        })?;
        let mut merged = OutcomeSet::new();
        for outcome in outcomes {
            merged.add(outcome);
        }
        Ok(merged)
    }

    #[instrument(skip_all, fields(project = %project.path))]
    fn check_project(&self, project: &ProjectEntry, actions: &SelectionFilter) -> Result<OutcomeSet> {
        let mut set = OutcomeSet::new();
        for action in &project.actions {
            if !actions.selects(action) {
                continue;
            }
            for (label, spec) in &project.incremental {
                if spec.excludes(action) {
                    debug!(label, action = %action.action, "limit map excludes action");
                    continue;
                }
                if spec.commits.is_empty() {
                    debug!(label, "empty commit sequence, nothing to check");
                    continue;
                }
                let mut log = leaf_log(
                    self.config.verbose,
                    &action_log_name(project, Some(label), action),
                )?;
                let outcome = self.check_sequence(project, action, label, spec, &mut log)?;
                info!("{}", outcome.message);
                log.finalize(outcome.kind)?;
                let stop = !continues(&outcome);
                set.add_action(outcome);
                // A bad result abandons the remaining sequences of this
                // action; the next action still runs.
                if stop {
                    break;
                }
            }
        }
        Ok(set)
    }

    fn check_sequence(
        &self,
        project: &ProjectEntry,
        action: &Action,
        label: &str,
        spec: &IncrementalSpec,
        log: &mut ActionLog,
    ) -> Result<ActionOutcome> {
        let work_tree = self.config.project_cache_path.join(&project.path);
        let sequence = Sequence {
            config: self.config,
            executor: self.executor,
            project,
            action,
            label,
            kind: action.kind()?,
            build_state: build_state_dir(&work_tree, project, action)?,
            snapshots: snapshot_root(&work_tree),
            work_tree,
        };
        sequence.run(&spec.commits, log)
    }
}

/// One commit sequence for one (action, label) pair, with the paths every
/// step shares.
struct Sequence<'a> {
    config: &'a RunConfig,
    executor: &'a dyn Executor,
    project: &'a ProjectEntry,
    action: &'a Action,
    label: &'a str,
    kind: ActionKind,
    work_tree: PathBuf,
    build_state: PathBuf,
    snapshots: PathBuf,
}

impl Sequence<'_> {
    #[instrument(skip_all, fields(project = %self.project.path, action = %self.action.action, label = self.label))]
    fn run(&self, commits: &[String], log: &mut ActionLog) -> Result<ActionOutcome> {
        if self.snapshots.exists() {
            fs::remove_dir_all(&self.snapshots)
                .with_context(|| format!("remove {}", self.snapshots.display()))?;
        }
        fs::create_dir_all(&self.snapshots)
            .with_context(|| format!("create {}", self.snapshots.display()))?;

        let git = Git::new(self.executor, self.config.default_timeout);
        let mut last = None;
        let mut prev: Option<&str> = None;
        for (seq, commit) in commits.iter().enumerate() {
            let outcome = match prev {
                None => {
                    log.line(&format!(
                        "Doing full build #{seq:03} of {}: {}",
                        self.project.path,
                        short(commit)
                    ))?;
                    git.checkout_project(
                        &self.config.project_cache_path,
                        self.project,
                        commit,
                        true,
                        log,
                    )?;
                    let outcome = self.build_step(commit, false, log)?;
                    if continues(&outcome) {
                        thread::sleep(SETTLE);
                        snapshot::save(
                            &self.build_state,
                            &self.snapshot_path(seq, SnapshotFlavor::Full, commit),
                        )?;
                    }
                    outcome
                }
                Some(prev) => {
                    log.line(&format!(
                        "Doing incr build #{seq} of {}: {} -> {}",
                        self.project.path,
                        short(prev),
                        short(commit)
                    ))?;
                    git.checkout(&self.work_tree, commit, false, log)?;
                    git.submodule_update(&self.work_tree, log)?;
                    let outcome = self.build_step(commit, true, log)?;
                    if continues(&outcome) {
                        thread::sleep(SETTLE);
                        let incr_snapshot = self.snapshot_path(seq, SnapshotFlavor::Incr, commit);
                        snapshot::save(&self.build_state, &incr_snapshot)?;
                        if self.config.verify_determinism
                            && let Some(mismatch) =
                                self.verify_step(seq, commit, &incr_snapshot, log)?
                        {
                            return Ok(mismatch);
                        }
                    }
                    outcome
                }
            };
            if !continues(&outcome) {
                return Ok(outcome);
            }
            last = Some(outcome);
            prev = Some(commit.as_str());
        }
        last.context("commit sequence yielded no result")
    }

    /// Plan and run the build commands for one step, then classify the
    /// result against the action's known-failure rules. The sequence label
    /// stands in for the compatibility version.
    fn build_step(&self, commit: &str, incremental: bool, log: &mut ActionLog) -> Result<ActionOutcome> {
        let swift_version = self.config.swift_version.as_deref().unwrap_or(self.label);
        let dispatched = (|log: &mut ActionLog| -> Result<()> {
            let planned = plan_action(
                &self.config.toolchain(),
                &self.work_tree,
                self.project,
                self.action,
                Some(swift_version),
                incremental,
            )?;
            for command in &planned {
                check_run(self.executor, &command.spec, command.timeout, 1, log)?;
            }
            Ok(())
        })(log);
        classify_dispatch(
            self.config,
            self.project,
            self.label,
            commit,
            self.action,
            dispatched,
        )
    }

    /// Rebuild `commit` from scratch and diff the result against the
    /// incremental snapshot. A mismatch is advisory unless determinism is
    /// expected, in which case it comes back as a FAIL to end the sequence.
    /// Afterwards the working build state is the incremental one again.
    fn verify_step(
        &self,
        seq: usize,
        commit: &str,
        incr_snapshot: &Path,
        log: &mut ActionLog,
    ) -> Result<Option<ActionOutcome>> {
        if self.build_state.exists() {
            fs::remove_dir_all(&self.build_state)
                .with_context(|| format!("remove {}", self.build_state.display()))?;
        }
        fs::create_dir_all(&self.build_state)
            .with_context(|| format!("create {}", self.build_state.display()))?;
        let outcome = self.build_step(commit, false, log)?;
        if !continues(&outcome) {
            return Ok(Some(outcome));
        }
        thread::sleep(SETTLE);
        let full_snapshot = self.snapshot_path(seq, SnapshotFlavor::Full, commit);
        snapshot::save(&self.build_state, &full_snapshot)?;

        let incr_name = snapshot_name(seq, SnapshotFlavor::Incr, commit);
        log.line(&format!(
            "Comparing dirs {} vs. {incr_name}",
            full_snapshot.display()
        ))?;
        let diff = snapshot::compare_trees(&full_snapshot, incr_snapshot, ignored_names(self.kind))?;
        if !diff.is_clean() {
            for line in diff.describe() {
                log.line(&line)?;
            }
            let message = format!("Dirs differ: {} vs. {incr_name}", full_snapshot.display());
            if self.config.expect_determinism {
                return Ok(Some(ActionOutcome::new(OutcomeKind::Fail, message)));
            }
            warn!(
                project = %self.project.path,
                step = seq,
                "incremental build state diverged from the full build"
            );
            log.line(&message)?;
        }
        snapshot::restore(incr_snapshot, &self.build_state)?;
        Ok(None)
    }

    fn snapshot_path(&self, seq: usize, flavor: SnapshotFlavor, commit: &str) -> PathBuf {
        self.snapshots.join(snapshot_name(seq, flavor, commit))
    }
}

fn continues(outcome: &ActionOutcome) -> bool {
    matches!(outcome.kind, OutcomeKind::Pass | OutcomeKind::XFail)
}

fn short(commit: &str) -> String {
    commit.chars().take(7).collect()
}

/// Private snapshot directory for one working tree, a sibling named after
/// it.
fn snapshot_root(work_tree: &Path) -> PathBuf {
    let mut root = work_tree.as_os_str().to_owned();
    root.push("-incr");
    PathBuf::from(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeExecutor;

    const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const SHA_C: &str = "cccccccccccccccccccccccccccccccccccccccc";

    fn config(cache: &Path) -> RunConfig {
        RunConfig {
            swiftc: PathBuf::from("/toolchain/usr/bin/swiftc"),
            projects: PathBuf::from("projects.json"),
            project_cache_path: cache.to_path_buf(),
            workers: Some(1),
            verbose: true,
            ..RunConfig::default()
        }
    }

    fn index(incremental: serde_json::Value) -> Vec<ProjectEntry> {
        serde_json::from_value(serde_json::json!([{
            "path": "Foo",
            "repository": "Git",
            "url": "https://example.com/foo.git",
            "branch": "main",
            "actions": [{"action": "BuildSwiftPackage", "configuration": "debug"}],
            "incremental": incremental,
        }]))
        .unwrap()
    }

    fn seed_build_state(cache: &Path) {
        let build = cache.join("Foo/.build");
        fs::create_dir_all(&build).unwrap();
        fs::write(build.join("app.o"), "object").unwrap();
    }

    #[test]
    fn full_then_incremental_builds_snapshot_each_step() {
        let cache = tempfile::tempdir().unwrap();
        seed_build_state(cache.path());
        let config = config(cache.path());
        let executor = FakeExecutor::new();
        executor.set_stdout("rev-parse", SHA_A);

        let set = Checker::new(&config, &executor)
            .run_checks(&index(serde_json::json!({
                "5.0": {"commits": [SHA_A, SHA_B]},
            })))
            .unwrap();

        assert_eq!(set.kind(), OutcomeKind::Pass);
        assert_eq!(
            set.leaves()[0].message,
            "PASS: Foo, 5.0, bbbbbb, Swift Package"
        );

        // c0 is a full checkout plus full build, c1 a bare checkout plus
        // incremental build.
        assert_eq!(executor.calls_matching(&format!("checkout -f {SHA_A}")), 1);
        assert_eq!(executor.calls_matching(&format!("checkout {SHA_B}")), 1);
        assert_eq!(executor.calls_matching("submodule update"), 1);
        assert_eq!(executor.calls_matching("swift build"), 2);
        assert_eq!(executor.calls_matching(" clean"), 1);

        let snapshots = cache.path().join("Foo-incr");
        assert!(snapshots.join("build-state-000-full-aaaaaaa/app.o").is_file());
        assert!(snapshots.join("build-state-001-incr-bbbbbbb/app.o").is_file());
    }

    #[test]
    fn early_exit_abandons_the_remaining_commits() {
        let cache = tempfile::tempdir().unwrap();
        seed_build_state(cache.path());
        let config = config(cache.path());
        let executor = FakeExecutor::new();
        executor.set_stdout("rev-parse", SHA_A);
        executor.queue_failures("swift build", &[0, 1]);

        let set = Checker::new(&config, &executor)
            .run_checks(&index(serde_json::json!({
                "5.0": {"commits": [SHA_A, SHA_B, SHA_C]},
            })))
            .unwrap();

        assert_eq!(set.kind(), OutcomeKind::Fail);
        assert_eq!(
            set.leaves()[0].message,
            "FAIL: Foo, 5.0, bbbbbb, Swift Package"
        );
        assert_eq!(executor.calls_matching(&format!("checkout {SHA_C}")), 0);

        let snapshots = cache.path().join("Foo-incr");
        assert!(snapshots.join("build-state-000-full-aaaaaaa").is_dir());
        assert!(!snapshots.join("build-state-001-incr-bbbbbbb").exists());
    }

    #[test]
    fn limit_map_skips_mismatched_actions() {
        let cache = tempfile::tempdir().unwrap();
        let config = config(cache.path());
        let executor = FakeExecutor::new();

        let set = Checker::new(&config, &executor)
            .run_checks(&index(serde_json::json!({
                "5.0": {
                    "commits": [SHA_A, SHA_B],
                    "limit": {"action": "TestSwiftPackage"},
                },
            })))
            .unwrap();

        assert!(set.is_empty());
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn determinism_mismatch_is_advisory_and_restores_incremental_state() {
        let cache = tempfile::tempdir().unwrap();
        seed_build_state(cache.path());
        let mut config = config(cache.path());
        config.verify_determinism = true;
        let executor = FakeExecutor::new();
        executor.set_stdout("rev-parse", SHA_A);

        let set = Checker::new(&config, &executor)
            .run_checks(&index(serde_json::json!({
                "5.0": {"commits": [SHA_A, SHA_B]},
            })))
            .unwrap();

        // The fake full rebuild leaves an empty build state, so the diff
        // against the seeded incremental snapshot reports a mismatch. Not
        // expected to be deterministic, so the check still passes.
        assert_eq!(set.kind(), OutcomeKind::Pass);

        let snapshots = cache.path().join("Foo-incr");
        assert!(snapshots.join("build-state-001-incr-bbbbbbb/app.o").is_file());
        assert!(snapshots.join("build-state-001-full-bbbbbbb").is_dir());
        // Incremental state came back after the verification rebuild wiped
        // the build directory.
        assert!(cache.path().join("Foo/.build/app.o").is_file());
        // Two incremental-capable builds plus the verification full build.
        assert_eq!(executor.calls_matching("swift build"), 3);
    }

    #[test]
    fn expected_determinism_turns_a_mismatch_into_a_fail() {
        let cache = tempfile::tempdir().unwrap();
        seed_build_state(cache.path());
        let mut config = config(cache.path());
        config.verify_determinism = true;
        config.expect_determinism = true;
        let executor = FakeExecutor::new();
        executor.set_stdout("rev-parse", SHA_A);

        let set = Checker::new(&config, &executor)
            .run_checks(&index(serde_json::json!({
                "5.0": {"commits": [SHA_A, SHA_B]},
            })))
            .unwrap();

        assert_eq!(set.kind(), OutcomeKind::Fail);
        assert!(set.leaves()[0].message.starts_with("Dirs differ: "));
    }

    #[test]
    fn sequences_run_in_label_order_and_reuse_the_snapshot_root() {
        let cache = tempfile::tempdir().unwrap();
        seed_build_state(cache.path());
        let config = config(cache.path());
        let executor = FakeExecutor::new();
        executor.set_stdout("rev-parse", SHA_A);

        let set = Checker::new(&config, &executor)
            .run_checks(&index(serde_json::json!({
                "4.2": {"commits": [SHA_A]},
                "5.0": {"commits": [SHA_B]},
            })))
            .unwrap();

        let leaves = set.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].message, "PASS: Foo, 4.2, aaaaaa, Swift Package");
        assert_eq!(leaves[1].message, "PASS: Foo, 5.0, bbbbbb, Swift Package");

        // Each sequence starts from a cleared snapshot root, so only the
        // last one's snapshots survive.
        let snapshots = cache.path().join("Foo-incr");
        assert!(!snapshots.join("build-state-000-full-aaaaaaa").exists());
        assert!(snapshots.join("build-state-000-full-bbbbbbb").is_dir());
    }
}
