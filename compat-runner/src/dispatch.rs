//! Project → version → action dispatch.
//!
//! Three levels of the same shape: filter the subtargets, invoke the level
//! below for each survivor, fold the child outcomes into a composite. The
//! leaf brings the working copy to the pinned revision, runs the planned
//! build or test commands, and classifies the result against the action's
//! known-failure rules. Projects fan out across the worker pool; everything
//! below a project runs sequentially on its worker.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::config::RunConfig;
use crate::core::outcome::{ActionOutcome, Outcome, OutcomeKind, OutcomeSet};
use crate::core::predicate::SelectionFilter;
use crate::core::types::{
    Action, ConfigError, ProjectEntry, ProjectVersion, current_platform, version_sort_key,
};
use crate::core::xfail::{self, XfailContext};
use crate::io::action_log::{ActionLog, action_log_name};
use crate::io::commands::{plan_action, strip_resource_phases};
use crate::io::git::Git;
use crate::io::process::{CommandFailure, Executor, check_run};
use crate::pool;

/// Drives the dispatch tree for one run.
pub struct Engine<'a> {
    config: &'a RunConfig,
    executor: &'a dyn Executor,
}

impl<'a> Engine<'a> {
    pub fn new(config: &'a RunConfig, executor: &'a dyn Executor) -> Engine<'a> {
        Engine { config, executor }
    }

    /// Run every selected project and merge their outcomes into one set,
    /// ordered as the index orders them.
    pub fn run_matrix(&self, index: &[ProjectEntry]) -> Result<OutcomeSet> {
        let filters = MatrixFilters::parse(self.config)?;
        let selected = eligible_projects(index, &filters.projects);
        debug!(
            selected = selected.len(),
            indexed = index.len(),
            "dispatching project matrix"
        );
        let outcomes = pool::run_projects(&selected, self.config.worker_count(), |project| {
            self.run_project(project, &filters)
        })?;
        let mut matrix = OutcomeSet::new();
        for outcome in outcomes {
            matrix.add(outcome);
        }
        Ok(matrix)
    }

    #[instrument(skip_all, fields(project = %project.path))]
    fn run_project(&self, project: &ProjectEntry, filters: &MatrixFilters) -> Result<OutcomeSet> {
        let mut set = OutcomeSet::new();
        for version in self.selected_versions(project)? {
            if !filters.versions.selects(version) {
                continue;
            }
            set.add(Outcome::Set(self.run_version(project, version, filters)?));
        }
        Ok(set)
    }

    /// All versions, or just the numerically highest label under
    /// `--only-latest-versions`.
    fn selected_versions<'p>(&self, project: &'p ProjectEntry) -> Result<Vec<&'p ProjectVersion>> {
        if !self.config.only_latest_versions {
            return Ok(project.compatibility.iter().collect());
        }
        let mut latest: Option<(Vec<u64>, &ProjectVersion)> = None;
        for version in &project.compatibility {
            let key = version_sort_key(&version.version).map_err(|_| {
                ConfigError::UnorderableVersion {
                    project: project.path.clone(),
                    version: version.version.clone(),
                }
            })?;
            if latest.as_ref().is_none_or(|(best, _)| key > *best) {
                latest = Some((key, version));
            }
        }
        Ok(latest.map(|(_, version)| version).into_iter().collect())
    }

    fn run_version(
        &self,
        project: &ProjectEntry,
        version: &ProjectVersion,
        filters: &MatrixFilters,
    ) -> Result<OutcomeSet> {
        // Gate before any checkout so a typoed revision cannot run commands.
        if version.commit.len() != 40 {
            return Err(ConfigError::MalformedRevision {
                project: project.path.clone(),
                version: version.version.clone(),
                commit: version.commit.clone(),
            }
            .into());
        }
        let mut set = OutcomeSet::new();
        for action in &project.actions {
            if !filters.actions.selects(action) {
                continue;
            }
            let mut log = leaf_log(
                self.config.verbose,
                &action_log_name(project, Some(&version.version), action),
            )?;
            let outcome =
                self.run_leaf(project, &version.version, &version.commit, action, &mut log)?;
            info!("{}", outcome.message);
            log.finalize(outcome.kind)?;
            set.add_action(outcome);
        }
        Ok(set)
    }

    #[instrument(skip_all, fields(project = %project.path, action = %action.action))]
    fn run_leaf(
        &self,
        project: &ProjectEntry,
        compatibility: &str,
        commit: &str,
        action: &Action,
        log: &mut ActionLog,
    ) -> Result<ActionOutcome> {
        let config = self.config;
        let swift_version = config.swift_version.as_deref().unwrap_or(compatibility);
        let dispatched = (|log: &mut ActionLog| -> Result<()> {
            let git = Git::new(self.executor, config.default_timeout);
            let checkout = git.checkout_project(
                &config.project_cache_path,
                project,
                commit,
                config.skip_clean,
                log,
            )?;
            if config.strip_resource_phases && !action.kind()?.is_package() {
                strip_resource_phases(self.executor, &checkout, config.default_timeout, log)?;
            }
            let planned = plan_action(
                &config.toolchain(),
                &checkout,
                project,
                action,
                Some(swift_version),
                config.skip_clean,
            )?;
            for command in &planned {
                check_run(self.executor, &command.spec, command.timeout, 1, log)?;
            }
            Ok(())
        })(log);
        classify_dispatch(config, project, compatibility, commit, action, dispatched)
    }
}

/// The per-level predicate filters, parsed once before any dispatch.
struct MatrixFilters {
    projects: SelectionFilter,
    versions: SelectionFilter,
    actions: SelectionFilter,
}

impl MatrixFilters {
    fn parse(config: &RunConfig) -> Result<MatrixFilters> {
        Ok(MatrixFilters {
            projects: SelectionFilter::new(&config.include_repos, &config.exclude_repos)?,
            versions: SelectionFilter::new(&config.include_versions, &config.exclude_versions)?,
            actions: SelectionFilter::new(&config.include_actions, &config.exclude_actions)?,
        })
    }
}

/// Projects runnable on this host: platform-gated, then predicate-filtered.
pub(crate) fn eligible_projects<'p>(
    index: &'p [ProjectEntry],
    filter: &SelectionFilter,
) -> Vec<&'p ProjectEntry> {
    let platform = current_platform();
    index
        .iter()
        .filter(|project| project.supports_platform(platform))
        .filter(|project| filter.selects(*project))
        .collect()
}

/// File-backed log in the invocation directory, or stderr passthrough in
/// verbose mode.
pub(crate) fn leaf_log(verbose: bool, name: &str) -> Result<ActionLog> {
    if verbose {
        Ok(ActionLog::passthrough())
    } else {
        ActionLog::create(Path::new("."), name)
    }
}

/// Turn a leaf dispatch result into a classified outcome. A command failure
/// is FAIL, or XFAIL when a known-failure rule matches; success is PASS, or
/// UPASS under a matching rule. Any other error is infrastructure trouble
/// and propagates untouched.
pub(crate) fn classify_dispatch(
    config: &RunConfig,
    project: &ProjectEntry,
    compatibility: &str,
    commit: &str,
    action: &Action,
    dispatched: Result<()>,
) -> Result<ActionOutcome> {
    let failed = match dispatched {
        Ok(()) => false,
        Err(err) if err.downcast_ref::<CommandFailure>().is_some() => {
            debug!(project = %project.path, "action command failed: {err:#}");
            true
        }
        Err(err) => return Err(err),
    };

    let context = XfailContext {
        compatibility,
        branch: &config.swift_branch,
        platform: current_platform(),
        configuration: config
            .build_config
            .as_deref()
            .or(action.configuration.as_deref()),
        job: &config.job_type,
    };
    let issue = xfail::resolve(action.xfail_rules(), &context)?;

    let commit_prefix: String = commit.chars().take(6).collect();
    let target = action.scheme_or_target().unwrap_or("Swift Package");
    let mut detail = format!(
        "{}, {compatibility}, {commit_prefix}, {target}",
        project.path
    );
    if let Some(destination) = &action.destination {
        detail.push_str(", ");
        detail.push_str(destination);
    }

    let (kind, message) = match (failed, issue) {
        (false, None) => (OutcomeKind::Pass, format!("PASS: {detail}")),
        (false, Some(issue)) => (OutcomeKind::UPass, format!("UPASS: {issue}, {detail}")),
        (true, Some(issue)) => (OutcomeKind::XFail, format!("XFAIL: {issue}, {detail}")),
        (true, None) => (OutcomeKind::Fail, format!("FAIL: {detail}")),
    };
    Ok(ActionOutcome::new(kind, message))
}
