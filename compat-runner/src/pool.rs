//! Project-level worker pool.
//!
//! Projects are the unit of isolation: each owns one working tree, so the
//! versions and actions below it run sequentially on one worker while
//! independent projects run concurrently. A panicking worker turns into a
//! FAIL leaf for its project; a configuration error aborts the whole run
//! once every in-flight worker has finished.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, mpsc};
use std::thread;

use anyhow::{Result, bail};
use tracing::{debug, warn};

use crate::core::outcome::{ActionOutcome, Outcome, OutcomeKind, OutcomeSet};
use crate::core::types::{ConfigError, ProjectEntry};

/// What one worker hands back for one project.
type ProjectReport = thread::Result<Result<OutcomeSet>>;

/// Run `job` once per project across at most `workers` threads, returning
/// each project's outcome in index order regardless of completion order.
pub fn run_projects<F>(projects: &[&ProjectEntry], workers: usize, job: F) -> Result<Vec<Outcome>>
where
    F: Fn(&ProjectEntry) -> Result<OutcomeSet> + Sync,
{
    if projects.is_empty() {
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, projects.len());

    let (job_tx, job_rx) = mpsc::channel::<usize>();
    for index in 0..projects.len() {
        // The receiver is alive until the workers drain it.
        let _ = job_tx.send(index);
    }
    drop(job_tx);
    let job_rx = Mutex::new(job_rx);
    let job_rx = &job_rx;
    let job = &job;

    let (report_tx, report_rx) = mpsc::channel::<(usize, ProjectReport)>();

    thread::scope(|s| {
        for _ in 0..workers {
            let tx = report_tx.clone();
            s.spawn(move || {
                loop {
                    let index = match job_rx.lock().unwrap().recv() {
                        Ok(index) => index,
                        Err(_) => break,
                    };
                    let project = projects[index];
                    debug!(project = %project.path, "worker picked up project");
                    let report = panic::catch_unwind(AssertUnwindSafe(|| job(project)));
                    if tx.send((index, report)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(report_tx);
    });

    // The scope joined every worker, so the report channel is closed and
    // holds one entry per project.
    let mut reports: Vec<(usize, ProjectReport)> = report_rx.into_iter().collect();
    reports.sort_by_key(|(index, _)| *index);
    if reports.len() != projects.len() {
        bail!(
            "worker pool lost {} project report(s)",
            projects.len() - reports.len()
        );
    }

    let mut outcomes = Vec::with_capacity(reports.len());
    for (index, report) in reports {
        let project = projects[index];
        let outcome = match report {
            Ok(Ok(set)) => Outcome::Set(set),
            Ok(Err(err)) => {
                if err.downcast_ref::<ConfigError>().is_some() {
                    return Err(err);
                }
                warn!(project = %project.path, "project failed outside any action: {err:#}");
                Outcome::Action(ActionOutcome::new(
                    OutcomeKind::Fail,
                    format!("FAIL: {}: {err:#}", project.path),
                ))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(project = %project.path, message, "worker panicked");
                Outcome::Action(ActionOutcome::new(
                    OutcomeKind::Fail,
                    format!("FAIL: {}: worker panicked: {message}", project.path),
                ))
            }
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
