//! Build-state snapshots and tree comparison for determinism checks.
//!
//! Snapshots are plain directory copies (symlinks preserved as links) named
//! `build-state-<seq>-<flavor>-<commit prefix>`. Comparison tolerates a
//! fixed set of build-tool scratch artifacts that are known to differ
//! between otherwise identical builds.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::types::ActionKind;

/// Which build produced a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFlavor {
    Full,
    Incr,
}

impl fmt::Display for SnapshotFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotFlavor::Full => f.write_str("full"),
            SnapshotFlavor::Incr => f.write_str("incr"),
        }
    }
}

/// Snapshot directory name for one step of a commit sequence.
pub fn snapshot_name(seq: usize, flavor: SnapshotFlavor, sha: &str) -> String {
    let prefix: String = sha.chars().take(7).collect();
    format!("build-state-{seq:03}-{flavor}-{prefix}")
}

/// Directory entry names excluded from comparison wholesale, per action
/// kind. These are caches and logs with no bearing on build output.
pub fn ignored_names(kind: ActionKind) -> &'static [&'static str] {
    if kind.is_package() {
        &["ModuleCache", "build.db", "master.swiftdeps", "master.swiftdeps~"]
    } else {
        &[
            "ModuleCache",
            "Logs",
            "info.plist",
            "dgph",
            "dgph~",
            "master.swiftdeps",
            "master.swiftdeps~",
        ]
    }
}

/// Copy `src` to `dst`, replacing anything already there.
pub fn save(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst).with_context(|| format!("remove {}", dst.display()))?;
    }
    copy_tree(src, dst)
}

/// Bring `dst` back to the state captured in the snapshot at `src`.
pub fn restore(src: &Path, dst: &Path) -> Result<()> {
    save(src, dst)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    let entries = fs::read_dir(src).with_context(|| format!("read {}", src.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", src.display()))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", from.display()))?;
        if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)
                .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = fs::read_link(from).with_context(|| format!("read link {}", from.display()))?;
    std::os::unix::fs::symlink(&target, to)
        .with_context(|| format!("link {} -> {}", to.display(), target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    fs::copy(from, to)
        .with_context(|| format!("copy {} -> {}", from.display(), to.display()))?;
    Ok(())
}

/// Differences between a full and an incremental build-state snapshot,
/// paths relative to the snapshot roots.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeDiff {
    pub missing_incr: Vec<PathBuf>,
    pub missing_full: Vec<PathBuf>,
    pub differing: Vec<PathBuf>,
}

impl TreeDiff {
    pub fn is_clean(&self) -> bool {
        self.missing_incr.is_empty() && self.missing_full.is_empty() && self.differing.is_empty()
    }

    /// One line per difference, in discovery order.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for path in &self.missing_incr {
            lines.push(format!("Missing 'incr' file: {}", path.display()));
        }
        for path in &self.missing_full {
            lines.push(format!("Missing 'full' file: {}", path.display()));
        }
        for path in &self.differing {
            lines.push(format!("File difference: {}", path.display()));
        }
        lines
    }
}

/// Entries present on one side only are tolerated when they are compiler
/// scratch files.
fn tolerated_missing(name: &str) -> bool {
    name.ends_with(".dia") || name.ends_with('~')
}

/// Content differences are tolerated for dependency-tracking files that
/// embed timestamps.
fn tolerated_diff(name: &str) -> bool {
    name.ends_with("-master.swiftdeps") || name.ends_with("dependency_info.dat")
}

/// Compare the `full` snapshot against the `incr` snapshot, skipping
/// `ignored` entry names at every level.
pub fn compare_trees(full: &Path, incr: &Path, ignored: &[&str]) -> Result<TreeDiff> {
    let mut diff = TreeDiff::default();
    compare_dir(full, incr, ignored, Path::new(""), &mut diff)?;
    Ok(diff)
}

fn entry_names(dir: &Path, ignored: &[&str]) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !ignored.contains(&name.as_str()) {
            names.insert(name);
        }
    }
    Ok(names)
}

fn compare_dir(
    full: &Path,
    incr: &Path,
    ignored: &[&str],
    rel: &Path,
    diff: &mut TreeDiff,
) -> Result<()> {
    let full_names = entry_names(full, ignored)?;
    let incr_names = entry_names(incr, ignored)?;

    for name in full_names.difference(&incr_names) {
        if !tolerated_missing(name) {
            diff.missing_incr.push(rel.join(name));
        }
    }
    for name in incr_names.difference(&full_names) {
        if !tolerated_missing(name) {
            diff.missing_full.push(rel.join(name));
        }
    }

    let mut subdirs = Vec::new();
    for name in full_names.intersection(&incr_names) {
        let full_path = full.join(name);
        let incr_path = incr.join(name);
        let full_meta = fs::symlink_metadata(&full_path)
            .with_context(|| format!("stat {}", full_path.display()))?;
        let incr_meta = fs::symlink_metadata(&incr_path)
            .with_context(|| format!("stat {}", incr_path.display()))?;

        if full_meta.is_dir() && incr_meta.is_dir() {
            subdirs.push(name.clone());
        } else if full_meta.is_symlink() && incr_meta.is_symlink() {
            let full_target = fs::read_link(&full_path)
                .with_context(|| format!("read link {}", full_path.display()))?;
            let incr_target = fs::read_link(&incr_path)
                .with_context(|| format!("read link {}", incr_path.display()))?;
            if full_target != incr_target && !tolerated_diff(name) {
                diff.differing.push(rel.join(name));
            }
        } else if full_meta.is_file() && incr_meta.is_file() {
            if tolerated_diff(name) {
                continue;
            }
            let same = full_meta.len() == incr_meta.len()
                && read_bytes(&full_path)? == read_bytes(&incr_path)?;
            if !same {
                diff.differing.push(rel.join(name));
            }
        } else if !tolerated_diff(name) {
            // Entry kind changed between the two builds.
            diff.differing.push(rel.join(name));
        }
    }

    for name in subdirs {
        compare_dir(
            &full.join(&name),
            &incr.join(&name),
            ignored,
            &rel.join(&name),
            diff,
        )?;
    }
    Ok(())
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read {}", path.display()))
}
