//! Project index loading and formatting.
//!
//! The index is validated against the embedded schema before typed
//! deserialization so malformed entries fail with validator messages
//! rather than a serde type error deep in the model.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::types::{ProjectEntry, version_sort_key};

const INDEX_SCHEMA: &str = include_str!("../../schemas/projects/v1.schema.json");

/// Load, validate, and deserialize the project index at `path`.
pub fn load_index(path: &Path) -> Result<Vec<ProjectEntry>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read project index {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parse project index {}", path.display()))?;
    validate_index(&value)?;
    serde_json::from_value(value)
        .with_context(|| format!("deserialize project index {}", path.display()))
}

/// Validate a raw index document against the embedded schema.
pub fn validate_index(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(INDEX_SCHEMA).context("parse index schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile index schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("project index validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Rewrite the index at `path` in canonical order: projects by path,
/// versions by numeric label, actions by kind tag. The write goes through
/// a sibling temp file so a crash cannot leave a truncated index behind.
pub fn format_index(path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read project index {}", path.display()))?;
    let mut projects: Vec<ProjectEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("parse project index {}", path.display()))?;
    sort_index(&mut projects)?;

    let mut formatted =
        serde_json::to_string_pretty(&projects).context("serialize project index")?;
    formatted.push('\n');

    let tmp = path.with_file_name(format!(
        "{}.tmp",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("projects.json")
    ));
    fs::write(&tmp, formatted).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))
}

fn sort_index(projects: &mut [ProjectEntry]) -> Result<()> {
    projects.sort_by(|a, b| a.path.cmp(&b.path));
    for project in projects.iter_mut() {
        let versions = std::mem::take(&mut project.compatibility);
        let mut keyed = versions
            .into_iter()
            .map(|version| {
                let key = version_sort_key(&version.version)
                    .with_context(|| format!("project {}", project.path))?;
                Ok((key, version))
            })
            .collect::<Result<Vec<_>>>()?;
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        project.compatibility = keyed.into_iter().map(|(_, version)| version).collect();
        project.actions.sort_by(|a, b| a.action.cmp(&b.action));
    }
    Ok(())
}
