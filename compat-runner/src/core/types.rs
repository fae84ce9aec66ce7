//! Project index data model.
//!
//! These types mirror the on-disk index entries one-to-one and stay read-only
//! for the whole run. Unknown scalar fields are kept in `extra` maps so
//! predicates and flag substitution can address them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::predicate::FieldBindings;

/// One entry in the project index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub path: String,
    pub repository: String,
    pub url: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
    /// Toolchain-compatibility versions, each pinning a commit.
    #[serde(default)]
    pub compatibility: Vec<ProjectVersion>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Commit sequences for determinism checks, keyed by label.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub incremental: BTreeMap<String, IncrementalSpec>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ProjectEntry {
    /// Whether the entry supports `platform` (no list means all platforms).
    pub fn supports_platform(&self, platform: &str) -> bool {
        match &self.platforms {
            Some(platforms) => platforms.iter().any(|p| p == platform),
            None => true,
        }
    }
}

/// One pinned project version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectVersion {
    /// Dot-separated numeric label, e.g. `5.0`.
    pub version: String,
    /// Exact 40-character hexadecimal revision.
    pub commit: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One build or test action of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Kind tag, e.g. `BuildSwiftPackage` or `TestXcodeWorkspaceScheme`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xfail: Option<XfailSpec>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Action {
    /// Parse the kind tag. Unknown tags are a fatal configuration error.
    pub fn kind(&self) -> Result<ActionKind, ConfigError> {
        ActionKind::parse(&self.action)
    }

    /// Scheme when present, else target. Xcode actions carry exactly one.
    pub fn scheme_or_target(&self) -> Option<&str> {
        self.scheme.as_deref().or(self.target.as_deref())
    }

    pub fn xfail_rules(&self) -> &[XfailRule] {
        self.xfail.as_ref().map_or(&[], XfailSpec::rules)
    }
}

/// Build-vs-test half of an action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Build,
    Test,
}

/// Xcode container file referenced by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcodeContainer {
    Workspace,
    Project,
}

/// Xcode build unit referenced by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XcodeUnit {
    Scheme,
    Target,
}

/// Parsed action kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    BuildSwiftPackage,
    TestSwiftPackage,
    Xcode {
        phase: BuildPhase,
        container: XcodeContainer,
        unit: XcodeUnit,
    },
}

static XCODE_ACTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(Build|Test)Xcode(Workspace|Project)(Scheme|Target)$").unwrap());

impl ActionKind {
    pub fn parse(tag: &str) -> Result<ActionKind, ConfigError> {
        match tag {
            "BuildSwiftPackage" => return Ok(ActionKind::BuildSwiftPackage),
            "TestSwiftPackage" => return Ok(ActionKind::TestSwiftPackage),
            _ => {}
        }
        let captures = XCODE_ACTION
            .captures(tag)
            .ok_or_else(|| ConfigError::UnknownActionKind {
                tag: tag.to_string(),
            })?;
        let phase = match &captures[1] {
            "Build" => BuildPhase::Build,
            _ => BuildPhase::Test,
        };
        let container = match &captures[2] {
            "Workspace" => XcodeContainer::Workspace,
            _ => XcodeContainer::Project,
        };
        let unit = match &captures[3] {
            "Scheme" => XcodeUnit::Scheme,
            _ => XcodeUnit::Target,
        };
        Ok(ActionKind::Xcode {
            phase,
            container,
            unit,
        })
    }

    pub fn is_test(self) -> bool {
        match self {
            ActionKind::BuildSwiftPackage => false,
            ActionKind::TestSwiftPackage => true,
            ActionKind::Xcode { phase, .. } => phase == BuildPhase::Test,
        }
    }

    pub fn is_package(self) -> bool {
        matches!(
            self,
            ActionKind::BuildSwiftPackage | ActionKind::TestSwiftPackage
        )
    }
}

/// One or more xfail match rules (a bare object reads as a single rule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum XfailSpec {
    One(XfailRule),
    Many(Vec<XfailRule>),
}

impl XfailSpec {
    pub fn rules(&self) -> &[XfailRule] {
        match self {
            XfailSpec::One(rule) => std::slice::from_ref(rule),
            XfailSpec::Many(rules) => rules,
        }
    }
}

/// A single match value or an any-of list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn contains(&self, value: &str) -> bool {
        match self {
            OneOrMany::One(only) => only == value,
            OneOrMany::Many(values) => values.iter().any(|v| v == value),
        }
    }
}

/// One xfail rule: absent fields are wildcards, present fields must match
/// the leaf's context. Carries the issue identifier reported on match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XfailRule {
    pub issue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<OneOrMany>,
}

/// Commit sequence for a determinism check, with optional action limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalSpec {
    pub commits: Vec<String>,
    /// Field constraints; the check skips actions whose fields differ.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limit: BTreeMap<String, String>,
}

impl IncrementalSpec {
    /// Whether `action` is excluded by this spec's limit map.
    pub fn excludes(&self, action: &Action) -> bool {
        self.limit
            .iter()
            .any(|(field, value)| action.field(field).as_deref() != Some(value))
    }
}

fn extra_string(extra: &BTreeMap<String, Value>, name: &str) -> Option<String> {
    match extra.get(name) {
        Some(Value::String(value)) => Some(value.clone()),
        _ => None,
    }
}

impl FieldBindings for ProjectEntry {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "path" => Some(self.path.clone()),
            "repository" => Some(self.repository.clone()),
            "url" => Some(self.url.clone()),
            "branch" => Some(self.branch.clone()),
            _ => extra_string(&self.extra, name),
        }
    }
}

impl FieldBindings for ProjectVersion {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "version" => Some(self.version.clone()),
            "commit" => Some(self.commit.clone()),
            _ => extra_string(&self.extra, name),
        }
    }
}

impl FieldBindings for Action {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            "action" => Some(self.action.clone()),
            "workspace" => self.workspace.clone(),
            "project" => self.project.clone(),
            "scheme" => self.scheme.clone(),
            "target" => self.target.clone(),
            "destination" => self.destination.clone(),
            "configuration" => self.configuration.clone(),
            _ => extra_string(&self.extra, name),
        }
    }
}

/// Platform name as used by index `platforms` lists.
pub fn current_platform() -> &'static str {
    if cfg!(target_os = "macos") {
        "Darwin"
    } else if cfg!(target_os = "windows") {
        "Windows"
    } else {
        "Linux"
    }
}

/// Numeric sort key for a dot-separated version label. Labels that are not
/// fully numeric cannot be ordered and are an error.
pub fn version_sort_key(label: &str) -> Result<Vec<u64>> {
    label
        .split('.')
        .map(|component| {
            component
                .parse::<u64>()
                .with_context(|| format!("non-numeric version label `{label}`"))
        })
        .collect()
}

/// Fatal configuration problems. These abort the entire run, unlike command
/// failures, which are classified per action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnsupportedRepository { project: String, kind: String },
    UnknownActionKind { tag: String },
    MalformedRevision { project: String, version: String, commit: String },
    UnorderableVersion { project: String, version: String },
    MissingConfiguration { issue: String },
    IncompleteAction { project: String, tag: String, field: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnsupportedRepository { project, kind } => {
                write!(f, "unsupported repository `{kind}` for project {project}")
            }
            ConfigError::UnknownActionKind { tag } => write!(f, "unknown action: {tag}"),
            ConfigError::MalformedRevision {
                project,
                version,
                commit,
            } => write!(
                f,
                "commits must be 40-character hex revisions \
                 (project {project}, version {version} has `{commit}`)"
            ),
            ConfigError::UnorderableVersion { project, version } => write!(
                f,
                "version labels must be numeric to pick the latest \
                 (project {project} has `{version}`)"
            ),
            ConfigError::MissingConfiguration { issue } => write!(
                f,
                "xfail entry {issue} constrains `configuration` but none was \
                 supplied via --build-config or the containing action"
            ),
            ConfigError::IncompleteAction {
                project,
                tag,
                field,
            } => write!(
                f,
                "action {tag} of project {project} is missing `{field}`"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_parses_package_and_xcode_tags() {
        assert_eq!(
            ActionKind::parse("BuildSwiftPackage").unwrap(),
            ActionKind::BuildSwiftPackage
        );
        assert_eq!(
            ActionKind::parse("TestSwiftPackage").unwrap(),
            ActionKind::TestSwiftPackage
        );
        assert_eq!(
            ActionKind::parse("BuildXcodeWorkspaceScheme").unwrap(),
            ActionKind::Xcode {
                phase: BuildPhase::Build,
                container: XcodeContainer::Workspace,
                unit: XcodeUnit::Scheme,
            }
        );
        assert_eq!(
            ActionKind::parse("TestXcodeProjectTarget").unwrap(),
            ActionKind::Xcode {
                phase: BuildPhase::Test,
                container: XcodeContainer::Project,
                unit: XcodeUnit::Target,
            }
        );
    }

    #[test]
    fn unknown_action_kind_is_config_error() {
        let err = ActionKind::parse("BuildCMakeTarget").unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownActionKind {
                tag: "BuildCMakeTarget".to_string()
            }
        );
        assert!(err.to_string().contains("unknown action"));
    }

    #[test]
    fn xfail_spec_accepts_object_or_list() {
        let single: XfailSpec = serde_json::from_str(r#"{"issue": "SR-1"}"#).unwrap();
        assert_eq!(single.rules().len(), 1);

        let many: XfailSpec =
            serde_json::from_str(r#"[{"issue": "SR-1"}, {"issue": "SR-2"}]"#).unwrap();
        assert_eq!(many.rules().len(), 2);
    }

    #[test]
    fn one_or_many_contains() {
        let one = OneOrMany::One("main".to_string());
        assert!(one.contains("main"));
        assert!(!one.contains("release"));

        let many = OneOrMany::Many(vec!["main".to_string(), "release".to_string()]);
        assert!(many.contains("release"));
        assert!(!many.contains("next"));
    }

    #[test]
    fn platform_support_defaults_to_all() {
        let entry: ProjectEntry = serde_json::from_str(
            r#"{"path": "Foo", "repository": "Git", "url": "u", "branch": "main"}"#,
        )
        .unwrap();
        assert!(entry.supports_platform("Linux"));

        let gated: ProjectEntry = serde_json::from_str(
            r#"{"path": "Foo", "repository": "Git", "url": "u", "branch": "main",
                "platforms": ["Darwin"]}"#,
        )
        .unwrap();
        assert!(gated.supports_platform("Darwin"));
        assert!(!gated.supports_platform("Linux"));
    }

    #[test]
    fn extra_scalar_fields_are_bound_for_predicates() {
        let entry: ProjectEntry = serde_json::from_str(
            r#"{"path": "Foo", "repository": "Git", "url": "u", "branch": "main",
                "maintainer": "someone", "stars": 12}"#,
        )
        .unwrap();
        assert_eq!(entry.field("maintainer").as_deref(), Some("someone"));
        assert_eq!(entry.field("stars"), None);
        assert_eq!(entry.field("path").as_deref(), Some("Foo"));
    }

    #[test]
    fn incremental_limit_excludes_mismatched_actions() {
        let spec = IncrementalSpec {
            commits: vec![],
            limit: [("action".to_string(), "BuildSwiftPackage".to_string())]
                .into_iter()
                .collect(),
        };
        let build: Action =
            serde_json::from_str(r#"{"action": "BuildSwiftPackage"}"#).unwrap();
        let test: Action = serde_json::from_str(r#"{"action": "TestSwiftPackage"}"#).unwrap();
        assert!(!spec.excludes(&build));
        assert!(spec.excludes(&test));
    }

    #[test]
    fn version_sort_key_orders_numerically() {
        assert!(version_sort_key("10.0").unwrap() > version_sort_key("9.1").unwrap());
        assert!(version_sort_key("4.2.1").unwrap() > version_sort_key("4.2").unwrap());
        assert!(version_sort_key("v1").is_err());
    }

    #[test]
    fn scheme_or_target_prefers_scheme() {
        let action: Action = serde_json::from_str(
            r#"{"action": "BuildXcodeWorkspaceScheme", "scheme": "App", "target": "T"}"#,
        )
        .unwrap();
        assert_eq!(action.scheme_or_target(), Some("App"));

        let target_only: Action = serde_json::from_str(
            r#"{"action": "BuildXcodeProjectTarget", "target": "T"}"#,
        )
        .unwrap();
        assert_eq!(target_only.scheme_or_target(), Some("T"));
    }
}
