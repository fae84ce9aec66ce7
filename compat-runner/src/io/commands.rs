//! Build-tool command assembly.
//!
//! Package actions run the toolchain's package manager, IDE actions run
//! xcodebuild; everything else in the engine treats the planned commands as
//! opaque. The toolchain under test is injected through `SWIFT_EXEC`, and a
//! sandbox profile wraps the whole invocation when configured.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::core::predicate::FieldBindings;
use crate::core::types::{
    Action, ActionKind, BuildPhase, ConfigError, ProjectEntry, XcodeContainer, XcodeUnit,
    current_platform,
};
use crate::io::action_log::ActionLog;
use crate::io::process::{CommandSpec, Executor, check_run};

/// Deadline for package build and test invocations.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Toolchain under test plus flag overrides shared by every leaf.
#[derive(Debug, Clone, Default)]
pub struct Toolchain {
    pub swiftc: PathBuf,
    pub override_swift_exec: Option<PathBuf>,
    pub build_config: Option<String>,
    pub added_swift_flags: Option<String>,
    pub added_xcodebuild_flags: Option<String>,
    pub sandbox_profile_package: Option<PathBuf>,
    pub sandbox_profile_xcodebuild: Option<PathBuf>,
    pub default_timeout: Duration,
}

impl Toolchain {
    /// The `swift` driver next to the configured `swiftc`.
    fn swift(&self) -> PathBuf {
        match self.swiftc.parent() {
            Some(dir) => dir.join("swift"),
            None => PathBuf::from("swift"),
        }
    }

    fn swift_exec(&self) -> &Path {
        self.override_swift_exec.as_deref().unwrap_or(&self.swiftc)
    }
}

/// One command with the deadline it runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub spec: CommandSpec,
    pub timeout: Duration,
}

/// Assemble the commands for one leaf action, in execution order. Package
/// actions clean first through the package manager unless incremental;
/// xcodebuild folds the clean into the main invocation.
pub fn plan_action(
    toolchain: &Toolchain,
    checkout: &Path,
    project: &ProjectEntry,
    action: &Action,
    swift_version: Option<&str>,
    incremental: bool,
) -> Result<Vec<PlannedCommand>> {
    Planner {
        toolchain,
        checkout,
        project,
        action,
        swift_version,
        incremental,
    }
    .plan()
}

struct Planner<'a> {
    toolchain: &'a Toolchain,
    checkout: &'a Path,
    project: &'a ProjectEntry,
    action: &'a Action,
    swift_version: Option<&'a str>,
    incremental: bool,
}

impl Planner<'_> {
    fn plan(&self) -> Result<Vec<PlannedCommand>> {
        let kind = self.action.kind()?;
        let bindings = MergedBindings {
            project: self.project,
            action: self.action,
        };
        let swift_flags = match &self.toolchain.added_swift_flags {
            Some(flags) => Some(substitute_fields(flags, &bindings)?),
            None => None,
        };
        match kind {
            ActionKind::BuildSwiftPackage | ActionKind::TestSwiftPackage => {
                self.package(kind, swift_flags.as_deref())
            }
            ActionKind::Xcode {
                phase,
                container,
                unit,
            } => {
                let xcodebuild_flags = match &self.toolchain.added_xcodebuild_flags {
                    Some(flags) => Some(substitute_fields(flags, &bindings)?),
                    None => None,
                };
                self.xcode(
                    phase,
                    container,
                    unit,
                    swift_flags.as_deref(),
                    xcodebuild_flags.as_deref(),
                )
            }
        }
    }

    fn incomplete(&self, field: &'static str) -> ConfigError {
        ConfigError::IncompleteAction {
            project: self.project.path.clone(),
            tag: self.action.action.clone(),
            field,
        }
    }

    fn package(&self, kind: ActionKind, swift_flags: Option<&str>) -> Result<Vec<PlannedCommand>> {
        let swift = self.toolchain.swift().display().to_string();
        let package_path = self.checkout.display().to_string();
        let profile = self.toolchain.sandbox_profile_package.as_deref();
        let mut planned = Vec::new();

        if !self.incremental {
            let clean = CommandSpec::new(
                &swift,
                [
                    "package",
                    "--disable-sandbox",
                    "--package-path",
                    package_path.as_str(),
                    "clean",
                ],
            );
            planned.push(PlannedCommand {
                spec: sandbox_wrapped(clean, profile),
                timeout: self.toolchain.default_timeout,
            });
        }

        let mut args = vec![
            if kind.is_test() { "test" } else { "build" }.to_string(),
            "--disable-sandbox".to_string(),
            "--package-path".to_string(),
            package_path,
            "--verbose".to_string(),
        ];
        if kind == ActionKind::BuildSwiftPackage {
            let configuration = self
                .toolchain
                .build_config
                .as_deref()
                .or(self.action.configuration.as_deref())
                .ok_or_else(|| self.incomplete("configuration"))?;
            args.extend(["--configuration".to_string(), configuration.to_string()]);
            if let Some(version) = self.swift_version {
                let value = swift_version_flag(version)?;
                args.extend(
                    ["-Xswiftc", "-swift-version", "-Xswiftc", value.as_str()]
                        .map(str::to_string),
                );
            }
        }
        if let Some(flags) = swift_flags {
            for flag in flags.split_whitespace() {
                args.extend(["-Xswiftc".to_string(), flag.to_string()]);
            }
        }

        let spec = CommandSpec::new(&swift, args).envs([(
            "SWIFT_EXEC",
            self.toolchain.swift_exec().display().to_string(),
        )]);
        planned.push(PlannedCommand {
            spec: sandbox_wrapped(spec, profile),
            timeout: BUILD_TIMEOUT,
        });
        Ok(planned)
    }

    fn xcode(
        &self,
        phase: BuildPhase,
        container: XcodeContainer,
        unit: XcodeUnit,
        swift_flags: Option<&str>,
        xcodebuild_flags: Option<&str>,
    ) -> Result<Vec<PlannedCommand>> {
        let (container_flag, container_name) = match container {
            XcodeContainer::Workspace => (
                "-workspace",
                self.action
                    .workspace
                    .as_deref()
                    .ok_or_else(|| self.incomplete("workspace"))?,
            ),
            XcodeContainer::Project => (
                "-project",
                self.action
                    .project
                    .as_deref()
                    .ok_or_else(|| self.incomplete("project"))?,
            ),
        };
        let (unit_flag, unit_name) = match unit {
            XcodeUnit::Scheme => (
                "-scheme",
                self.action
                    .scheme
                    .as_deref()
                    .ok_or_else(|| self.incomplete("scheme"))?,
            ),
            XcodeUnit::Target => (
                "-target",
                self.action
                    .target
                    .as_deref()
                    .ok_or_else(|| self.incomplete("target"))?,
            ),
        };

        let container_path = self.checkout.join(container_name);
        let build_dir = build_state_dir(self.checkout, self.project, self.action)?;

        let mut args: Vec<String> = Vec::new();
        if !self.incremental {
            args.push("clean".to_string());
        }
        args.push(
            match phase {
                BuildPhase::Build => "build",
                BuildPhase::Test => "test",
            }
            .to_string(),
        );
        args.extend([
            container_flag.to_string(),
            container_path.display().to_string(),
            unit_flag.to_string(),
            unit_name.to_string(),
        ]);
        if let Some(destination) = &self.action.destination {
            args.extend(["-destination".to_string(), destination.clone()]);
        }
        let configuration = match self.toolchain.build_config.as_deref() {
            Some("debug") => Some("Debug".to_string()),
            Some("release") => Some("Release".to_string()),
            Some(other) => Some(other.to_string()),
            None => self.action.configuration.clone(),
        };
        if let Some(configuration) = configuration {
            args.extend(["-configuration".to_string(), configuration]);
        }
        // Scheme builds honor -derivedDataPath; target builds need SYMROOT.
        // Either way the build state lands next to the container file, where
        // the determinism checker expects it.
        match unit {
            XcodeUnit::Scheme => args.extend([
                "-derivedDataPath".to_string(),
                build_dir.display().to_string(),
            ]),
            XcodeUnit::Target => args.push(format!("SYMROOT={}", build_dir.display())),
        }
        args.push(format!(
            "SWIFT_EXEC={}",
            self.toolchain.swift_exec().display()
        ));
        if let Some(version) = self.swift_version {
            args.push(format!("SWIFT_VERSION={}", swift_version_flag(version)?));
        }
        if let Some(flags) = swift_flags {
            args.push(format!("OTHER_SWIFT_FLAGS=$(OTHER_SWIFT_FLAGS) {flags}"));
        }
        if let Some(flags) = xcodebuild_flags {
            args.extend(flags.split_whitespace().map(str::to_string));
        }

        let spec = CommandSpec::new("xcodebuild", args);
        Ok(vec![PlannedCommand {
            spec: sandbox_wrapped(spec, self.toolchain.sandbox_profile_xcodebuild.as_deref()),
            timeout: self.toolchain.default_timeout,
        }])
    }
}

/// Where the build tools leave on-disk state for `action`, as `plan_action`
/// wires it: `.build` under the checkout for package actions, `build` next
/// to the container file for xcodebuild.
pub fn build_state_dir(checkout: &Path, project: &ProjectEntry, action: &Action) -> Result<PathBuf> {
    match action.kind()? {
        ActionKind::BuildSwiftPackage | ActionKind::TestSwiftPackage => {
            Ok(checkout.join(".build"))
        }
        ActionKind::Xcode { container, .. } => {
            let (field, name) = match container {
                XcodeContainer::Workspace => ("workspace", action.workspace.as_deref()),
                XcodeContainer::Project => ("project", action.project.as_deref()),
            };
            let name = name.ok_or_else(|| ConfigError::IncompleteAction {
                project: project.path.clone(),
                tag: action.action.clone(),
                field,
            })?;
            let container_path = checkout.join(name);
            Ok(container_path
                .parent()
                .map_or_else(|| checkout.join("build"), |dir| dir.join("build")))
        }
    }
}

/// Wrap a command in the platform sandbox when a profile is configured.
pub fn sandbox_wrapped(spec: CommandSpec, profile: Option<&Path>) -> CommandSpec {
    let Some(profile) = profile else {
        return spec;
    };
    let profile = profile.display().to_string();
    let mut inner = vec![spec.program];
    inner.extend(spec.args);
    match current_platform() {
        "Darwin" => {
            let mut args = vec!["-f".to_string(), profile];
            args.extend(inner);
            CommandSpec {
                program: "sandbox-exec".to_string(),
                args,
                cwd: spec.cwd,
                env: spec.env,
            }
        }
        "Linux" => {
            let mut args = vec!["--quiet".to_string(), format!("--profile={profile}")];
            args.extend(inner);
            CommandSpec {
                program: "firejail".to_string(),
                args,
                cwd: spec.cwd,
                env: spec.env,
            }
        }
        _ => CommandSpec {
            program: inner.remove(0),
            args: inner,
            cwd: spec.cwd,
            env: spec.env,
        },
    }
}

/// Map a version label to the language mode handed to the compiler: the
/// major component alone, except 4.2 which is a mode of its own.
pub fn swift_version_flag(version: &str) -> Result<String> {
    let normalized = if version.contains('.') {
        version.to_string()
    } else {
        format!("{version}.0")
    };
    let (major, minor) = normalized
        .split_once('.')
        .with_context(|| format!("swift version `{version}`"))?;
    let major_num: u64 = major
        .parse()
        .with_context(|| format!("swift version `{version}`"))?;
    let minor_num: f64 = minor
        .parse()
        .with_context(|| format!("swift version `{version}`"))?;
    if major_num == 4 && minor_num == 2.0 {
        Ok(normalized)
    } else {
        Ok(major.to_string())
    }
}

/// Project fields over action fields, for `{field}` flag substitution.
pub struct MergedBindings<'a> {
    pub project: &'a ProjectEntry,
    pub action: &'a Action,
}

impl FieldBindings for MergedBindings<'_> {
    fn field(&self, name: &str) -> Option<String> {
        self.project
            .field(name)
            .or_else(|| self.action.field(name))
    }
}

static FIELD_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{(\w+)\}").unwrap());

/// Replace `{field}` references with the bound field values. `{{` and `}}`
/// escape literal braces. Referencing an unbound field is an error.
pub fn substitute_fields(template: &str, bindings: &dyn FieldBindings) -> Result<String> {
    let mut missing: Vec<String> = Vec::new();
    let substituted = FIELD_REF.replace_all(template, |captures: &regex::Captures<'_>| {
        match captures.get(1) {
            None => {
                if &captures[0] == "{{" {
                    "{".to_string()
                } else {
                    "}".to_string()
                }
            }
            Some(name) => match bindings.field(name.as_str()) {
                Some(value) => value,
                None => {
                    missing.push(name.as_str().to_string());
                    String::new()
                }
            },
        }
    });
    if !missing.is_empty() {
        bail!(
            "unknown field `{}` in flag template `{template}`",
            missing.join("`, `")
        );
    }
    Ok(substituted.into_owned())
}

/// Strip resource build phases from every `project.pbxproj` under `root`.
/// Some indexed projects bundle resources that cannot build outside their
/// authors' machines; dropping the phase keeps the compile coverage.
pub fn strip_resource_phases(
    executor: &dyn Executor,
    root: &Path,
    timeout: Duration,
    log: &mut ActionLog,
) -> Result<()> {
    let mut files = Vec::new();
    collect_pbxproj(root, &mut files)?;
    files.sort();
    for file in files {
        let file_arg = file.display().to_string();
        let spec = CommandSpec::new(
            "perl",
            [
                "-i",
                "-00ne",
                "print unless /Begin PBXResourcesBuildPhase/",
                file_arg.as_str(),
            ],
        );
        check_run(executor, &spec, timeout, 1, log)?;
    }
    Ok(())
}

fn collect_pbxproj(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        let path = entry.path();
        if file_type.is_dir() {
            collect_pbxproj(&path, found)?;
        } else if file_type.is_file()
            && path.file_name().is_some_and(|name| name == "project.pbxproj")
        {
            found.push(path);
        }
    }
    Ok(())
}
