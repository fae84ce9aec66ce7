//! Engine-level lifecycle tests over index files on disk.
//!
//! These drive `load_index` into the dispatch engine and the determinism
//! checker the way the CLI wires them, with every external command
//! scripted through the fake executor.

use std::path::PathBuf;

use compat_runner::config::RunConfig;
use compat_runner::core::outcome::OutcomeKind;
use compat_runner::core::types::ConfigError;
use compat_runner::dispatch::Engine;
use compat_runner::incremental::Checker;
use compat_runner::io::index::load_index;
use compat_runner::test_support::{FakeExecutor, TestCache};

const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const SHA_C: &str = "cccccccccccccccccccccccccccccccccccccccc";

fn config(projects: PathBuf, cache: PathBuf) -> RunConfig {
    RunConfig {
        swiftc: PathBuf::from("/toolchain/usr/bin/swiftc"),
        projects,
        project_cache_path: cache,
        workers: Some(1),
        verbose: true,
        ..RunConfig::default()
    }
}

/// One project, one version, one passing build action: the whole run
/// reduces to a single PASS leaf and a summary that says so.
#[test]
fn single_pass_project_reports_one_pass() {
    let fixture = TestCache::new().expect("cache");
    let index = fixture
        .write_index(&serde_json::json!([{
            "path": "Foo",
            "repository": "Git",
            "url": "https://example.com/foo.git",
            "branch": "main",
            "compatibility": [{"version": "1.0", "commit": SHA_A}],
            "actions": [{"action": "BuildSwiftPackage", "configuration": "debug"}],
        }]))
        .expect("index");

    let config = config(index.clone(), fixture.cache());
    let executor = FakeExecutor::new();
    let projects = load_index(&index).expect("load");

    let set = Engine::new(&config, &executor)
        .run_matrix(&projects)
        .expect("matrix");

    assert_eq!(set.kind(), OutcomeKind::Pass);
    let leaves = set.leaves();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].message, "PASS: Foo, 1.0, aaaaaa, Swift Package");

    let summary = set.summary().to_string();
    assert!(summary.contains("     Passed: 1"), "{summary}");
    assert!(summary.contains("     Failed: 0"), "{summary}");
    assert!(summary.contains("    XFailed: 0"), "{summary}");
    assert!(summary.contains("    UPassed: 0"), "{summary}");
    assert!(
        summary.ends_with("Result: PASS\n========================================"),
        "{summary}"
    );
}

/// Full matrix lifecycle over a loaded index: two projects, three leaves.
///
/// Index:
/// ```text
/// Alamofire  BuildSwiftPackage  4.0 fails under a known issue, 5.0 passes
/// Sourcery   TestSwiftPackage   5.0 fails with no rule
/// ```
///
/// Execution sequence per leaf: bring the working tree to the pinned
/// commit, clean, build, classify. Verifies the three leaf messages, the
/// merged kind, the summary rendering, and that the 5.0 leaf reuses the
/// checkout the 4.0 leaf left behind instead of cloning again.
#[test]
fn mixed_matrix_reports_every_leaf_and_merges_to_fail() {
    let fixture = TestCache::new().expect("cache");
    let index = fixture
        .write_index(&serde_json::json!([
            {
                "path": "Alamofire",
                "repository": "Git",
                "url": "https://example.com/alamofire.git",
                "branch": "master",
                "compatibility": [
                    {"version": "4.0", "commit": SHA_A},
                    {"version": "5.0", "commit": SHA_B},
                ],
                "actions": [{
                    "action": "BuildSwiftPackage",
                    "configuration": "debug",
                    "xfail": {"issue": "SR-9999", "compatibility": "4.0"},
                }],
            },
            {
                "path": "Sourcery",
                "repository": "Git",
                "url": "https://example.com/sourcery.git",
                "branch": "main",
                "compatibility": [{"version": "5.0", "commit": SHA_C}],
                "actions": [{"action": "TestSwiftPackage"}],
            },
        ]))
        .expect("index");
    fixture.seed_work_tree("Alamofire").expect("seed");

    let config = config(index.clone(), fixture.cache());
    let executor = FakeExecutor::new();
    executor.set_stdout("rev-parse", SHA_A);
    executor.queue_failures("-swift-version -Xswiftc 4", &[1]);
    executor.queue_failures("swift test", &[70]);

    let projects = load_index(&index).expect("load");
    let set = Engine::new(&config, &executor)
        .run_matrix(&projects)
        .expect("matrix");

    assert_eq!(set.kind(), OutcomeKind::Fail);
    let mut messages: Vec<&str> = set.leaves().iter().map(|leaf| leaf.message.as_str()).collect();
    messages.sort_unstable();
    assert_eq!(
        messages,
        [
            "FAIL: Sourcery, 5.0, cccccc, Swift Package",
            "PASS: Alamofire, 5.0, bbbbbb, Swift Package",
            "XFAIL: SR-9999, Alamofire, 4.0, aaaaaa, Swift Package",
        ]
    );

    let summary = set.summary().to_string();
    assert!(
        summary.contains("XFailures:\n  XFAIL: SR-9999, Alamofire, 4.0, aaaaaa, Swift Package"),
        "{summary}"
    );
    assert!(
        summary.contains("Failures:\n  FAIL: Sourcery, 5.0, cccccc, Swift Package"),
        "{summary}"
    );
    assert!(summary.contains("     Passed: 1"), "{summary}");
    assert!(summary.contains("      Total: 3"), "{summary}");
    assert!(summary.contains("Repository Summary:\n      Total: 2"), "{summary}");
    assert!(
        summary.ends_with("Result: FAIL\n========================================"),
        "{summary}"
    );

    // The seeded Alamofire tree updates in place on both versions: clean,
    // compare HEAD, fetch only when it moved. Sourcery clones fresh.
    let calls = executor.calls();
    let position = |needle: &str| {
        calls
            .iter()
            .position(|call| call.contains(needle))
            .unwrap_or_else(|| panic!("missing {needle}: {calls:?}"))
    };
    let build_40 = position("-swift-version -Xswiftc 4");
    let fetch = position("fetch");
    let build_50 = position("-swift-version -Xswiftc 5");
    let clone = position("git clone");
    let test = position("swift test");
    assert!(
        build_40 < fetch && fetch < build_50 && build_50 < clone && clone < test,
        "{calls:?}"
    );
    assert_eq!(executor.calls_matching("git clone"), 1);
    assert_eq!(
        executor.calls_matching("git clone https://example.com/sourcery.git"),
        1
    );
}

/// A schema violation in the index file surfaces as a load error, so the
/// engine never sees a half-valid entry.
#[test]
fn schema_violation_surfaces_before_any_dispatch() {
    let fixture = TestCache::new().expect("cache");
    let index = fixture
        .write_index(&serde_json::json!([
            {"path": "Foo", "repository": "Git", "branch": "main"}
        ]))
        .expect("index");

    let err = load_index(&index).expect_err("must fail validation");
    assert!(err.to_string().contains("validation failed"), "{err:#}");
    assert!(err.to_string().contains("url"), "{err:#}");
}

/// A truncated commit passes the schema (any non-empty string does) but is
/// caught at the version gate: the run aborts as a configuration error
/// before any command has run.
#[test]
fn malformed_revision_aborts_without_running_commands() {
    let fixture = TestCache::new().expect("cache");
    let index = fixture
        .write_index(&serde_json::json!([{
            "path": "Foo",
            "repository": "Git",
            "url": "https://example.com/foo.git",
            "branch": "main",
            "compatibility": [{"version": "5.0", "commit": &SHA_A[..39]}],
            "actions": [{"action": "TestSwiftPackage"}],
        }]))
        .expect("index");

    let config = config(index.clone(), fixture.cache());
    let executor = FakeExecutor::new();
    let projects = load_index(&index).expect("load");

    let err = Engine::new(&config, &executor)
        .run_matrix(&projects)
        .expect_err("must abort");
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::MalformedRevision { .. })
    ));
    assert!(executor.calls().is_empty());
}

/// Determinism-check lifecycle over a loaded index: full build of the
/// first commit, incremental build of the second, a build-state snapshot
/// after each step.
#[test]
fn incremental_sequence_passes_and_snapshots_every_step() {
    let fixture = TestCache::new().expect("cache");
    let index = fixture
        .write_index(&serde_json::json!([{
            "path": "Foo",
            "repository": "Git",
            "url": "https://example.com/foo.git",
            "branch": "main",
            "actions": [{"action": "BuildSwiftPackage", "configuration": "debug"}],
            "incremental": {"5.0": {"commits": [SHA_A, SHA_B]}},
        }]))
        .expect("index");
    fixture.seed_build_state("Foo").expect("seed");

    let config = config(index.clone(), fixture.cache());
    let executor = FakeExecutor::new();
    executor.set_stdout("rev-parse", SHA_A);

    let projects = load_index(&index).expect("load");
    let set = Checker::new(&config, &executor)
        .run_checks(&projects)
        .expect("checks");

    assert_eq!(set.kind(), OutcomeKind::Pass);
    let leaves = set.leaves();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].message, "PASS: Foo, 5.0, bbbbbb, Swift Package");
    assert!(
        set.summary()
            .to_string()
            .ends_with("Result: PASS\n========================================")
    );

    // One package clean for the full build only, one bare checkout plus
    // submodule update for the incremental step.
    assert_eq!(executor.calls_matching("swift build"), 2);
    assert_eq!(executor.calls_matching(" clean"), 1);
    assert_eq!(executor.calls_matching("submodule update"), 1);

    let snapshots = fixture.cache().join("Foo-incr");
    assert!(snapshots.join("build-state-000-full-aaaaaaa/app.o").is_file());
    assert!(snapshots.join("build-state-001-incr-bbbbbbb/app.o").is_file());
}
