//! Swift source-compatibility runner.
//!
//! Builds and tests a curated index of Swift projects against a toolchain
//! under test, classifies every action against known-failure expectations,
//! and (separately) checks that incremental builds reproduce full-build
//! state across pinned commit sequences. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (outcome algebra, selection
//!   predicates, the index data model, xfail resolution). No I/O, fully
//!   testable in isolation.
//! - **[`io`]**: Side-effecting operations (process execution, git, log
//!   files, command assembly, build-state snapshots). Isolated behind the
//!   [`io::process::Executor`] seam to enable scripting in tests.
//!
//! Orchestration modules ([`dispatch`], [`incremental`], [`pool`])
//! coordinate core logic with I/O to implement the CLI commands.

pub mod config;
pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod incremental;
pub mod io;
pub mod logging;
pub mod pool;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
