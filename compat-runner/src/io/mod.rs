//! Effectful edges of the engine: processes, git, logs, the index file,
//! command assembly, and build-state snapshots. Everything here is reached
//! through narrow seams so the core stays testable with scripted doubles.

pub mod action_log;
pub mod commands;
pub mod git;
pub mod index;
pub mod process;
pub mod snapshot;
